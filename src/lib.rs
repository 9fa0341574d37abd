//! Túnel TCP sobre ICMP Echo Request/Reply.
//!
//! O cliente aceita conexões TCP locais e envia os bytes em Echo Requests ao
//! relay; o relay abre a conexão TCP até o alvo e devolve a resposta em Echo
//! Replies. O encerramento de uma ponta viaja como `code = 1`.

pub mod args;
pub mod client;
pub mod config;
pub mod error;
pub mod icmp;
pub mod net;
pub mod relay;
pub mod session;

pub use error::{PacketError, TunnelError};
pub use icmp::{Code, Framing, MessageType, TunnelMessage};
pub use session::{Session, SessionKey};
