use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::TunnelError;
use crate::net;

/// Identidade de uma sessão: quem fala, qual id, para onde vai.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// No relay é o IP do cliente; no cliente é o IP do relay.
    pub peer: Ipv4Addr,
    pub id: u16,
    pub target: SocketAddrV4,
}

impl SessionKey {
    pub fn new(peer: Ipv4Addr, id: u16, target: SocketAddrV4) -> Self {
        Self { peer, id, target }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}->{}", self.peer, self.id, self.target)
    }
}

/// Estado de encaminhamento de um fluxo TCP tunelado.
///
/// A sessão é dona exclusiva da conexão TCP; `close` a encerra.
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    tcp: TcpStream,
    opened: Instant,
    bytes_in: u64,
    bytes_out: u64,
}

impl Session {
    /// Abre a conexão TCP até o alvo da chave.
    pub fn connect(key: SessionKey, timeout: Duration) -> Result<Self, TunnelError> {
        let tcp = TcpStream::connect_timeout(&SocketAddr::V4(key.target), timeout)
            .map_err(|source| session_error(key, source))?;
        Ok(Self::from_stream(key, tcp))
    }

    pub fn from_stream(key: SessionKey, tcp: TcpStream) -> Self {
        Self {
            key,
            tcp,
            opened: Instant::now(),
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Modo usado pelos loops de prontidão.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), TunnelError> {
        self.tcp
            .set_nonblocking(nonblocking)
            .map_err(|source| session_error(self.key, source))
    }

    /// Escreve um payload vindo do túnel na conexão TCP.
    ///
    /// Não há controle de fluxo no túnel: se o buffer do par encher, espera
    /// ele drenar em modo bloqueante.
    pub fn forward(&mut self, payload: &[u8]) -> Result<(), TunnelError> {
        let key = self.key;
        let mut rest = payload;
        while !rest.is_empty() {
            match self.tcp.write(rest) {
                Ok(0) => {
                    return Err(session_error(key, io::Error::from(io::ErrorKind::WriteZero)));
                }
                Ok(n) => rest = &rest[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.write_blocking(rest)?;
                    break;
                }
                Err(e) => return Err(session_error(key, e)),
            }
        }
        self.bytes_out += payload.len() as u64;
        Ok(())
    }

    fn write_blocking(&mut self, rest: &[u8]) -> Result<(), TunnelError> {
        self.set_nonblocking(false)?;
        let written = self.tcp.write_all(rest);
        self.set_nonblocking(true)?;
        written.map_err(|source| session_error(self.key, source))
    }

    /// Lê até `buf.len()` bytes da conexão TCP.
    ///
    /// `Some(0)` é EOF; `None` quando não há nada para ler agora.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TunnelError> {
        loop {
            match self.tcp.read(buf) {
                Ok(n) => {
                    self.bytes_in += n as u64;
                    return Ok(Some(n));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if net::is_drained(&e) => return Ok(None),
                Err(e) => return Err(session_error(self.key, e)),
            }
        }
    }

    pub fn close(self) {
        // O par pode já ter fechado
        let _ = self.tcp.shutdown(Shutdown::Both);
        debug!(
            session = %self.key,
            bytes_in = self.bytes_in,
            bytes_out = self.bytes_out,
            elapsed_ms = self.opened.elapsed().as_millis() as u64,
            "sessão encerrada"
        );
    }
}

fn session_error(session: SessionKey, source: io::Error) -> TunnelError {
    TunnelError::SessionIo { session, source }
}

impl AsRawFd for Session {
    fn as_raw_fd(&self) -> RawFd {
        self.tcp.as_raw_fd()
    }
}
