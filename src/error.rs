use std::io;

use thiserror::Error;

use crate::session::SessionKey;

/// Erros de decodificação de um pacote do túnel.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("pacote malformado: {len} bytes, mínimo {min}")]
    Malformed { len: usize, min: usize },

    #[error("checksum inválido: recebido {received:#06x}, calculado {computed:#06x}")]
    ChecksumMismatch { received: u16, computed: u16 },

    #[error("tipo ICMP não suportado: {0}")]
    UnsupportedType(u8),

    #[error("código de controle desconhecido: {0}")]
    UnsupportedCode(u8),

    /// Echo Request com sequência: ping comum, não é tráfego do túnel.
    #[error("sequência {0} fora do túnel")]
    ForeignSequence(u16),
}

/// Erros de operação do túnel (relay e cliente).
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("sessão {session}: {source}")]
    SessionIo {
        session: SessionKey,
        #[source]
        source: io::Error,
    },

    #[error("sem privilégio para abrir socket RAW (execute como root ou com CAP_NET_RAW): {0}")]
    Privilege(#[source] io::Error),

    #[error("erro de E/S: {0}")]
    Io(#[from] io::Error),
}
