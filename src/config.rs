use std::net::{Ipv4Addr, SocketAddrV4, ToSocketAddrs};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};

use crate::icmp::MAX_PAYLOAD;

/// Leitura máxima de TCP por fragmento.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Buffer de recepção ICMP (datagrama IPv4 máximo).
pub const ICMP_BUFFER_SIZE: usize = 65_535;

pub const DEFAULT_MAX_SESSIONS: usize = 64;
pub const DEFAULT_WORKERS: usize = 16;

/// Limite para abrir a conexão TCP com o alvo.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Intervalo em que os loops conferem o pedido de encerramento (Ctrl+C).
pub const SHUTDOWN_TICK: Duration = Duration::from_millis(500);

/// Quanto o accept espera por um worker livre antes de recusar a conexão.
pub const DISPATCH_GRACE: Duration = Duration::from_millis(200);

/// Eventos lidos por volta do `mio::Poll`.
pub const EVENTS_CAPACITY: usize = 256;

/// Backlog do listener local (o mesmo `listen(5)` de sempre).
pub const LISTEN_BACKLOG: i32 = 5;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_sessions: usize,
    pub chunk_size: usize,
    pub verify_checksum: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            verify_checksum: true,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_sessions >= 1, "--max-sessions precisa ser pelo menos 1");
        validate_chunk(self.chunk_size)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endereço do relay (destino dos Echo Requests).
    pub relay: Ipv4Addr,
    pub listen_port: u16,
    /// Alvo final, já resolvido para IPv4.
    pub target: SocketAddrV4,
    pub workers: usize,
    pub chunk_size: usize,
    pub verify_checksum: bool,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.workers >= 1, "--workers precisa ser pelo menos 1");
        validate_chunk(self.chunk_size)
    }
}

fn validate_chunk(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 || chunk_size > MAX_PAYLOAD {
        bail!("--chunk-size deve estar entre 1 e {MAX_PAYLOAD}, recebido {chunk_size}");
    }
    Ok(())
}

/// Resolve um host (literal ou nome) para o primeiro endereço IPv4.
pub fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddrV4> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddrV4::new(ip, port));
    }

    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("Falha ao resolver {host}"))?
        .find_map(|addr| match addr {
            std::net::SocketAddr::V4(v4) => Some(v4),
            std::net::SocketAddr::V6(_) => None,
        })
        .with_context(|| format!("{host} não tem endereço IPv4"))
}
