use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::config::{
    self, ClientConfig, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_SESSIONS, DEFAULT_WORKERS, RelayConfig,
};

/// Túnel TCP sobre ICMP Echo.
#[derive(Parser, Debug)]
#[command(name = "pingtun", version, about)]
pub struct Cli {
    /// Nível de log (trace, debug, info, warn, error); RUST_LOG tem prioridade
    #[arg(short = 'v', long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Servidor do túnel: recebe ICMP e abre as conexões TCP até o alvo
    Relay(RelayArgs),
    /// Cliente: escuta TCP local e tunela até o relay
    Client(ClientArgs),
}

#[derive(Args, Debug)]
pub struct RelayArgs {
    /// Máximo de sessões simultâneas
    #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
    pub max_sessions: usize,

    /// Bytes lidos do TCP por pacote ICMP
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Aceita pacotes com checksum inválido
    #[arg(long)]
    pub no_verify_checksum: bool,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Host onde o relay está rodando
    #[arg(long)]
    pub tunnel_host: String,

    /// Porta TCP local para as conexões de entrada
    #[arg(long)]
    pub listen_port: u16,

    /// Host do alvo final
    #[arg(long)]
    pub target_host: String,

    /// Porta do alvo final
    #[arg(long)]
    pub target_port: u16,

    /// Sessões atendidas em paralelo
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Bytes lidos do TCP por pacote ICMP
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Aceita pacotes com checksum inválido
    #[arg(long)]
    pub no_verify_checksum: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

impl RelayArgs {
    pub fn into_config(self) -> Result<RelayConfig> {
        let config = RelayConfig {
            max_sessions: self.max_sessions,
            chunk_size: self.chunk_size,
            verify_checksum: !self.no_verify_checksum,
        };
        config.validate()?;
        Ok(config)
    }
}

impl ClientArgs {
    /// Resolve relay e alvo para IPv4; falha logo se algum não resolver.
    pub fn into_config(self) -> Result<ClientConfig> {
        let relay = config::resolve_ipv4(&self.tunnel_host, 0)
            .context("Endereço do relay inválido")?;
        let target = config::resolve_ipv4(&self.target_host, self.target_port)
            .context("Endereço do alvo inválido")?;

        let config = ClientConfig {
            relay: *relay.ip(),
            listen_port: self.listen_port,
            target,
            workers: self.workers,
            chunk_size: self.chunk_size,
            verify_checksum: !self.no_verify_checksum,
        };
        config.validate()?;
        Ok(config)
    }
}
