// Tratamento de erros ergonômico
use anyhow::{Context, Result};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;
use tracing_subscriber::EnvFilter;

use pingtun::args::{self, Command};
use pingtun::client::ClientSessionManager;
use pingtun::relay::RelayLoop;

/// Programa principal: sobe o relay ou o cliente do túnel.
/// Requer root ou CAP_NET_RAW (sockets RAW).
fn main() -> Result<()> {
    let cli = args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_names(true)
        .with_target(false)
        .init();

    // Ctrl+C pede o encerramento; os loops conferem a flag
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Erro ao configurar handler de Ctrl+C")?;

    match cli.command {
        Command::Relay(relay_args) => {
            let config = relay_args.into_config()?;
            info!(
                max_sessions = config.max_sessions,
                chunk_size = config.chunk_size,
                verify_checksum = config.verify_checksum,
                "iniciando relay"
            );
            RelayLoop::bind(config, running)
                .context("Falha ao abrir os sockets RAW do relay")?
                .run()?;
        }
        Command::Client(client_args) => {
            let config = client_args.into_config()?;
            let port = config.listen_port;
            ClientSessionManager::bind(config, running)
                .with_context(|| format!("Falha ao escutar na porta {port}"))?
                .run()?;
        }
    }

    Ok(())
}
