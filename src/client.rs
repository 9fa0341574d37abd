//! Lado cliente: aceita conexões TCP locais e tunela cada uma até o relay
//! em Echo Requests.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use mio::{Events, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, info_span, trace, warn};

use crate::config::{
    ClientConfig, DISPATCH_GRACE, EVENTS_CAPACITY, ICMP_BUFFER_SIZE, LISTEN_BACKLOG,
    SHUTDOWN_TICK,
};
use crate::error::TunnelError;
use crate::icmp::{self, Code, Framing, MessageType, TunnelMessage};
use crate::net::{self, IcmpSink};
use crate::session::{Session, SessionKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

const TCP_TOKEN: Token = Token(0);
const ICMP_TOKEN: Token = Token(1);
const LISTENER_TOKEN: Token = Token(0);

/// Uma conexão local tunelada: a conexão TCP e o socket ICMP da sessão.
pub struct SessionHandler<S> {
    session: Session,
    sink: S,
    buf: Vec<u8>,
}

impl<S: IcmpSink> SessionHandler<S> {
    /// `key.peer` é o relay; `key.target` o alvo final.
    pub fn new(tcp: TcpStream, sink: S, key: SessionKey, chunk_size: usize) -> Self {
        Self {
            session: Session::from_stream(key, tcp),
            sink,
            buf: vec![0u8; chunk_size],
        }
    }

    pub fn key(&self) -> SessionKey {
        self.session.key()
    }

    /// Dados (ou EOF) do cliente local: empacota e envia ao relay, um request
    /// por bloco, até esvaziar o socket.
    pub fn on_tcp_readable(&mut self) -> Flow {
        let key = self.key();
        loop {
            let n = match self.session.read_chunk(&mut self.buf) {
                Ok(None) => return Flow::Continue,
                Ok(Some(n)) => n,
                // Erro de leitura encerra como um EOF
                Err(e) => {
                    debug!(error = %e, "falha ao ler da conexão local");
                    0
                }
            };

            if n == 0 {
                info!("conexão local encerrada");
                self.send_teardown();
                return Flow::Close;
            }

            let chunk = &self.buf[..n];
            let pkt = icmp::encode(MessageType::EchoRequest, Code::Data, key.id, key.target, chunk);
            if let Err(e) = self.sink.send_packet(&pkt, key.peer) {
                // Um fragmento perdido já corrompe o fluxo
                warn!(error = %e, "falha ao enviar ICMP ao relay");
                self.send_teardown();
                return Flow::Close;
            }
            trace!(bytes = n, "local -> relay");

            if n < self.buf.len() {
                return Flow::Continue;
            }
        }
    }

    /// Mensagem recebida no socket ICMP da sessão.
    pub fn on_message(&mut self, msg: &TunnelMessage, source: Option<Ipv4Addr>) -> Flow {
        if !self.accepts(msg, source) {
            trace!(session = msg.session, dest = %msg.dest, "mensagem de fora da sessão");
            return Flow::Continue;
        }

        if msg.is_teardown() {
            info!("relay encerrou a sessão");
            return Flow::Close;
        }

        // App local fechou: avisa o relay para ele soltar o alvo
        if let Err(e) = self.session.forward(&msg.payload) {
            warn!(error = %e, "cliente local fechou a conexão");
            self.send_teardown();
            return Flow::Close;
        }
        trace!(bytes = msg.payload.len(), "relay -> local");
        Flow::Continue
    }

    /// Só replies marcados pelo relay, da nossa sessão e do nosso relay. O eco
    /// automático do kernel do relay não tem a marca.
    fn accepts(&self, msg: &TunnelMessage, source: Option<Ipv4Addr>) -> bool {
        let key = self.key();
        msg.is_relay_reply()
            && msg.session == key.id
            && msg.dest == key.target
            && source.is_none_or(|ip| ip == key.peer)
    }

    fn send_teardown(&self) {
        let key = self.key();
        let pkt = TunnelMessage::teardown(MessageType::EchoRequest, key.id, key.target).encode();
        if let Err(e) = self.sink.send_packet(&pkt, key.peer) {
            warn!(error = %e, "falha ao enviar encerramento ao relay");
        }
    }

    /// Fecha a conexão TCP; o socket ICMP cai junto com o handler.
    pub fn finish(self) {
        self.session.close();
    }
}

impl SessionHandler<Socket> {
    /// Loop de prontidão sobre a conexão local e o socket ICMP da sessão.
    pub fn run(mut self, verify_checksum: bool) {
        debug!(session = %self.key(), "sessão iniciada");
        if let Err(e) = self.poll_loop(verify_checksum) {
            error!(error = %e, "falha no loop da sessão");
        }
        self.finish();
    }

    fn poll_loop(&mut self, verify_checksum: bool) -> Result<(), TunnelError> {
        // O mio avisa só na borda: os dois lados leem até esvaziar
        self.session.set_nonblocking(true)?;
        self.sink.set_nonblocking(true)?;

        let mut poll = Poll::new()?;
        net::watch(poll.registry(), self.session.as_raw_fd(), TCP_TOKEN)?;
        net::watch(poll.registry(), self.sink.as_raw_fd(), ICMP_TOKEN)?;

        let mut events = Events::with_capacity(2);
        let mut icmp_buf = vec![0u8; ICMP_BUFFER_SIZE];
        loop {
            net::wait(&mut poll, &mut events, None)?;
            for event in events.iter() {
                let flow = match event.token() {
                    TCP_TOKEN => self.on_tcp_readable(),
                    _ => self.drain_icmp(&mut icmp_buf, verify_checksum),
                };
                if flow == Flow::Close {
                    return Ok(());
                }
            }
        }
    }

    fn drain_icmp(&mut self, buf: &mut [u8], verify_checksum: bool) -> Flow {
        loop {
            let n = match net::recv_packet(&self.sink, buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if net::is_drained(&e) => return Flow::Continue,
                Err(e) => {
                    warn!(error = %e, "erro na leitura do socket ICMP");
                    return Flow::Continue;
                }
            };

            // O socket RAW recebe todo ICMP do host; o filtro fica em `accepts`
            let flow = match icmp::decode_with(&buf[..n], Framing::Detect, verify_checksum) {
                Ok(decoded) => self.on_message(&decoded.message, decoded.source),
                Err(e) => {
                    trace!(error = %e, bytes = n, "pacote descartado");
                    Flow::Continue
                }
            };
            if flow == Flow::Close {
                return Flow::Close;
            }
        }
    }
}

/// Gera ids de sessão não nulos, a partir de uma semente.
#[derive(Debug)]
pub struct SessionIds {
    next: u16,
}

impl SessionIds {
    pub fn seeded(seed: u16) -> Self {
        Self { next: seed }
    }

    /// Semente a partir do PID, como o identificador de um ping.
    pub fn from_pid() -> Self {
        Self::seeded(std::process::id() as u16)
    }

    pub fn next_id(&mut self) -> u16 {
        if self.next == 0 {
            self.next = 1;
        }
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Resultado da entrega de uma sessão ao pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Started,
    /// Nenhum worker livre: o job foi descartado.
    Busy,
}

/// Pool fixo de threads. O canal tem capacidade zero: um job só entra se
/// algum worker estiver esperando, nunca fica numa fila.
pub struct WorkerPool {
    tx: Sender<Job>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> io::Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<Job>(0);

        for i in 0..size {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("sessao-{i}"))
                .spawn(move || worker(rx))?;
        }

        Ok(Self { tx, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Entrega o job a um worker livre, esperando no máximo `DISPATCH_GRACE`.
    /// Com todos ocupados o job é descartado junto com o que ele captura.
    pub fn execute<F>(&self, job: F) -> Result<Dispatch, TunnelError>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.tx.send_timeout(Box::new(job), DISPATCH_GRACE) {
            Ok(()) => Ok(Dispatch::Started),
            Err(SendTimeoutError::Timeout(_)) => Ok(Dispatch::Busy),
            Err(SendTimeoutError::Disconnected(_)) => {
                Err(TunnelError::Io(io::Error::other("pool de sessões encerrado")))
            }
        }
    }
}

fn worker(rx: Receiver<Job>) {
    for job in rx.iter() {
        job();
    }
}

/// Aceita conexões locais e entrega cada uma a um handler no pool.
pub struct ClientSessionManager {
    listener: TcpListener,
    config: ClientConfig,
    pool: WorkerPool,
    ids: SessionIds,
    running: Arc<AtomicBool>,
}

impl ClientSessionManager {
    pub fn bind(config: ClientConfig, running: Arc<AtomicBool>) -> Result<Self, TunnelError> {
        let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_reuse_address(true)?;
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.listen_port);
        sock.bind(&addr.into())?;
        sock.listen(LISTEN_BACKLOG)?;
        sock.set_nonblocking(true)?;

        let pool = WorkerPool::new(config.workers)?;
        Ok(Self {
            listener: sock.into(),
            config,
            pool,
            ids: SessionIds::from_pid(),
            running,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(mut self) -> Result<(), TunnelError> {
        info!(
            relay = %self.config.relay,
            target = %self.config.target,
            listen = %self.local_addr()?,
            workers = self.pool.size(),
            "cliente pronto"
        );

        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        net::watch(poll.registry(), self.listener.as_raw_fd(), LISTENER_TOKEN)?;

        while self.running.load(Ordering::SeqCst) {
            net::wait(&mut poll, &mut events, Some(SHUTDOWN_TICK))?;
            if !events.is_empty() {
                self.accept_pending()?;
            }
        }

        info!("encerrando cliente");
        Ok(())
    }

    /// Aceita tudo o que está no backlog.
    fn accept_pending(&mut self) -> Result<(), TunnelError> {
        loop {
            let (tcp, addr) = match self.listener.accept() {
                Ok(v) => v,
                Err(e) if net::is_drained(&e) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "falha ao aceitar conexão");
                    return Ok(());
                }
            };

            let key = SessionKey::new(self.config.relay, self.ids.next_id(), self.config.target);
            info!(%addr, session = %key, "nova conexão local");

            let chunk_size = self.config.chunk_size;
            let verify = self.config.verify_checksum;
            let dispatch = self.pool.execute(move || serve(tcp, key, chunk_size, verify))?;
            if dispatch == Dispatch::Busy {
                // O job descartado levou o `tcp`: o app local recebe o fechamento
                let workers = self.pool.size();
                warn!(%addr, session = %key, workers, "nenhum worker livre, conexão recusada");
            }
        }
    }
}

fn serve(tcp: TcpStream, key: SessionKey, chunk_size: usize, verify_checksum: bool) {
    let _span = info_span!("session", id = key.id).entered();

    let sock = match net::icmp_socket() {
        Ok(sock) => sock,
        Err(e) => {
            error!(error = %e, "não foi possível abrir o socket ICMP da sessão");
            return;
        }
    };
    SessionHandler::new(tcp, sock, key, chunk_size).run(verify_checksum);
}
