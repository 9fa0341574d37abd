//! Lado servidor: traduz Echo Requests em conexões TCP até o alvo e devolve
//! o que o alvo responde em Echo Replies.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::{Events, Poll, Token};
use socket2::Socket;
use tracing::{debug, info, trace, warn};

use crate::config::{
    CONNECT_TIMEOUT, EVENTS_CAPACITY, ICMP_BUFFER_SIZE, RelayConfig, SHUTDOWN_TICK,
};
use crate::error::{PacketError, TunnelError};
use crate::icmp::{self, Code, Framing, HEADER_LEN, IPV4_MIN_HEADER_LEN, MessageType, TunnelMessage};
use crate::net::{self, IcmpSink};
use crate::session::{Session, SessionKey};

/// O que o relay fez com uma mensagem recebida.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Não era tráfego para o relay (reply nosso, encerramento sem sessão).
    Ignored,
    /// Primeira mensagem de dados: conexão TCP aberta.
    Opened,
    Forwarded,
    Closed,
    /// A sessão não pôde ser atendida; o cliente recebeu um encerramento.
    Rejected,
}

/// Tabela de sessões do relay, indexada por (par, id, destino).
pub struct Relay<S> {
    sink: S,
    sessions: HashMap<SessionKey, Session>,
    /// Sessões abertas desde a última consulta do loop.
    opened: Vec<SessionKey>,
    config: RelayConfig,
    buf: Vec<u8>,
}

impl<S: IcmpSink> Relay<S> {
    pub fn new(sink: S, config: RelayConfig) -> Self {
        let buf = vec![0u8; config.chunk_size];
        Self {
            sink,
            sessions: HashMap::new(),
            opened: Vec::new(),
            config,
            buf,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn session(&self, key: &SessionKey) -> Option<&Session> {
        self.sessions.get(key)
    }

    /// Devolve (e esquece) as sessões abertas desde a última chamada.
    pub fn take_opened(&mut self) -> Vec<SessionKey> {
        std::mem::take(&mut self.opened)
    }

    /// Aplica uma mensagem recebida do canal ICMP vinda de `source`.
    pub fn handle_message(&mut self, msg: TunnelMessage, source: Ipv4Addr) -> Inbound {
        if msg.kind == MessageType::EchoReply {
            // Raw socket enxerga as nossas próprias respostas
            trace!(%source, "echo reply recebido, ignorando");
            return Inbound::Ignored;
        }

        let key = SessionKey::new(source, msg.session, msg.dest);
        match msg.code {
            // Encerramento do cliente: fecha sem responder
            Code::Teardown => match self.sessions.remove(&key) {
                Some(session) => {
                    info!(session = %key, "cliente encerrou a sessão");
                    session.close();
                    Inbound::Closed
                }
                None => {
                    debug!(session = %key, "encerramento sem sessão ativa");
                    Inbound::Ignored
                }
            },
            Code::Data => self.forward_to_target(key, &msg.payload),
        }
    }

    fn forward_to_target(&mut self, key: SessionKey, payload: &[u8]) -> Inbound {
        let full = self.sessions.len() >= self.config.max_sessions;
        let mut outcome = Inbound::Forwarded;

        // Sessão existente ou conexão nova até o alvo
        let session = match self.sessions.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if full {
                    let max = self.config.max_sessions;
                    warn!(session = %key, max, "limite de sessões atingido");
                    send_teardown(&self.sink, key);
                    return Inbound::Rejected;
                }
                match Session::connect(key, CONNECT_TIMEOUT) {
                    Ok(session) => {
                        info!(session = %key, "nova conexão TCP com o alvo");
                        outcome = Inbound::Opened;
                        self.opened.push(key);
                        entry.insert(session)
                    }
                    Err(e) => {
                        warn!(error = %e, "falha ao conectar no alvo");
                        send_teardown(&self.sink, key);
                        return Inbound::Rejected;
                    }
                }
            }
        };

        // Alvo não aceita mais dados: derruba a sessão e avisa o cliente
        if let Err(e) = session.forward(payload) {
            warn!(error = %e, "falha ao escrever no alvo");
            self.end_session(key);
            return Inbound::Rejected;
        }
        trace!(session = %key, bytes = payload.len(), "cliente -> alvo");
        outcome
    }

    /// A conexão TCP da sessão ficou legível: lê tudo o que houver e devolve
    /// ao cliente, um reply por bloco.
    pub fn handle_readable(&mut self, key: SessionKey) {
        loop {
            let Some(session) = self.sessions.get_mut(&key) else {
                return;
            };

            match session.read_chunk(&mut self.buf) {
                Ok(None) => return,
                Ok(Some(0)) => {
                    info!(session = %key, "alvo fechou a conexão");
                    self.end_session(key);
                    return;
                }
                Ok(Some(n)) => {
                    let pkt = icmp::encode_reply(Code::Data, key.id, key.target, &self.buf[..n]);
                    send(&self.sink, key, &pkt);
                    trace!(session = %key, bytes = n, "alvo -> cliente");
                    // Leitura curta: o buffer do socket esvaziou
                    if n < self.buf.len() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "falha ao ler do alvo");
                    self.end_session(key);
                    return;
                }
            }
        }
    }

    /// Fecha a sessão e avisa o cliente.
    pub fn end_session(&mut self, key: SessionKey) {
        if let Some(session) = self.sessions.remove(&key) {
            session.close();
        }
        send_teardown(&self.sink, key);
    }

    /// Encerra todas as sessões, avisando cada cliente.
    pub fn shutdown(&mut self) {
        let keys: Vec<SessionKey> = self.sessions.keys().copied().collect();
        for key in keys {
            self.end_session(key);
        }
    }
}

fn send_teardown<S: IcmpSink>(sink: &S, key: SessionKey) {
    let pkt = icmp::encode_reply(Code::Teardown, key.id, key.target, &[]);
    send(sink, key, &pkt);
}

fn send<S: IcmpSink>(sink: &S, key: SessionKey, pkt: &[u8]) {
    if let Err(e) = sink.send_packet(pkt, key.peer) {
        warn!(session = %key, error = %e, "falha ao enviar ICMP");
    }
}

/// Decodifica um datagrama do socket de escuta (com cabeçalho IP) e descarta
/// o que não é tráfego do túnel.
pub fn parse_inbound(
    buf: &[u8],
    verify_checksum: bool,
) -> Result<(TunnelMessage, Ipv4Addr), TunnelError> {
    let decoded = icmp::decode_with(buf, Framing::IpHeader, verify_checksum)?;
    let msg = decoded.message;

    // Ping comum tem sequência; o request do túnel sempre manda 0
    if msg.kind == MessageType::EchoRequest && msg.sequence != 0 {
        return Err(PacketError::ForeignSequence(msg.sequence).into());
    }

    let source = decoded.source.ok_or(PacketError::Malformed {
        len: buf.len(),
        min: IPV4_MIN_HEADER_LEN + HEADER_LEN,
    })?;
    Ok((msg, source))
}

const LISTEN_TOKEN: Token = Token(0);

/// Loop de prontidão do relay: um socket ICMP de escuta mais uma conexão TCP
/// por sessão ativa, todos no mesmo `mio::Poll`.
pub struct RelayLoop {
    listen: Socket,
    relay: Relay<Socket>,
    poll: Poll,
    tokens: HashMap<Token, SessionKey>,
    next_token: usize,
    verify_checksum: bool,
    running: Arc<AtomicBool>,
}

impl RelayLoop {
    /// Abre o par de sockets RAW (escuta com cabeçalho IP, envio).
    pub fn bind(config: RelayConfig, running: Arc<AtomicBool>) -> Result<Self, TunnelError> {
        let listen = net::relay_listen_socket()?;
        let send = net::icmp_socket()?;
        warn_if_kernel_echoes();

        let poll = Poll::new()?;
        net::watch(poll.registry(), listen.as_raw_fd(), LISTEN_TOKEN)?;

        Ok(Self {
            listen,
            verify_checksum: config.verify_checksum,
            relay: Relay::new(send, config),
            poll,
            tokens: HashMap::new(),
            next_token: LISTEN_TOKEN.0 + 1,
            running,
        })
    }

    pub fn run(mut self) -> Result<(), TunnelError> {
        info!("Aguardando pacotes ICMP...");
        let mut buf = vec![0u8; ICMP_BUFFER_SIZE];
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while self.running.load(Ordering::SeqCst) {
            net::wait(&mut self.poll, &mut events, Some(SHUTDOWN_TICK))?;

            // TCP primeiro: o ICMP pode criar ou remover sessões
            let mut icmp_ready = false;
            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => icmp_ready = true,
                    token => {
                        if let Some(&key) = self.tokens.get(&token) {
                            self.relay.handle_readable(key);
                        }
                    }
                }
            }
            if icmp_ready {
                self.drain_icmp(&mut buf);
            }

            self.sync_tokens();
        }

        info!(sessions = self.relay.session_count(), "encerrando relay");
        self.relay.shutdown();
        Ok(())
    }

    /// Lê o socket de escuta até esvaziar (o `mio` avisa só na borda).
    fn drain_icmp(&mut self, buf: &mut [u8]) {
        loop {
            let n = match net::recv_packet(&self.listen, buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if net::is_drained(&e) => return,
                Err(e) => {
                    warn!(error = %e, "erro na leitura do socket ICMP");
                    return;
                }
            };

            match parse_inbound(&buf[..n], self.verify_checksum) {
                Ok((msg, source)) => {
                    self.relay.handle_message(msg, source);
                }
                Err(e) => trace!(error = %e, bytes = n, "pacote descartado"),
            }
        }
    }

    /// Registra as sessões novas e esquece os tokens das encerradas.
    fn sync_tokens(&mut self) {
        for key in self.relay.take_opened() {
            // A chave pode ter sido reaberta: o token antigo é de outro fd
            self.tokens.retain(|_, k| *k != key);
            let Some(session) = self.relay.session(&key) else {
                continue;
            };

            let token = Token(self.next_token);
            self.next_token += 1;
            let watched = session.set_nonblocking(true).and_then(|()| {
                net::watch(self.poll.registry(), session.as_raw_fd(), token).map_err(Into::into)
            });
            match watched {
                Ok(()) => {
                    self.tokens.insert(token, key);
                }
                Err(e) => {
                    warn!(session = %key, error = %e, "não foi possível observar a sessão");
                    self.relay.end_session(key);
                }
            }
        }

        // fd fechado já saiu do epoll; só falta o mapa
        let relay = &self.relay;
        self.tokens.retain(|_, key| relay.contains(key));
    }
}

/// Se o kernel responde aos pings, o cliente recebe uma cópia dos próprios
/// dados; o cliente descarta essas cópias, mas o tráfego dobra.
fn warn_if_kernel_echoes() {
    let path = "/proc/sys/net/ipv4/icmp_echo_ignore_all";
    if let Ok(value) = std::fs::read_to_string(path) {
        if value.trim() == "0" {
            warn!(
                "o kernel responde a echo requests; \
                 use `sysctl -w net.ipv4.icmp_echo_ignore_all=1`"
            );
        }
    }
}
