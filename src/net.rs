//! Sockets RAW de ICMP e registro de descritores no `mio::Poll`.

use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::TunnelError;

/// Destino de pacotes ICMP já codificados.
pub trait IcmpSink {
    fn send_packet(&self, packet: &[u8], dst: Ipv4Addr) -> io::Result<()>;
}

impl IcmpSink for Socket {
    fn send_packet(&self, packet: &[u8], dst: Ipv4Addr) -> io::Result<()> {
        // Porta 0 é ignorada para ICMP
        let dst_sa = SocketAddr::new(IpAddr::V4(dst), 0);
        self.send_to(packet, &dst_sa.into())?;
        Ok(())
    }
}

impl<T: IcmpSink + ?Sized> IcmpSink for &T {
    fn send_packet(&self, packet: &[u8], dst: Ipv4Addr) -> io::Result<()> {
        (**self).send_packet(packet, dst)
    }
}

/// Cria um socket ICMP RAW (AF_INET, SOCK_RAW, IPPROTO_ICMP).
///
/// Exige root ou CAP_NET_RAW; a falta de permissão vira `TunnelError::Privilege`.
pub fn icmp_socket() -> Result<Socket, TunnelError> {
    Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            TunnelError::Privilege(e)
        } else {
            TunnelError::Io(e)
        }
    })
}

/// Socket de escuta do relay: ligado a 0.0.0.0, com IP_HDRINCL e não bloqueante.
pub fn relay_listen_socket() -> Result<Socket, TunnelError> {
    let sock = icmp_socket()?;
    let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    sock.bind(&any.into())?;
    sock.set_header_included_v4(true)?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

/// Lê um datagrama inteiro. A origem sai do cabeçalho IP que o kernel entrega.
pub fn recv_packet(sock: &Socket, buf: &mut [u8]) -> io::Result<usize> {
    let mut reader = sock;
    reader.read(buf)
}

/// Registra um descritor para leitura no `Poll`.
pub fn watch(registry: &Registry, fd: RawFd, token: Token) -> io::Result<()> {
    registry.register(&mut SourceFd(&fd), token, Interest::READABLE)
}

/// Espera eventos; um EINTR volta sem eventos.
pub fn wait(poll: &mut Poll, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
    match poll.poll(events, timeout) {
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {
            events.clear();
            Ok(())
        }
        other => other,
    }
}

/// Leitura sem dados prontos num socket não bloqueante.
pub fn is_drained(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    fn tokens(events: &Events) -> Vec<Token> {
        events.iter().map(|e| e.token()).collect()
    }

    #[test]
    fn watched_socket_wakes_only_its_token() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let mut poll = Poll::new().unwrap();
        let mut events = Events::with_capacity(8);
        watch(poll.registry(), listener.as_raw_fd(), Token(0)).unwrap();
        watch(poll.registry(), server.as_raw_fd(), Token(1)).unwrap();

        wait(&mut poll, &mut events, Some(Duration::from_millis(10))).unwrap();
        assert!(tokens(&events).is_empty());

        client.write_all(b"ping").unwrap();
        wait(&mut poll, &mut events, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(tokens(&events), vec![Token(1)]);
    }

    #[test]
    fn hangup_wakes_the_poll() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let mut poll = Poll::new().unwrap();
        let mut events = Events::with_capacity(8);
        watch(poll.registry(), server.as_raw_fd(), Token(3)).unwrap();
        drop(client);

        wait(&mut poll, &mut events, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(tokens(&events), vec![Token(3)]);
    }

    #[test]
    fn would_block_means_drained() {
        assert!(is_drained(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!is_drained(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_drained(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }
}
