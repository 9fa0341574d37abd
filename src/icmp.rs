//! Codec das mensagens do túnel transportadas em pacotes ICMP Echo.
//!
//! Layout do cabeçalho fixo (14 bytes), seguido do payload:
//!
//! ```text
//! 0   tipo (0 = Echo Reply, 8 = Echo Request)
//! 1   código (0 = dados, 1 = encerramento)
//! 2   checksum (RFC 1071)
//! 4   identificador (id da sessão, 0 = sem sessão)
//! 6   sequência (0 no request; `REPLY_SEQUENCE` nos replies do relay)
//! 8   IPv4 de destino
//! 12  porta de destino
//! 14  payload
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::PacketError;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_ECHO_REQUEST: u8 = 8;

/// Sequência dos replies gerados pelo relay. O eco automático do kernel copia
/// a sequência 0 do request, então nunca carrega esta marca.
pub const REPLY_SEQUENCE: u16 = 1;

/// Tamanho do cabeçalho fixo do túnel.
pub const HEADER_LEN: usize = 14;

/// Menor cabeçalho IPv4 possível (IHL = 5).
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Maior payload que cabe num datagrama IPv4 sem opções.
pub const MAX_PAYLOAD: usize = 65_535 - IPV4_MIN_HEADER_LEN - HEADER_LEN;

/// Direção da mensagem: Echo Request vai do cliente ao relay, Echo Reply volta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    EchoReply,
    EchoRequest,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::EchoReply => ICMP_ECHO_REPLY,
            MessageType::EchoRequest => ICMP_ECHO_REQUEST,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            ICMP_ECHO_REPLY => Ok(MessageType::EchoReply),
            ICMP_ECHO_REQUEST => Ok(MessageType::EchoRequest),
            other => Err(PacketError::UnsupportedType(other)),
        }
    }
}

/// Sinal de controle carregado no campo `code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Code {
    #[default]
    Data,
    Teardown,
}

impl Code {
    pub fn as_u8(self) -> u8 {
        match self {
            Code::Data => 0,
            Code::Teardown => 1,
        }
    }
}

impl TryFrom<u8> for Code {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Code::Data),
            1 => Ok(Code::Teardown),
            other => Err(PacketError::UnsupportedCode(other)),
        }
    }
}

/// Como tratar o cabeçalho IP na recepção. Depende do papel do endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// O buffer sempre começa com um cabeçalho IPv4 (socket de escuta do relay).
    IpHeader,
    /// O buffer começa direto no cabeçalho do túnel.
    Bare,
    /// Sem cabeçalho esperado, mas remove um IPv4 se o SO o incluir.
    Detect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelMessage {
    pub kind: MessageType,
    pub code: Code,
    /// Identificador da sessão do cliente (campo identifier do ICMP).
    pub session: u16,
    pub sequence: u16,
    pub dest: SocketAddrV4,
    pub payload: Vec<u8>,
}

impl TunnelMessage {
    pub fn data(kind: MessageType, session: u16, dest: SocketAddrV4, payload: &[u8]) -> Self {
        Self {
            kind,
            code: Code::Data,
            session,
            sequence: 0,
            dest,
            payload: payload.to_vec(),
        }
    }

    pub fn teardown(kind: MessageType, session: u16, dest: SocketAddrV4) -> Self {
        Self {
            kind,
            code: Code::Teardown,
            session,
            sequence: 0,
            dest,
            payload: Vec::new(),
        }
    }

    pub fn with_sequence(mut self, sequence: u16) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn is_teardown(&self) -> bool {
        self.code == Code::Teardown
    }

    /// Reply com a marca do relay.
    pub fn is_relay_reply(&self) -> bool {
        self.kind == MessageType::EchoReply && self.sequence == REPLY_SEQUENCE
    }

    pub fn encode(&self) -> Vec<u8> {
        build(self.kind, self.code, self.session, self.sequence, self.dest, &self.payload)
    }
}

/// Resultado da decodificação, com os metadados de recepção.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub message: TunnelMessage,
    /// Checksum como transmitido.
    pub checksum: u16,
    /// IP de origem, quando o buffer trazia o cabeçalho IP.
    pub source: Option<Ipv4Addr>,
}

/// Monta o pacote completo (cabeçalho fixo + payload) com o checksum preenchido.
/// A sequência vai zerada, como nos requests do cliente.
pub fn encode(
    kind: MessageType,
    code: Code,
    session: u16,
    dest: SocketAddrV4,
    payload: &[u8],
) -> Vec<u8> {
    build(kind, code, session, 0, dest, payload)
}

/// Echo Reply do relay, marcado com `REPLY_SEQUENCE`.
pub fn encode_reply(code: Code, session: u16, dest: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    build(MessageType::EchoReply, code, session, REPLY_SEQUENCE, dest, payload)
}

fn build(
    kind: MessageType,
    code: Code,
    session: u16,
    sequence: u16,
    dest: SocketAddrV4,
    payload: &[u8],
) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(HEADER_LEN + payload.len());

    // Tipo, código e checksum zerado
    pkt.extend_from_slice(&[kind.as_u8(), code.as_u8(), 0, 0]);

    // Identificador e sequência (big-endian)
    pkt.extend_from_slice(&session.to_be_bytes());
    pkt.extend_from_slice(&sequence.to_be_bytes());

    // Destino lógico do túnel
    pkt.extend_from_slice(&dest.ip().octets());
    pkt.extend_from_slice(&dest.port().to_be_bytes());

    pkt.extend_from_slice(payload);

    let csum = checksum(&pkt);
    pkt[2..4].copy_from_slice(&csum.to_be_bytes());

    pkt
}

/// Decodifica e valida o checksum.
pub fn decode(buf: &[u8], framing: Framing) -> Result<Decoded, PacketError> {
    parse(buf, framing, true)
}

/// Decodifica conferindo ou não o checksum, conforme a configuração.
pub fn decode_with(
    buf: &[u8],
    framing: Framing,
    verify_checksum: bool,
) -> Result<Decoded, PacketError> {
    parse(buf, framing, verify_checksum)
}

/// Decodifica sem conferir o checksum.
pub fn decode_unverified(buf: &[u8], framing: Framing) -> Result<Decoded, PacketError> {
    parse(buf, framing, false)
}

fn parse(buf: &[u8], framing: Framing, verify_checksum: bool) -> Result<Decoded, PacketError> {
    let (icmp, source) = strip_ip_header(buf, framing)?;
    if icmp.len() < HEADER_LEN {
        return Err(PacketError::Malformed {
            len: icmp.len(),
            min: HEADER_LEN,
        });
    }

    let kind = MessageType::try_from(icmp[0])?;
    let code = Code::try_from(icmp[1])?;
    let checksum = u16::from_be_bytes([icmp[2], icmp[3]]);

    if verify_checksum {
        let computed = checksum_without_field(icmp);
        if computed != checksum {
            return Err(PacketError::ChecksumMismatch {
                received: checksum,
                computed,
            });
        }
    }

    let session = u16::from_be_bytes([icmp[4], icmp[5]]);
    let sequence = u16::from_be_bytes([icmp[6], icmp[7]]);
    let ip = Ipv4Addr::new(icmp[8], icmp[9], icmp[10], icmp[11]);
    let port = u16::from_be_bytes([icmp[12], icmp[13]]);

    Ok(Decoded {
        message: TunnelMessage {
            kind,
            code,
            session,
            sequence,
            dest: SocketAddrV4::new(ip, port),
            payload: icmp[HEADER_LEN..].to_vec(),
        },
        checksum,
        source,
    })
}

fn strip_ip_header(
    buf: &[u8],
    framing: Framing,
) -> Result<(&[u8], Option<Ipv4Addr>), PacketError> {
    let has_header = match framing {
        Framing::IpHeader => true,
        Framing::Bare => false,
        // Os tipos 0 e 8 têm o nibble alto zerado; 4 só aparece num cabeçalho IPv4
        Framing::Detect => buf.first().is_some_and(|b| b >> 4 == 4),
    };
    if !has_header {
        return Ok((buf, None));
    }

    if buf.len() < IPV4_MIN_HEADER_LEN + HEADER_LEN {
        return Err(PacketError::Malformed {
            len: buf.len(),
            min: IPV4_MIN_HEADER_LEN + HEADER_LEN,
        });
    }

    let ihl = (buf[0] & 0x0F) as usize * 4;
    if ihl < IPV4_MIN_HEADER_LEN || buf.len() < ihl + HEADER_LEN {
        return Err(PacketError::Malformed {
            len: buf.len(),
            min: ihl.max(IPV4_MIN_HEADER_LEN) + HEADER_LEN,
        });
    }

    let source = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
    Ok((&buf[ihl..], Some(source)))
}

/// Checksum do pacote como se os bytes 2..4 fossem zero, sem copiar.
fn checksum_without_field(icmp: &[u8]) -> u16 {
    // Os cortes caem em offsets pares, então as palavras não se desalinham
    let sum = sum_words(&icmp[..2], 0);
    finish(sum_words(&icmp[4..], sum))
}

/// Checksum RFC 1071.
///
/// Soma palavras montadas em little-endian, dobra o carry duas vezes,
/// complementa e inverte os bytes. O valor devolvido vai para o fio em
/// big-endian e coincide com o checksum ICMP padrão.
pub fn checksum(data: &[u8]) -> u16 {
    finish(sum_words(data, 0))
}

fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum = sum.wrapping_add(u16::from_le_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = words.remainder() {
        sum = sum.wrapping_add(*last as u32);
    }
    sum
}

fn finish(mut sum: u32) -> u16 {
    sum = (sum >> 16) + (sum & 0xFFFF);
    sum += sum >> 16;

    (!(sum as u16)).swap_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80)
    }

    /// Checksum clássico em big-endian, para comparação.
    fn be_checksum(mut data: &[u8]) -> u16 {
        let mut sum: u32 = 0;
        while data.len() >= 2 {
            sum += u16::from_be_bytes([data[0], data[1]]) as u32;
            data = &data[2..];
        }
        if let [last] = data {
            sum += (*last as u32) << 8;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }

    fn with_ip_header(icmp: &[u8], source: Ipv4Addr) -> Vec<u8> {
        let mut pkt = vec![0u8; IPV4_MIN_HEADER_LEN];
        pkt[0] = 0x45;
        pkt[9] = 1;
        pkt[12..16].copy_from_slice(&source.octets());
        pkt[16..20].copy_from_slice(&[10, 0, 0, 1]);
        pkt.extend_from_slice(icmp);
        pkt
    }

    #[test]
    fn checksum_matches_rfc1071_example() {
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), 0x220d);
    }

    #[test]
    fn checksum_agrees_with_big_endian_sum() {
        let even = b"GET / HTTP/1.0\r\n\r\n";
        let odd = b"hello";
        assert_eq!(checksum(even), be_checksum(even));
        assert_eq!(checksum(odd), be_checksum(odd));
        assert_eq!(checksum(&[]), 0xFFFF);
    }

    #[test]
    fn encode_layout() {
        let pkt = encode(MessageType::EchoRequest, Code::Data, 7, target(), b"abc");

        assert_eq!(pkt.len(), HEADER_LEN + 3);
        assert_eq!(pkt[0], ICMP_ECHO_REQUEST);
        assert_eq!(pkt[1], 0);
        assert_eq!(&pkt[4..6], &[0, 7]);
        assert_eq!(&pkt[6..8], &[0, 0]);
        assert_eq!(&pkt[8..12], &[93, 184, 216, 34]);
        assert_eq!(&pkt[12..14], &80u16.to_be_bytes());
        assert_eq!(&pkt[14..], b"abc");
    }

    #[test]
    fn encoded_checksum_verifies() {
        let pkt = encode(MessageType::EchoReply, Code::Data, 0, target(), b"odd");
        let transmitted = u16::from_be_bytes([pkt[2], pkt[3]]);

        assert_eq!(checksum_without_field(&pkt), transmitted);
        // A soma sobre o pacote inteiro fecha em zero
        assert_eq!(be_checksum(&pkt), 0);
    }

    #[test]
    fn decode_roundtrip_bare() {
        let request = b"GET / HTTP/1.0\r\n\r\n";
        let msg = TunnelMessage::data(MessageType::EchoRequest, 42, target(), request);
        let decoded = decode(&msg.encode(), Framing::Bare).unwrap();

        assert_eq!(decoded.message, msg);
        assert_eq!(decoded.message.sequence, 0);
        assert_eq!(decoded.source, None);
    }

    #[test]
    fn relay_replies_carry_the_sequence_mark() {
        let pkt = encode_reply(Code::Data, 7, target(), b"ok");
        assert_eq!(&pkt[6..8], &REPLY_SEQUENCE.to_be_bytes());

        let msg = decode(&pkt, Framing::Bare).unwrap().message;
        let expected = TunnelMessage::data(MessageType::EchoReply, 7, target(), b"ok")
            .with_sequence(REPLY_SEQUENCE);
        assert!(msg.is_relay_reply());
        assert_eq!(msg, expected);

        // Um reply sem a marca (eco do kernel) não passa
        let echoed = encode(MessageType::EchoReply, Code::Data, 7, target(), b"ok");
        assert!(!decode(&echoed, Framing::Bare).unwrap().message.is_relay_reply());
    }

    #[test]
    fn checksum_is_checked_without_copying_the_ip_header() {
        let msg = TunnelMessage::data(MessageType::EchoRequest, 2, target(), b"odd");
        let mut buf = with_ip_header(&msg.encode(), Ipv4Addr::new(10, 9, 8, 7));
        // O cabeçalho IP não entra na soma
        buf[8] = 1;
        assert_eq!(decode(&buf, Framing::IpHeader).unwrap().message, msg);

        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        assert!(matches!(
            decode(&buf, Framing::IpHeader),
            Err(PacketError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn decode_teardown_has_empty_payload() {
        let msg = TunnelMessage::teardown(MessageType::EchoRequest, 3, target());
        let pkt = msg.encode();
        assert_eq!(pkt.len(), HEADER_LEN);

        let decoded = decode(&pkt, Framing::Bare).unwrap();
        assert!(decoded.message.is_teardown());
        assert!(decoded.message.payload.is_empty());
    }

    #[test]
    fn decode_strips_ip_header_and_reports_source() {
        let source = Ipv4Addr::new(192, 168, 1, 20);
        let msg = TunnelMessage::data(MessageType::EchoRequest, 1, target(), b"payload");
        let buf = with_ip_header(&msg.encode(), source);

        let decoded = decode(&buf, Framing::IpHeader).unwrap();
        assert_eq!(decoded.message, msg);
        assert_eq!(decoded.source, Some(source));
    }

    #[test]
    fn detect_framing_handles_both_shapes() {
        let source = Ipv4Addr::new(10, 1, 2, 3);
        let msg = TunnelMessage::data(MessageType::EchoReply, 9, target(), b"x");
        let bare = msg.encode();
        let framed = with_ip_header(&bare, source);

        assert_eq!(decode(&bare, Framing::Detect).unwrap().source, None);
        assert_eq!(decode(&framed, Framing::Detect).unwrap().source, Some(source));
        assert_eq!(decode(&framed, Framing::Detect).unwrap().message, msg);
    }

    #[test]
    fn short_buffer_is_malformed() {
        let err = decode(&[8, 0, 0, 0, 0], Framing::Bare).unwrap_err();
        assert_eq!(err, PacketError::Malformed { len: 5, min: HEADER_LEN });
    }

    #[test]
    fn short_ip_packet_is_malformed() {
        let buf = with_ip_header(&[8, 0, 0], Ipv4Addr::LOCALHOST);
        assert!(matches!(
            decode(&buf, Framing::IpHeader),
            Err(PacketError::Malformed { .. })
        ));
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut pkt = encode(MessageType::EchoRequest, Code::Data, 0, target(), b"hello");
        pkt[HEADER_LEN] ^= 0xFF;

        assert!(matches!(
            decode(&pkt, Framing::Bare),
            Err(PacketError::ChecksumMismatch { .. })
        ));
        // Modo relaxado aceita
        let relaxed = decode_unverified(&pkt, Framing::Bare).unwrap();
        assert_eq!(&relaxed.message.payload[1..], b"ello");
    }

    #[test]
    fn unknown_type_and_code_rejected() {
        let mut pkt = encode(MessageType::EchoRequest, Code::Data, 0, target(), b"");
        pkt[0] = 3;
        assert_eq!(
            decode_unverified(&pkt, Framing::Bare),
            Err(PacketError::UnsupportedType(3))
        );

        pkt[0] = ICMP_ECHO_REQUEST;
        pkt[1] = 5;
        assert_eq!(
            decode_unverified(&pkt, Framing::Bare),
            Err(PacketError::UnsupportedCode(5))
        );
    }
}
