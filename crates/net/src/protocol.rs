use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub type ConnectionId = u8;
pub type ConnectionSecret = u8;

pub const MAX_DATAGRAM_SIZE: usize = 1200;

/// Command byte reserved for protocol control traffic. Application
/// commands occupy 0..=254.
pub const PROTOCOL_COMMAND: u8 = 255;
pub const MAX_APP_COMMAND: u8 = 254;

pub const CONTROL_PING: u8 = 0;
pub const CONTROL_AUTH: u8 = 1;

/// `[command][seq-or-0]` on both channels; client->server datagrams carry
/// `[id][secret]` in front of that.
pub const STREAM_HEADER_LEN: usize = 2;
pub const DATAGRAM_HEADER_LEN: usize = 4;
pub const ENDPOINT_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    AwaitingAuth = 0,
    AwaitingAck = 1,
    Ready = 2,
    Disconnected = 3,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::AwaitingAuth,
            1 => ConnectionState::AwaitingAck,
            2 => ConnectionState::Ready,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Message body used on the stream in both directions and in
/// server->client datagrams: `[command][seq-or-0][payload...]`.
pub fn build_message(command: u8, seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(STREAM_HEADER_LEN + payload.len());
    out.push(command);
    out.push(seq);
    out.extend_from_slice(payload);
    out
}

/// Client->server datagram: `[id][secret][command][seq-or-0][payload...]`.
pub fn build_client_datagram(
    id: ConnectionId,
    secret: ConnectionSecret,
    command: u8,
    seq: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(DATAGRAM_HEADER_LEN + payload.len());
    out.push(id);
    out.push(secret);
    out.push(command);
    out.push(seq);
    out.extend_from_slice(payload);
    out
}

/// A reachable datagram destination as carried in the handshake: four
/// IPv4 octets followed by the port, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn from_addr(addr: SocketAddr) -> Option<Self> {
        match addr.ip() {
            IpAddr::V4(host) => Some(Self {
                host,
                port: addr.port(),
            }),
            IpAddr::V6(host) => host.to_ipv4_mapped().map(|host| Self {
                host,
                port: addr.port(),
            }),
        }
    }

    pub fn to_addr(self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.host), self.port)
    }

    pub fn encode(self) -> [u8; ENDPOINT_LEN] {
        let o = self.host.octets();
        let p = self.port.to_be_bytes();
        [o[0], o[1], o[2], o[3], p[0], p[1]]
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < ENDPOINT_LEN {
            return None;
        }
        Some(Self {
            host: Ipv4Addr::new(data[0], data[1], data[2], data[3]),
            port: u16::from_be_bytes([data[4], data[5]]),
        })
    }
}
