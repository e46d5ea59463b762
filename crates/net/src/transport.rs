use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};

use crate::protocol::MAX_DATAGRAM_SIZE;

const LEN_PREFIX: usize = 4;
const MAX_FRAME_LEN: usize = 64 * 1024;
const READ_CHUNK: usize = 4096;

/// Length-framed, non-blocking wrapper around a TCP stream. Frames are
/// `[len: u32 LE][body]`; partial reads and writes are buffered so the
/// worker tick never blocks on the socket.
pub struct StreamTransport {
    stream: TcpStream,
    rbuf: Vec<u8>,
    wbuf: Vec<u8>,
    open: bool,
}

impl StreamTransport {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            rbuf: Vec::new(),
            wbuf: Vec::new(),
            open: true,
        })
    }

    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Self::new(TcpStream::connect(addr)?)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Pulls everything currently readable into the frame buffer.
    /// Returns true when any bytes arrived this call.
    pub fn poll(&mut self) -> bool {
        if !self.open {
            return false;
        }
        let mut chunk = [0u8; READ_CHUNK];
        let mut received = false;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.open = false;
                    break;
                }
                Ok(n) => {
                    self.rbuf.extend_from_slice(&chunk[..n]);
                    received = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("stream read error: {}", e);
                    self.open = false;
                    break;
                }
            }
        }
        received
    }

    /// Next complete frame body, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.rbuf.len() < LEN_PREFIX {
            return None;
        }
        let len = u32::from_le_bytes([self.rbuf[0], self.rbuf[1], self.rbuf[2], self.rbuf[3]])
            as usize;
        if len > MAX_FRAME_LEN {
            // Framing is lost; nothing downstream can be trusted.
            log::warn!("oversized stream frame ({} bytes), closing", len);
            self.open = false;
            return None;
        }
        if self.rbuf.len() < LEN_PREFIX + len {
            return None;
        }
        self.rbuf.drain(..LEN_PREFIX);
        Some(self.rbuf.drain(..len).collect())
    }

    pub fn send_frame(&mut self, body: &[u8]) {
        if !self.open {
            return;
        }
        self.wbuf
            .extend_from_slice(&(body.len() as u32).to_le_bytes());
        self.wbuf.extend_from_slice(body);
    }

    /// Writes as much of the outgoing buffer as the socket accepts.
    pub fn flush(&mut self) {
        while self.open && !self.wbuf.is_empty() {
            match self.stream.write(&self.wbuf) {
                Ok(0) => {
                    self.open = false;
                }
                Ok(n) => {
                    self.wbuf.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("stream write error: {}", e);
                    self.open = false;
                }
            }
        }
    }
}

/// Non-blocking UDP socket reading whole datagrams into a fixed buffer.
pub struct DatagramSocket {
    socket: UdpSocket,
    buf: [u8; MAX_DATAGRAM_SIZE],
}

impl DatagramSocket {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            buf: [0u8; MAX_DATAGRAM_SIZE],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn recv(&mut self) -> Option<(Vec<u8>, SocketAddr)> {
        loop {
            match self.socket.recv_from(&mut self.buf) {
                Ok((size, addr)) => return Some((self.buf[..size].to_vec(), addr)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    log::debug!("datagram recv error: {}", e);
                    return None;
                }
            }
        }
    }

    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "datagram exceeds MTU",
            ));
        }
        self.socket.send_to(data, addr)
    }
}
