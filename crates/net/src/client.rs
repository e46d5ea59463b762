use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::config::NetConfig;
use crate::error::NetError;
use crate::event::{Event, EventDelivery, EventSink};
use crate::protocol::{
    CONTROL_AUTH, CONTROL_PING, ConnectionId, ConnectionSecret, ConnectionState, ENDPOINT_LEN,
    PROTOCOL_COMMAND, build_client_datagram, build_message,
};
use crate::queue::{BoundedQueue, OutboundPacket};
use crate::sequence::SequenceWindow;
use crate::transport::{DatagramSocket, StreamTransport};

/// Client side of the session: owns the worker thread that drives the
/// handshake and the steady-state packet pump. The application thread
/// only enqueues outbound packets and drains inbound events.
pub struct ClientSession {
    shared: Arc<ClientShared>,
    worker: Option<JoinHandle<()>>,
}

struct ClientShared {
    running: AtomicBool,
    state: AtomicU8,
    client_id: AtomicU8,
    reliable_queue: BoundedQueue<OutboundPacket>,
    unreliable_queue: BoundedQueue<OutboundPacket>,
    events: EventSink,
    config: NetConfig,
}

impl ClientSession {
    /// Connects the reliable stream and spawns the worker. The identity
    /// handshake then runs in the background; progress is reported
    /// through the event stream and `state()`.
    pub fn connect(
        host: &str,
        tcp_port: u16,
        udp_port: u16,
        config: NetConfig,
        delivery: EventDelivery,
    ) -> io::Result<Self> {
        let tcp = StreamTransport::connect((host, tcp_port))?;
        let udp = DatagramSocket::bind("0.0.0.0:0")?;
        let server_udp = (host, udp_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unresolvable host"))?;

        let shared = Arc::new(ClientShared {
            running: AtomicBool::new(true),
            state: AtomicU8::new(ConnectionState::AwaitingAuth as u8),
            client_id: AtomicU8::new(0),
            reliable_queue: BoundedQueue::new(config.packet_queue_size),
            unreliable_queue: BoundedQueue::new(config.packet_queue_size),
            events: EventSink::new(delivery, config.event_queue_size),
            config,
        });

        let worker = ClientWorker {
            shared: Arc::clone(&shared),
            tcp,
            udp,
            server_udp,
            id: 0,
            secret: 0,
            has_id: false,
            state: ConnectionState::AwaitingAuth,
            window: SequenceWindow::new(),
        };
        let handle = thread::Builder::new()
            .name("tandem-client".into())
            .spawn(move || worker.run())?;

        log::info!("connecting to {}:{} (udp {})", host, tcp_port, udp_port);
        Ok(Self {
            shared,
            worker: Some(handle),
        })
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Identity assigned by the server; 0 until the handshake assigns one.
    pub fn client_id(&self) -> ConnectionId {
        self.shared.client_id.load(Ordering::SeqCst)
    }

    pub fn send_reliable(&self, command: u8, payload: &[u8]) -> Result<(), NetError> {
        if self.state() == ConnectionState::Disconnected {
            return Err(NetError::Closed);
        }
        self.shared.reliable_queue.push(OutboundPacket {
            id: self.client_id(),
            command,
            payload: payload.to_vec(),
            timed: false,
        })
    }

    pub fn send_unreliable(&self, command: u8, payload: &[u8], timed: bool) -> Result<(), NetError> {
        if self.state() != ConnectionState::Ready {
            return Err(NetError::NotReady);
        }
        self.shared.unreliable_queue.push(OutboundPacket {
            id: self.client_id(),
            command,
            payload: payload.to_vec(),
            timed,
        })
    }

    pub fn drain_events(&self) -> Vec<Event> {
        self.shared.events.drain()
    }

    /// Stops the worker, joins it, and discards anything still queued.
    pub fn close(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.shared.running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            self.shared.reliable_queue.clear();
            self.shared.unreliable_queue.clear();
            self.shared.events.clear();
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}

struct ClientWorker {
    shared: Arc<ClientShared>,
    tcp: StreamTransport,
    udp: DatagramSocket,
    server_udp: SocketAddr,
    id: ConnectionId,
    secret: ConnectionSecret,
    has_id: bool,
    state: ConnectionState,
    window: SequenceWindow,
}

impl ClientWorker {
    fn run(mut self) {
        let start = Instant::now();
        let mut last_tcp = start;
        let mut last_udp = start;
        let mut last_tcp_ping = start;
        let mut last_udp_ping = start;
        let config = self.shared.config.clone();

        while self.shared.running.load(Ordering::SeqCst)
            && self.state != ConnectionState::Disconnected
        {
            let now = Instant::now();

            if self.tcp.poll() {
                last_tcp = now;
            }
            while let Some(frame) = self.tcp.next_frame() {
                self.handle_stream_frame(&frame);
            }
            while let Some((pkt, from)) = self.udp.recv() {
                if from != self.server_udp {
                    continue;
                }
                last_udp = now;
                self.handle_datagram(&pkt);
            }

            // No datagrams are expected before an identity is assigned
            if self.state == ConnectionState::AwaitingAuth {
                last_udp = now;
            }

            if now.duration_since(last_udp) > config.timeout
                || now.duration_since(last_tcp) > config.timeout
            {
                log::warn!("connection timeout");
                self.set_state(ConnectionState::Disconnected);
                break;
            }

            if now.duration_since(last_udp_ping) > config.unreliable_ping_interval {
                self.send_datagram_ping();
                last_udp_ping = now;
            }
            if now.duration_since(last_tcp_ping) > config.reliable_ping_interval {
                self.tcp
                    .send_frame(&[PROTOCOL_COMMAND, CONTROL_PING]);
                last_tcp_ping = now;
            }

            self.flush_queues();
            self.tcp.flush();

            if !self.tcp.is_open() {
                log::warn!("server connection lost");
                self.set_state(ConnectionState::Disconnected);
                break;
            }

            thread::sleep(config.client_idle_sleep);
        }

        self.set_state(ConnectionState::Disconnected);
        self.shared.events.emit(Event::Disconnected { id: self.id });
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.shared.state.store(state as u8, Ordering::SeqCst);
    }

    fn handle_stream_frame(&mut self, frame: &[u8]) {
        if frame.len() < 2 {
            return;
        }
        let command = frame[0];
        let sub = frame[1];
        let payload = &frame[2..];

        if command == PROTOCOL_COMMAND {
            self.handle_stream_control(sub, payload);
        } else if self.state == ConnectionState::AwaitingAuth {
            self.shared.events.emit(Event::AuthPacket {
                id: self.id,
                command,
                payload: payload.to_vec(),
            });
        } else if self.state == ConnectionState::Ready {
            self.shared.events.emit(Event::ReliablePacket {
                id: self.id,
                command,
                payload: payload.to_vec(),
            });
        }
    }

    fn handle_stream_control(&mut self, sub: u8, payload: &[u8]) {
        if sub != CONTROL_AUTH {
            return;
        }
        if payload.len() != 2 {
            return;
        }
        self.id = payload[0];
        self.secret = payload[1];
        self.has_id = true;
        self.shared.client_id.store(self.id, Ordering::SeqCst);
        self.set_state(ConnectionState::AwaitingAck);
        log::debug!("assigned connection id {}", self.id);
        self.shared.events.emit(Event::Connected { id: self.id });
    }

    fn handle_datagram(&mut self, pkt: &[u8]) {
        if pkt.len() < 2 {
            return;
        }
        let command = pkt[0];
        let seq = pkt[1];
        let payload = &pkt[2..];

        if command == PROTOCOL_COMMAND {
            // second header byte carries the control sub-command
            self.handle_datagram_control(seq, payload);
            return;
        }
        if payload.is_empty() || !self.window.is_valid(command, seq) {
            return;
        }
        self.window.record(command, seq);
        self.shared.events.emit(Event::UnreliablePacket {
            id: self.id,
            command,
            payload: payload.to_vec(),
        });
    }

    fn handle_datagram_control(&mut self, sub: u8, payload: &[u8]) {
        if sub != CONTROL_AUTH || self.state == ConnectionState::Ready {
            return;
        }
        if payload.len() != ENDPOINT_LEN {
            // Handshake integrity is suspect; no safe way to resume.
            log::warn!("malformed endpoint descriptor, disconnecting");
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        // Echo the observed endpoint back over the stream so the server
        // can verify we really receive at the address it saw.
        let mut echo = vec![PROTOCOL_COMMAND, CONTROL_AUTH];
        echo.extend_from_slice(payload);
        self.tcp.send_frame(&echo);

        self.set_state(ConnectionState::Ready);
        log::info!("session ready (id {})", self.id);
        self.shared.events.emit(Event::Ready { id: self.id });
    }

    fn send_datagram_ping(&mut self) {
        if !self.has_id {
            return;
        }
        let ping = build_client_datagram(self.id, self.secret, PROTOCOL_COMMAND, CONTROL_PING, &[]);
        let _ = self.udp.send_to(&ping, self.server_udp);
    }

    fn flush_queues(&mut self) {
        for qp in self.shared.reliable_queue.drain_all() {
            let frame = build_message(qp.command, 0, &qp.payload);
            self.tcp.send_frame(&frame);
        }
        for qp in self.shared.unreliable_queue.drain_all() {
            if !self.has_id {
                continue;
            }
            let seq = if qp.timed {
                self.window.next(qp.command)
            } else {
                0
            };
            let pkt = build_client_datagram(self.id, self.secret, qp.command, seq, &qp.payload);
            let _ = self.udp.send_to(&pkt, self.server_udp);
        }
    }
}
