use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::NetError;
use crate::event::{Event, EventSink};
use crate::protocol::{
    CONTROL_AUTH, CONTROL_PING, ConnectionId, ConnectionSecret, ConnectionState, ENDPOINT_LEN,
    Endpoint, PROTOCOL_COMMAND, build_message,
};
use crate::queue::{BoundedQueue, OutboundPacket};
use crate::sequence::SequenceWindow;
use crate::transport::{DatagramSocket, StreamTransport};

/// One entry in the server's connection table. The table mutex guards
/// lookup, insert, and erase; the outbound queue carries its own lock so
/// the application thread enqueues without holding the table.
pub(crate) struct ServerConnection {
    pub id: ConnectionId,
    pub secret: ConnectionSecret,
    pub state: ConnectionState,
    stream: StreamTransport,
    /// Set once the id/secret pair has been issued over the stream.
    authorized: bool,
    /// Datagram return address observed during the probe exchange.
    pub endpoint: Option<SocketAddr>,
    window: SequenceWindow,
    outbound: Arc<BoundedQueue<OutboundPacket>>,
    last_stream: Instant,
    last_datagram: Instant,
}

impl ServerConnection {
    pub fn new(
        id: ConnectionId,
        secret: ConnectionSecret,
        stream: StreamTransport,
        queue_capacity: usize,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            secret,
            state: ConnectionState::AwaitingAuth,
            stream,
            authorized: false,
            endpoint: None,
            window: SequenceWindow::new(),
            outbound: Arc::new(BoundedQueue::new(queue_capacity)),
            last_stream: now,
            last_datagram: now,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    /// Handle to this connection's reliable queue; callers clone it out
    /// of the table and push after releasing the table lock.
    pub fn outbound(&self) -> Arc<BoundedQueue<OutboundPacket>> {
        Arc::clone(&self.outbound)
    }

    /// Issues the identity over the stream. The peer is expected to
    /// start probing the datagram port with it right away.
    pub fn authorize(&mut self) -> Result<(), NetError> {
        if self.authorized {
            return Err(NetError::AlreadyAuthorized(self.id));
        }
        self.authorized = true;
        self.stream
            .send_frame(&[PROTOCOL_COMMAND, CONTROL_AUTH, self.id, self.secret]);
        log::debug!("issued identity {} over stream", self.id);
        Ok(())
    }

    /// Reads everything pending on the stream and surfaces it.
    pub fn poll_stream(&mut self, now: Instant, events: &EventSink, event_limit: usize) {
        if self.stream.poll() {
            self.last_stream = now;
        }
        while let Some(frame) = self.stream.next_frame() {
            self.handle_stream_frame(&frame, events, event_limit);
        }
    }

    fn handle_stream_frame(&mut self, frame: &[u8], events: &EventSink, event_limit: usize) {
        if frame.len() < 2 {
            return;
        }
        let command = frame[0];
        let sub = frame[1];
        let payload = &frame[2..];

        if command == PROTOCOL_COMMAND {
            self.handle_stream_control(sub, payload, events, event_limit);
            return;
        }
        // Inbound data always carries a body on this side.
        if payload.is_empty() {
            return;
        }
        if self.state == ConnectionState::AwaitingAuth {
            events.emit_with_limit(
                Event::AuthPacket {
                    id: self.id,
                    command,
                    payload: payload.to_vec(),
                },
                event_limit,
            );
        } else if self.state == ConnectionState::Ready {
            events.emit_with_limit(
                Event::ReliablePacket {
                    id: self.id,
                    command,
                    payload: payload.to_vec(),
                },
                event_limit,
            );
        }
    }

    fn handle_stream_control(
        &mut self,
        sub: u8,
        payload: &[u8],
        events: &EventSink,
        event_limit: usize,
    ) {
        if sub != CONTROL_AUTH {
            return;
        }
        if !self.authorized || self.state != ConnectionState::AwaitingAuth {
            return;
        }
        if payload.len() < ENDPOINT_LEN {
            log::warn!("connection {}: truncated endpoint echo", self.id);
            self.state = ConnectionState::Disconnected;
            return;
        }
        let echoed = Endpoint::decode(payload);
        let observed = self.endpoint.and_then(Endpoint::from_addr);
        if echoed.is_none() || echoed != observed {
            // The peer confirmed an address we never saw it use.
            log::warn!("connection {}: endpoint echo mismatch", self.id);
            self.state = ConnectionState::Disconnected;
            return;
        }
        self.state = ConnectionState::Ready;
        log::info!("connection {} ready at {:?}", self.id, self.endpoint);
        events.emit_with_limit(Event::Ready { id: self.id }, event_limit);
    }

    /// Handles a datagram already matched to this connection by id and
    /// secret. `body` is the `[command][seq][payload]` remainder.
    pub fn handle_datagram(
        &mut self,
        body: &[u8],
        from: SocketAddr,
        udp: &DatagramSocket,
        now: Instant,
        events: &EventSink,
        event_limit: usize,
    ) {
        if body.len() < 2 {
            return;
        }

        // While the endpoint is unconfirmed, any datagram carrying the
        // right identity serves as the probe.
        if self.state == ConnectionState::AwaitingAuth {
            if !self.authorized {
                return;
            }
            self.last_datagram = now;
            self.record_probe(from, udp);
            return;
        }

        let command = body[0];
        let seq = body[1];
        let payload = &body[2..];

        if command == PROTOCOL_COMMAND {
            // Keep-alive; only the pinned endpoint refreshes the clock.
            if self.endpoint == Some(from) {
                self.last_datagram = now;
            }
            return;
        }
        if self.state != ConnectionState::Ready {
            return;
        }
        if self.endpoint != Some(from) {
            log::warn!("connection {}: datagram from unexpected source {}", self.id, from);
            return;
        }
        self.last_datagram = now;
        if payload.is_empty() || !self.window.is_valid(command, seq) {
            return;
        }
        self.window.record(command, seq);
        events.emit_with_limit(
            Event::UnreliablePacket {
                id: self.id,
                command,
                payload: payload.to_vec(),
            },
            event_limit,
        );
    }

    /// Each probe re-records the source and re-sends the descriptor;
    /// only the stream echo pins it down.
    fn record_probe(&mut self, from: SocketAddr, udp: &DatagramSocket) {
        let Some(endpoint) = Endpoint::from_addr(from) else {
            log::warn!("connection {}: non-IPv4 probe source {}", self.id, from);
            return;
        };
        self.endpoint = Some(from);
        let reply = build_message(PROTOCOL_COMMAND, CONTROL_AUTH, &endpoint.encode());
        if let Err(e) = udp.send_to(&reply, from) {
            log::debug!("connection {}: probe reply failed: {}", self.id, e);
        }
    }

    /// Next sequence number for an outgoing datagram on `command`.
    pub fn stamp(&mut self, command: u8, timed: bool) -> u8 {
        if timed { self.window.next(command) } else { 0 }
    }

    pub fn send_pings(
        &mut self,
        udp: &DatagramSocket,
        stream_due: bool,
        datagram_due: bool,
    ) {
        if stream_due {
            self.stream.send_frame(&[PROTOCOL_COMMAND, CONTROL_PING]);
        }
        if datagram_due && self.state == ConnectionState::Ready {
            if let Some(addr) = self.endpoint {
                let ping = build_message(PROTOCOL_COMMAND, CONTROL_PING, &[]);
                let _ = udp.send_to(&ping, addr);
            }
        }
    }

    /// Writes queued reliable packets and drains the stream buffer.
    pub fn flush(&mut self) {
        for pkt in self.outbound.drain_all() {
            let frame = build_message(pkt.command, 0, &pkt.payload);
            self.stream.send_frame(&frame);
        }
        self.stream.flush();
    }

    pub fn is_alive(&self, now: Instant, timeout: Duration) -> bool {
        if !self.stream.is_open() || self.state == ConnectionState::Disconnected {
            return false;
        }
        now.duration_since(self.last_stream) <= timeout
            && now.duration_since(self.last_datagram) <= timeout
    }
}
