use crate::protocol::ConnectionId;
use crate::queue::BoundedQueue;

/// Inbound event surfaced to the owning application.
#[derive(Debug, Clone)]
pub enum Event {
    /// Server: a stream connection was accepted. Client: id/secret were
    /// assigned over the stream.
    Connected { id: ConnectionId },
    /// The endpoint handshake completed on this side.
    Ready { id: ConnectionId },
    Disconnected { id: ConnectionId },
    /// Stream packet received while the peer is still unauthorized.
    AuthPacket {
        id: ConnectionId,
        command: u8,
        payload: Vec<u8>,
    },
    ReliablePacket {
        id: ConnectionId,
        command: u8,
        payload: Vec<u8>,
    },
    UnreliablePacket {
        id: ConnectionId,
        command: u8,
        payload: Vec<u8>,
    },
}

/// How events reach the application: queued for an explicit
/// `drain_events` call, or dispatched directly on the worker thread.
///
/// An `Immediate` callback runs with internal locks held and must not
/// call back into the session or server that delivered it.
pub enum EventDelivery {
    Queued,
    Immediate(Box<dyn Fn(Event) + Send + Sync>),
}

pub(crate) enum EventSink {
    Queued(BoundedQueue<Event>),
    Immediate(Box<dyn Fn(Event) + Send + Sync>),
}

impl EventSink {
    pub fn new(delivery: EventDelivery, capacity: usize) -> Self {
        match delivery {
            EventDelivery::Queued => EventSink::Queued(BoundedQueue::new(capacity)),
            EventDelivery::Immediate(callback) => EventSink::Immediate(callback),
        }
    }

    pub fn emit(&self, event: Event) {
        match self {
            EventSink::Queued(queue) => {
                if queue.push(event).is_err() {
                    log::warn!("event queue at capacity, dropping event");
                }
            }
            EventSink::Immediate(callback) => callback(event),
        }
    }

    pub fn emit_with_limit(&self, event: Event, limit: usize) {
        match self {
            EventSink::Queued(queue) => {
                if queue.push_with_limit(event, limit).is_err() {
                    log::warn!("event queue at capacity, dropping event");
                }
            }
            EventSink::Immediate(callback) => callback(event),
        }
    }

    pub fn drain(&self) -> Vec<Event> {
        match self {
            EventSink::Queued(queue) => queue.drain_all(),
            EventSink::Immediate(_) => Vec::new(),
        }
    }

    pub fn clear(&self) {
        if let EventSink::Queued(queue) = self {
            queue.clear();
        }
    }
}
