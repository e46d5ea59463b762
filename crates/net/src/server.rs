use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hasher, RandomState};
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::config::NetConfig;
use crate::connection::ServerConnection;
use crate::error::NetError;
use crate::event::{Event, EventDelivery, EventSink};
use crate::protocol::{
    ConnectionId, ConnectionSecret, ConnectionState, DATAGRAM_HEADER_LEN, build_message,
};
use crate::queue::{BoundedQueue, OutboundPacket};
use crate::transport::{DatagramSocket, StreamTransport};

/// Listening side of the session protocol. Owns the connection table and
/// a worker thread that accepts streams, pumps both sockets, and reaps
/// dead entries.
pub struct NetServer {
    shared: Arc<ServerShared>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    worker: Option<JoinHandle<()>>,
}

struct ServerShared {
    running: AtomicBool,
    connections: Mutex<BTreeMap<ConnectionId, ServerConnection>>,
    unreliable_queue: BoundedQueue<OutboundPacket>,
    events: EventSink,
    config: NetConfig,
}

impl ServerShared {
    fn lock_table(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, ServerConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue limits grow with the connection count so one busy peer
    /// cannot starve the rest.
    fn scaled(&self, base: usize) -> usize {
        base * (self.lock_table().len() + 1)
    }
}

impl NetServer {
    pub fn bind<A: ToSocketAddrs, B: ToSocketAddrs>(
        tcp_addr: A,
        udp_addr: B,
        config: NetConfig,
        delivery: EventDelivery,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(tcp_addr)?;
        listener.set_nonblocking(true)?;
        let udp = DatagramSocket::bind(udp_addr)?;
        let tcp_addr = listener.local_addr()?;
        let udp_addr = udp.local_addr()?;

        let shared = Arc::new(ServerShared {
            running: AtomicBool::new(true),
            connections: Mutex::new(BTreeMap::new()),
            unreliable_queue: BoundedQueue::new(config.packet_queue_size),
            events: EventSink::new(delivery, config.event_queue_size),
            config,
        });

        let worker = ServerWorker {
            shared: Arc::clone(&shared),
            listener,
            udp,
        };
        let handle = thread::Builder::new()
            .name("tandem-server".into())
            .spawn(move || worker.run())?;

        log::info!("listening on {} (udp {})", tcp_addr, udp_addr);
        Ok(Self {
            shared,
            tcp_addr,
            udp_addr,
            worker: Some(handle),
        })
    }

    pub fn local_tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn local_udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared.lock_table().len()
    }

    pub fn connected_ids(&self) -> Vec<ConnectionId> {
        self.shared.lock_table().keys().copied().collect()
    }

    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.shared.lock_table().get(&id).map(|conn| conn.state)
    }

    /// Stream address of the peer, while the connection is still up.
    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.shared
            .lock_table()
            .get(&id)
            .and_then(|conn| conn.peer_addr())
    }

    /// Issues the connection its id/secret pair, allowing it to proceed
    /// to the endpoint probe. Until then its stream packets surface as
    /// `AuthPacket` events for the application to vet.
    pub fn authorize(&self, id: ConnectionId) -> Result<(), NetError> {
        let mut table = self.shared.lock_table();
        let conn = table.get_mut(&id).ok_or(NetError::UnknownConnection(id))?;
        conn.authorize()
    }

    /// Marks the connection for removal; the worker reaps it and emits
    /// `Disconnected` on its next tick.
    pub fn kick(&self, id: ConnectionId) -> Result<(), NetError> {
        let mut table = self.shared.lock_table();
        let conn = table.get_mut(&id).ok_or(NetError::UnknownConnection(id))?;
        conn.state = ConnectionState::Disconnected;
        Ok(())
    }

    /// Queues a reliable packet for one connection. The table lock is
    /// held only for the lookup; the enqueue itself goes through the
    /// connection's own queue lock.
    pub fn send_reliable(
        &self,
        id: ConnectionId,
        command: u8,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let queue = {
            let table = self.shared.lock_table();
            let conn = table.get(&id).ok_or(NetError::UnknownConnection(id))?;
            conn.outbound()
        };
        queue.push(OutboundPacket {
            id,
            command,
            payload: payload.to_vec(),
            timed: false,
        })
    }

    pub fn send_unreliable(
        &self,
        id: ConnectionId,
        command: u8,
        payload: &[u8],
        timed: bool,
    ) -> Result<(), NetError> {
        let limit = {
            let table = self.shared.lock_table();
            let conn = table.get(&id).ok_or(NetError::UnknownConnection(id))?;
            if conn.state != ConnectionState::Ready {
                return Err(NetError::NotReady);
            }
            self.shared.config.packet_queue_size * (table.len() + 1)
        };
        self.shared.unreliable_queue.push_with_limit(
            OutboundPacket {
                id,
                command,
                payload: payload.to_vec(),
                timed,
            },
            limit,
        )
    }

    /// Queues a reliable packet for every live connection. Overflowing a
    /// single peer's queue drops that copy rather than failing the whole
    /// broadcast.
    pub fn broadcast_reliable(&self, command: u8, payload: &[u8]) {
        let queues: Vec<(ConnectionId, _)> = {
            let table = self.shared.lock_table();
            table.iter().map(|(id, conn)| (*id, conn.outbound())).collect()
        };
        for (id, queue) in queues {
            let pushed = queue.push(OutboundPacket {
                id,
                command,
                payload: payload.to_vec(),
                timed: false,
            });
            if pushed.is_err() {
                log::warn!("broadcast overflowed reliable queue of connection {}", id);
            }
        }
    }

    /// Queues an unreliable packet for every Ready connection.
    pub fn broadcast_unreliable(&self, command: u8, payload: &[u8], timed: bool) {
        let (ids, limit) = {
            let table = self.shared.lock_table();
            let ids: Vec<ConnectionId> = table
                .iter()
                .filter(|(_, conn)| conn.state == ConnectionState::Ready)
                .map(|(id, _)| *id)
                .collect();
            let limit = self.shared.config.packet_queue_size * (table.len() + 1);
            (ids, limit)
        };
        for id in ids {
            let pushed = self.shared.unreliable_queue.push_with_limit(
                OutboundPacket {
                    id,
                    command,
                    payload: payload.to_vec(),
                    timed,
                },
                limit,
            );
            if pushed.is_err() {
                log::warn!("broadcast overflowed the shared datagram queue");
                break;
            }
        }
    }

    pub fn drain_events(&self) -> Vec<Event> {
        self.shared.events.drain()
    }

    /// Stops the worker and drops all connections without emitting
    /// per-connection events.
    pub fn close(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.shared.running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            self.shared.lock_table().clear();
            self.shared.unreliable_queue.clear();
            self.shared.events.clear();
        }
    }
}

impl Drop for NetServer {
    fn drop(&mut self) {
        self.close();
    }
}

struct ServerWorker {
    shared: Arc<ServerShared>,
    listener: TcpListener,
    udp: DatagramSocket,
}

impl ServerWorker {
    fn run(mut self) {
        let config = self.shared.config.clone();
        let mut last_stream_ping = Instant::now();
        let mut last_datagram_ping = Instant::now();

        while self.shared.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            let event_limit = self.shared.scaled(config.event_queue_size);

            self.accept_pending(event_limit);
            self.pump_datagrams(now, event_limit);

            let stream_due = now.duration_since(last_stream_ping) > config.reliable_ping_interval;
            let datagram_due =
                now.duration_since(last_datagram_ping) > config.unreliable_ping_interval;
            if stream_due {
                last_stream_ping = now;
            }
            if datagram_due {
                last_datagram_ping = now;
            }

            self.update_connections(now, event_limit, stream_due, datagram_due);
            self.reap(now, event_limit);

            thread::sleep(config.server_idle_sleep);
        }
    }

    fn accept_pending(&mut self, event_limit: usize) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let transport = match StreamTransport::new(stream) {
                        Ok(t) => t,
                        Err(e) => {
                            log::warn!("failed to adopt stream from {}: {}", peer, e);
                            continue;
                        }
                    };
                    let capacity = self.shared.config.packet_queue_size;
                    let mut table = self.shared.lock_table();
                    let id = next_free_id(table.keys().copied());
                    if id == 0 {
                        log::warn!("connection table full, refusing {}", peer);
                        continue;
                    }
                    table.insert(id, ServerConnection::new(id, rand_u8(), transport, capacity));
                    drop(table);
                    log::info!("accepted {} as connection {}", peer, id);
                    self.shared
                        .events
                        .emit_with_limit(Event::Connected { id }, event_limit);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn pump_datagrams(&mut self, now: Instant, event_limit: usize) {
        // Outbound first so stamped sequence numbers precede anything a
        // reply to this tick's input could carry.
        for pkt in self.shared.unreliable_queue.drain_all() {
            let mut table = self.shared.lock_table();
            let Some(conn) = table.get_mut(&pkt.id) else {
                continue;
            };
            if conn.state != ConnectionState::Ready {
                continue;
            }
            let Some(addr) = conn.endpoint else { continue };
            let seq = conn.stamp(pkt.command, pkt.timed);
            drop(table);
            let body = build_message(pkt.command, seq, &pkt.payload);
            if let Err(e) = self.udp.send_to(&body, addr) {
                log::debug!("datagram send to {} failed: {}", addr, e);
            }
        }

        while let Some((pkt, from)) = self.udp.recv() {
            if pkt.len() < DATAGRAM_HEADER_LEN {
                continue;
            }
            let id: ConnectionId = pkt[0];
            let secret: ConnectionSecret = pkt[1];
            let mut table = self.shared.lock_table();
            let Some(conn) = table.get_mut(&id) else {
                log::debug!("datagram for unknown connection {} from {}", id, from);
                continue;
            };
            if conn.secret != secret {
                log::warn!("bad secret for connection {} from {}", id, from);
                continue;
            }
            conn.handle_datagram(&pkt[2..], from, &self.udp, now, &self.shared.events, event_limit);
        }
    }

    fn update_connections(
        &mut self,
        now: Instant,
        event_limit: usize,
        stream_due: bool,
        datagram_due: bool,
    ) {
        let mut table = self.shared.lock_table();
        for conn in table.values_mut() {
            conn.poll_stream(now, &self.shared.events, event_limit);
            conn.send_pings(&self.udp, stream_due, datagram_due);
            conn.flush();
        }
    }

    fn reap(&mut self, now: Instant, event_limit: usize) {
        let timeout = self.shared.config.timeout;
        let mut dead = Vec::new();
        let mut table = self.shared.lock_table();
        table.retain(|id, conn| {
            if conn.is_alive(now, timeout) {
                true
            } else {
                dead.push(*id);
                false
            }
        });
        drop(table);
        for id in dead {
            log::info!("connection {} dropped", id);
            self.shared
                .events
                .emit_with_limit(Event::Disconnected { id }, event_limit);
        }
    }
}

/// Lowest unused connection id given the live ids in ascending order, or
/// 0 when all 255 are taken.
fn next_free_id(ids: impl IntoIterator<Item = ConnectionId>) -> ConnectionId {
    let mut candidate: u16 = 1;
    for id in ids {
        if u16::from(id) == candidate {
            candidate += 1;
        } else {
            break;
        }
    }
    if candidate > u16::from(ConnectionId::MAX) {
        0
    } else {
        candidate as ConnectionId
    }
}

fn rand_u8() -> ConnectionSecret {
    RandomState::new().build_hasher().finish() as ConnectionSecret
}
