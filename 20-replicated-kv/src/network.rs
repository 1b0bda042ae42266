//! Peer transport for Raft messages.
//!
//! - **Inbound**: [`PeerListener`] accepts TCP connections from peers and
//!   forwards every decoded message to the driver through a channel.
//! - **Outbound**: [`TcpTransport`] keeps one sender thread and one
//!   persistent connection per peer.
//!
//! Delivery is best effort and at-most-once. A message that cannot be sent
//! is dropped; the consensus engine retransmits whatever matters.
//!
//! # Protocol
//!
//! Each connection carries a sequence of length-prefixed frames:
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: protobuf-encoded `raft::prelude::Message`

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use prost::Message as ProstMessage;
use raft::prelude::Message;
use tracing::{debug, trace, warn};

const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const PEER_QUEUE_CAPACITY: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Outbound side of the peer transport, as the driver sees it.
pub trait Transport: Send {
    /// Queues `msg` for `msg.to`. Never blocks; may drop.
    fn send(&mut self, msg: Message);

    /// Replaces the address book. Peers no longer present are disconnected.
    fn set_peers(&mut self, peers: &BTreeMap<u64, String>);

    /// Stops all outbound traffic.
    fn close(&mut self) {}
}

pub fn write_frame(writer: &mut impl Write, msg: &Message) -> io::Result<()> {
    let bytes = msg.encode_to_vec();
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&bytes)?;
    writer.flush()
}

/// Reads one frame. `Ok(None)` means the peer closed the connection cleanly.
pub fn read_frame(reader: &mut impl Read) -> io::Result<Option<Message>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    let msg =
        Message::decode(&buf[..]).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(Some(msg))
}

/// Open inbound connections, kept so [`PeerListener::stop`] can close them.
///
/// Each reader thread removes its own entry when its peer hangs up.
#[derive(Default)]
struct Connections {
    next_id: AtomicU64,
    open: Mutex<HashMap<u64, TcpStream>>,
}

impl Connections {
    fn track(&self, stream: &TcpStream) -> io::Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.open.lock().insert(id, stream.try_clone()?);
        Ok(id)
    }

    fn forget(&self, id: u64) {
        self.open.lock().remove(&id);
    }

    fn close_all(&self) {
        for (_, stream) in self.open.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.open.lock().len()
    }

    #[cfg(test)]
    fn accepted(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }
}

/// Accepts connections from peers until stopped.
pub struct PeerListener {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    connections: Arc<Connections>,
    accept_thread: Option<JoinHandle<()>>,
}

impl PeerListener {
    /// Binds `addr` and starts forwarding inbound messages to `tx`.
    pub fn bind(node_id: u64, addr: &str, tx: Sender<Message>) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("failed to bind raft address {addr}"))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(Connections::default());

        let accept_thread = {
            let shutdown = Arc::clone(&shutdown);
            let connections = Arc::clone(&connections);
            thread::Builder::new()
                .name(format!("raft-listener-{node_id}"))
                .spawn(move || accept_loop(node_id, listener, tx, shutdown, connections))
                .context("failed to spawn network listener")?
        };

        debug!(node = node_id, addr = %local_addr, "raft listener bound");
        Ok(Self {
            local_addr,
            shutdown,
            connections,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, closes every open connection and waits for the
    /// accept thread.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
        self.connections.close_all();
    }

    #[cfg(test)]
    fn open_connections(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    fn accepted_connections(&self) -> u64 {
        self.connections.accepted()
    }
}

impl Drop for PeerListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    node_id: u64,
    listener: TcpListener,
    tx: Sender<Message>,
    shutdown: Arc<AtomicBool>,
    connections: Arc<Connections>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let conn_id = match track_connection(&stream, &connections) {
                    Ok(conn_id) => conn_id,
                    Err(err) => {
                        warn!(node = node_id, %peer, error = %err, "failed to set up peer connection");
                        continue;
                    }
                };
                let tx = tx.clone();
                let conns = Arc::clone(&connections);
                let spawned = thread::Builder::new()
                    .name(format!("raft-conn-{node_id}"))
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, tx) {
                            debug!(node = node_id, %peer, error = %err, "peer connection closed");
                        }
                        conns.forget(conn_id);
                    });
                if let Err(err) = spawned {
                    connections.forget(conn_id);
                    warn!(node = node_id, error = %err, "failed to spawn connection handler");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(err) => {
                warn!(node = node_id, error = %err, "accept error");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn track_connection(stream: &TcpStream, connections: &Connections) -> io::Result<u64> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    connections.track(stream)
}

/// Reads frames until the peer hangs up and forwards them to the driver.
fn handle_connection(mut stream: TcpStream, tx: Sender<Message>) -> io::Result<()> {
    while let Some(msg) = read_frame(&mut stream)? {
        tx.send(msg)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "driver gone"))?;
    }
    Ok(())
}

/// Outbound transport with one persistent connection per peer.
pub struct TcpTransport {
    id: u64,
    peers: HashMap<u64, PeerSender>,
}

struct PeerSender {
    address: String,
    tx: Sender<Message>,
}

impl TcpTransport {
    pub fn new(id: u64, peers: &BTreeMap<u64, String>) -> Self {
        let mut transport = Self {
            id,
            peers: HashMap::new(),
        };
        transport.set_peers(peers);
        transport
    }

    fn spawn_sender(&self, peer: u64, address: String) -> Option<PeerSender> {
        let (tx, rx) = bounded(PEER_QUEUE_CAPACITY);
        let node = self.id;
        let target = address.clone();
        let spawned = thread::Builder::new()
            .name(format!("raft-send-{node}-{peer}"))
            .spawn(move || sender_loop(node, peer, target, rx));
        match spawned {
            Ok(_) => Some(PeerSender { address, tx }),
            Err(err) => {
                warn!(node, peer, error = %err, "failed to spawn peer sender");
                None
            }
        }
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, msg: Message) {
        let to = msg.to;
        let Some(peer) = self.peers.get(&to) else {
            debug!(node = self.id, peer = to, "no address for peer, dropping message");
            return;
        };
        match peer.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(node = self.id, peer = to, "peer queue full, dropping message");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(node = self.id, peer = to, "peer sender gone, dropping message");
            }
        }
    }

    fn set_peers(&mut self, peers: &BTreeMap<u64, String>) {
        self.peers
            .retain(|id, sender| peers.get(id).is_some_and(|addr| *addr == sender.address));
        for (&id, address) in peers {
            if id == self.id || self.peers.contains_key(&id) {
                continue;
            }
            if let Some(sender) = self.spawn_sender(id, address.clone()) {
                self.peers.insert(id, sender);
            }
        }
    }

    fn close(&mut self) {
        // Dropping the queues ends the sender threads.
        self.peers.clear();
    }
}

fn sender_loop(node: u64, peer: u64, address: String, rx: Receiver<Message>) {
    let mut stream: Option<TcpStream> = None;
    let mut retry_at = Instant::now();

    for msg in rx.iter() {
        if stream.is_none() {
            if Instant::now() < retry_at {
                trace!(node, peer, "peer in backoff, dropping message");
                continue;
            }
            match connect(&address) {
                Ok(conn) => stream = Some(conn),
                Err(err) => {
                    debug!(node, peer, %address, error = %err, "connect failed");
                    retry_at = Instant::now() + RECONNECT_BACKOFF;
                    continue;
                }
            }
        }

        if let Some(conn) = stream.as_mut() {
            if let Err(err) = write_frame(conn, &msg) {
                debug!(node, peer, error = %err, "send failed, reconnecting");
                stream = None;
                retry_at = Instant::now() + RECONNECT_BACKOFF;
            }
        }
    }

    if let Some(conn) = stream {
        let _ = conn.shutdown(Shutdown::Both);
    }
}

fn connect(address: &str) -> io::Result<TcpStream> {
    let addr = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address did not resolve"))?;
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use raft::prelude::MessageType;

    fn message(to: u64, term: u64) -> Message {
        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgHeartbeat);
        msg.from = 1;
        msg.to = to;
        msg.term = term;
        msg
    }

    #[test]
    fn test_frames_read_back_in_order() -> Result<()> {
        let mut buf = Vec::new();
        write_frame(&mut buf, &message(2, 1))?;
        write_frame(&mut buf, &message(2, 2))?;

        let mut reader = &buf[..];
        assert_eq!(read_frame(&mut reader)?.map(|m| m.term), Some(1));
        assert_eq!(read_frame(&mut reader)?.map(|m| m.term), Some(2));
        assert!(read_frame(&mut reader)?.is_none());
        Ok(())
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        let mut reader = &len[..];
        assert!(read_frame(&mut reader).is_err());
    }

    #[test]
    fn test_closed_peer_connections_are_released() -> Result<()> {
        let (tx, _rx) = unbounded();
        let mut listener = PeerListener::bind(1, "127.0.0.1:0", tx)?;
        for _ in 0..20 {
            let stream = TcpStream::connect(listener.local_addr())?;
            drop(stream);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while (listener.accepted_connections() < 20 || listener.open_connections() > 0)
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(listener.accepted_connections(), 20);
        assert_eq!(listener.open_connections(), 0);
        listener.stop();
        Ok(())
    }

    #[test]
    fn test_transport_delivers_over_one_connection() -> Result<()> {
        let (tx, rx) = unbounded();
        let mut listener = PeerListener::bind(2, "127.0.0.1:0", tx)?;
        let peers = BTreeMap::from([
            (1, "127.0.0.1:1".to_string()),
            (2, listener.local_addr().to_string()),
        ]);
        let mut transport = TcpTransport::new(1, &peers);

        for term in 1..=5 {
            transport.send(message(2, term));
        }
        let terms: Vec<u64> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).map(|m| m.term))
            .collect::<Result<_, _>>()?;
        assert_eq!(terms, vec![1, 2, 3, 4, 5]);
        assert_eq!(listener.connections.open.lock().len(), 1);

        transport.close();
        listener.stop();
        Ok(())
    }

    #[test]
    fn test_unknown_peer_is_dropped() {
        let mut transport = TcpTransport::new(1, &BTreeMap::new());
        transport.send(message(9, 1));
        assert!(transport.peers.is_empty());
    }

    #[test]
    fn test_set_peers_replaces_changed_addresses() {
        let mut transport = TcpTransport::new(
            1,
            &BTreeMap::from([(2, "127.0.0.1:1".to_string()), (3, "127.0.0.1:2".to_string())]),
        );
        transport.set_peers(&BTreeMap::from([(2, "127.0.0.1:9".to_string())]));
        assert_eq!(transport.peers.len(), 1);
        assert_eq!(transport.peers[&2].address, "127.0.0.1:9");
    }
}
