//! Process-wide registry of peer sessions: admission control and
//! filesystem-event fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::hostport::HostPort;
use crate::session::{LineReader, PeerSession, SessionError};
use crate::store::{FileStore, FileSystemEvent};

/// The local node: one per process, passed to every session as explicit
/// context. Owns the session registry, the transfer block size and the
/// handle to the filesystem store.
pub struct LocalNode {
    store: Arc<dyn FileStore>,
    advertised: HostPort,
    block_size: u64,
    maximum_incoming_connections: usize,
    sessions: RwLock<HashMap<u64, Arc<PeerSession>>>,
    next_session_id: AtomicU64,
}

impl LocalNode {
    pub fn new(
        store: Arc<dyn FileStore>,
        advertised: HostPort,
        block_size: u64,
        maximum_incoming_connections: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            advertised,
            block_size,
            maximum_incoming_connections,
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        })
    }

    pub fn store(&self) -> Arc<dyn FileStore> {
        self.store.clone()
    }

    /// Max bytes requested per FILE_BYTES_REQUEST.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn advertised_host_port(&self) -> &HostPort {
        &self.advertised
    }

    /// Register a session for an accepted socket and spawn its reader
    /// loop. The remote is expected to open with HANDSHAKE_REQUEST.
    pub async fn accept(self: Arc<Self>, stream: TcpStream) -> std::io::Result<Arc<PeerSession>> {
        let remote = stream.peer_addr()?;
        let client = HostPort::new(remote.ip().to_string(), remote.port());
        let (session, reader) = Self::register(self, stream, client).await;
        info!(peer = %remote, "accepted connection");
        tokio::spawn(session.clone().run(reader));
        Ok(session)
    }

    /// Register a session for a socket this node initiated and open it
    /// with HANDSHAKE_REQUEST.
    pub async fn connect(
        self: Arc<Self>,
        stream: TcpStream,
        remote: HostPort,
    ) -> Result<Arc<PeerSession>, SessionError> {
        let (session, reader) = Self::register(self.clone(), stream, remote).await;
        if let Err(err) = session.send_handshake_request().await {
            self.deregister(session.id()).await;
            return Err(err);
        }
        tokio::spawn(session.clone().run(reader));
        Ok(session)
    }

    async fn register(
        node: Arc<Self>,
        stream: TcpStream,
        client: HostPort,
    ) -> (Arc<PeerSession>, LineReader) {
        let id = node.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let session = Arc::new(PeerSession::new(
            id,
            node.clone(),
            node.advertised.clone(),
            client,
            write_half,
        ));
        node.sessions.write().await.insert(id, session.clone());
        (session, BufReader::new(read_half))
    }

    pub(crate) async fn deregister(&self, id: u64) {
        if self.sessions.write().await.remove(&id).is_some() {
            debug!(session = id, "session deregistered");
        }
    }

    /// Admission control for inbound handshakes.
    pub async fn has_reached_max_connections(&self) -> bool {
        let sessions = self.sessions.read().await;
        let connected = sessions
            .values()
            .filter(|session| session.handshake_completed())
            .count();
        connected >= self.maximum_incoming_connections
    }

    /// Host-ports of every handshake-completed peer except `excluding`:
    /// the hint list carried by CONNECTION_REFUSED.
    pub async fn connected_peers(&self, excluding: &HostPort) -> Vec<HostPort> {
        let sessions: Vec<Arc<PeerSession>> =
            self.sessions.read().await.values().cloned().collect();
        let mut peers = Vec::new();
        for session in sessions {
            if !session.handshake_completed() {
                continue;
            }
            let peer = session.client_host_port().await;
            if peer != *excluding && !peers.contains(&peer) {
                peers.push(peer);
            }
        }
        peers
    }

    /// Fan one local filesystem event out to every session. A failure in
    /// one session never affects the others.
    pub async fn process_file_system_event(&self, event: &FileSystemEvent) {
        let sessions: Vec<Arc<PeerSession>> =
            self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            session.process_file_system_event(event).await;
        }
    }

    /// Number of registered sessions, handshake-completed or not.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
