//! One peer session per TCP connection: handshake state, reader loop,
//! request dispatch, chunked-transfer driving and refusal fallback.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::hostport::HostPort;
use crate::node::LocalNode;
use crate::protocol::{self, FileDescriptor, Message};
use crate::store::{FileSystemEvent, StoreError};
use crate::wire;

pub(crate) type LineReader = BufReader<OwnedReadHalf>;

/// Fatal session failure; ends the reader loop.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] wire::LineEncodeError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// What the dispatcher decided about the session after one message.
enum Verdict {
    Continue,
    /// Protocol violation or refusal; the reader loop ends.
    Stop,
}

/// Protocol state for a single TCP connection to one peer.
///
/// The reader task owns the read half and is the only mutator of the
/// handshake flag and the remote endpoint; the write half sits behind a
/// mutex because the filesystem-event fan-out writes concurrently with
/// the dispatcher. Each message is one line, written and flushed under
/// the lock.
pub struct PeerSession {
    id: u64,
    node: Arc<LocalNode>,
    /// The local advertised endpoint, echoed in handshake messages.
    server_host_port: HostPort,
    /// The remote endpoint. Rewritten when an inbound handshake carries
    /// the peer's advertised endpoint and when following a refusal hint.
    client_host_port: Mutex<HostPort>,
    handshake_completed: AtomicBool,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
}

impl PeerSession {
    pub(crate) fn new(
        id: u64,
        node: Arc<LocalNode>,
        server_host_port: HostPort,
        client_host_port: HostPort,
        write_half: OwnedWriteHalf,
    ) -> Self {
        Self {
            id,
            node,
            server_host_port,
            client_host_port: Mutex::new(client_host_port),
            handshake_completed: AtomicBool::new(false),
            writer: Mutex::new(BufWriter::new(write_half)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the handshake has completed. Transitions false to true at
    /// most once for the lifetime of the session.
    pub fn handshake_completed(&self) -> bool {
        self.handshake_completed.load(Ordering::Acquire)
    }

    pub async fn client_host_port(&self) -> HostPort {
        self.client_host_port.lock().await.clone()
    }

    async fn set_client_host_port(&self, host_port: HostPort) {
        *self.client_host_port.lock().await = host_port;
    }

    /// Serialize one message as a line and flush it. Atomic per message
    /// under the writer lock.
    async fn write_message(&self, msg: &Message) -> Result<(), SessionError> {
        let line = wire::encode_line(msg)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    pub(crate) async fn send_handshake_request(&self) -> Result<(), SessionError> {
        self.write_message(&Message::HandshakeRequest {
            host_port: self.server_host_port.clone(),
        })
        .await?;
        let peer = self.client_host_port().await;
        info!(peer = %peer, "sent handshake request");
        Ok(())
    }

    /// Translate one local filesystem event into an outbound request.
    /// Suppressed until the handshake completes; send failures are logged
    /// and never terminate the session (termination is reader-driven).
    pub async fn process_file_system_event(&self, event: &FileSystemEvent) {
        if !self.handshake_completed() {
            return;
        }
        let msg = match event {
            FileSystemEvent::FileCreate { path, descriptor } => Message::FileCreateRequest {
                file_descriptor: descriptor.clone(),
                path_name: path.clone(),
            },
            FileSystemEvent::FileModify { path, descriptor } => Message::FileModifyRequest {
                file_descriptor: descriptor.clone(),
                path_name: path.clone(),
            },
            FileSystemEvent::FileDelete { path, descriptor } => Message::FileDeleteRequest {
                file_descriptor: descriptor.clone(),
                path_name: path.clone(),
            },
            FileSystemEvent::DirectoryCreate { path } => Message::DirectoryCreateRequest {
                path_name: path.clone(),
            },
            FileSystemEvent::DirectoryDelete { path } => Message::DirectoryDeleteRequest {
                path_name: path.clone(),
            },
        };
        match self.write_message(&msg).await {
            Ok(()) => {
                let peer = self.client_host_port().await;
                debug!(peer = %peer, "pushed filesystem event")
            }
            Err(err) => {
                let peer = self.client_host_port().await;
                warn!(peer = %peer, %err, "failed to push filesystem event")
            }
        }
    }

    /// Reader loop: one line, one message, one dispatch. Returns when the
    /// peer disconnects, a protocol violation occurs, a store failure
    /// surfaces, or refusal fallback exhausts its candidates. Deregisters
    /// from the node on the way out; dropping both halves closes the
    /// socket.
    pub(crate) async fn run(self: Arc<Self>, mut reader: LineReader) {
        let mut candidates: VecDeque<HostPort> = VecDeque::new();
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    let peer = self.client_host_port().await;
                    info!(peer = %peer, "peer closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    let peer = self.client_host_port().await;
                    warn!(peer = %peer, %err, "read failed");
                    break;
                }
            }
            let msg = match wire::decode_line(line.trim_end()) {
                Ok(msg) => msg,
                Err(err) => {
                    let peer = self.client_host_port().await;
                    debug!(peer = %peer, %err, "undecodable line");
                    let _ = self
                        .write_message(&Message::InvalidProtocol {
                            message: protocol::MSG_MISSING_FIELDS.to_string(),
                        })
                        .await;
                    break;
                }
            };
            match msg {
                // These two drive the fallback machinery, which needs to
                // swap the reader; everything else goes to the dispatcher.
                Message::HandshakeResponse { host_port } => {
                    info!(peer = %host_port, "handshake response received");
                    self.handshake_completed.store(true, Ordering::Release);
                    candidates.clear();
                }
                Message::ConnectionRefused { message, peers } => {
                    if self.handshake_completed() {
                        let _ = self
                            .write_message(&Message::InvalidProtocol {
                                message: protocol::MSG_UNEXPECTED_REFUSAL.to_string(),
                            })
                            .await;
                        break;
                    }
                    let peer = self.client_host_port().await;
                    info!(
                        peer = %peer,
                        %message,
                        hints = peers.len(),
                        "connection refused, trying hinted peers"
                    );
                    match self.follow_candidates(&mut candidates, peers).await {
                        Some(new_reader) => reader = new_reader,
                        None => break,
                    }
                }
                other => match self.dispatch(other).await {
                    Ok(Verdict::Continue) => {}
                    Ok(Verdict::Stop) => break,
                    Err(err) => {
                        let peer = self.client_host_port().await;
                        warn!(peer = %peer, %err, "session failed");
                        break;
                    }
                },
            }
        }
        self.node.deregister(self.id).await;
    }

    /// Drain the hinted-candidate queue head-first: connect, swap the new
    /// socket in and re-issue the handshake request. Returns the read
    /// half of the first connection that came up, or `None` when every
    /// candidate failed.
    async fn follow_candidates(
        &self,
        candidates: &mut VecDeque<HostPort>,
        hinted: Vec<HostPort>,
    ) -> Option<LineReader> {
        for peer in hinted {
            if !candidates.contains(&peer) {
                candidates.push_back(peer);
            }
        }
        while let Some(candidate) = candidates.pop_front() {
            info!(peer = %candidate, "trying hinted peer");
            match TcpStream::connect((candidate.host.as_str(), candidate.port)).await {
                Ok(stream) => {
                    let (read_half, write_half) = stream.into_split();
                    *self.writer.lock().await = BufWriter::new(write_half);
                    self.set_client_host_port(candidate).await;
                    match self.send_handshake_request().await {
                        Ok(()) => return Some(BufReader::new(read_half)),
                        Err(err) => warn!(%err, "handshake to hinted peer failed"),
                    }
                }
                Err(err) => {
                    warn!(peer = %candidate, %err, "failed to connect to hinted peer");
                }
            }
        }
        None
    }

    async fn dispatch(&self, msg: Message) -> Result<Verdict, SessionError> {
        match msg {
            Message::HandshakeRequest { host_port } => self.on_handshake_request(host_port).await,
            Message::InvalidProtocol { message } => {
                let peer = self.client_host_port().await;
                warn!(
                    peer = %peer,
                    %message,
                    "peer reported a protocol violation"
                );
                Ok(Verdict::Continue)
            }
            // Handled by the reader loop before dispatch.
            Message::HandshakeResponse { .. } | Message::ConnectionRefused { .. } => {
                Ok(Verdict::Continue)
            }
            _ if !self.handshake_completed() => {
                let peer = self.client_host_port().await;
                debug!(
                    peer = %peer,
                    "dropping message received before handshake"
                );
                Ok(Verdict::Continue)
            }
            Message::FileCreateRequest {
                file_descriptor,
                path_name,
            } => self.on_file_create_request(file_descriptor, path_name).await,
            Message::FileModifyRequest {
                file_descriptor,
                path_name,
            } => self.on_file_modify_request(file_descriptor, path_name).await,
            Message::FileDeleteRequest {
                file_descriptor,
                path_name,
            } => self.on_file_delete_request(file_descriptor, path_name).await,
            Message::FileBytesRequest {
                file_descriptor,
                path_name,
                position,
                length,
            } => {
                self.on_file_bytes_request(file_descriptor, path_name, position, length)
                    .await
            }
            Message::FileBytesResponse {
                file_descriptor,
                path_name,
                position,
                length,
                content,
                message,
                status,
            } => {
                self.on_file_bytes_response(
                    file_descriptor,
                    path_name,
                    position,
                    length,
                    content,
                    message,
                    status,
                )
                .await
            }
            Message::DirectoryCreateRequest { path_name } => {
                self.on_directory_create_request(path_name).await
            }
            Message::DirectoryDeleteRequest { path_name } => {
                self.on_directory_delete_request(path_name).await
            }
            Message::FileCreateResponse {
                path_name,
                message,
                status,
                ..
            } => {
                if !status {
                    let peer = self.client_host_port().await;
                    warn!(peer = %peer, path = %path_name, %message, "create refused by peer");
                }
                Ok(Verdict::Continue)
            }
            Message::FileModifyResponse {
                path_name,
                message,
                status,
                ..
            } => {
                if !status {
                    let peer = self.client_host_port().await;
                    warn!(peer = %peer, path = %path_name, %message, "modify refused by peer");
                }
                Ok(Verdict::Continue)
            }
            Message::FileDeleteResponse {
                path_name,
                message,
                status,
                ..
            } => {
                if !status {
                    let peer = self.client_host_port().await;
                    warn!(peer = %peer, path = %path_name, %message, "delete refused by peer");
                }
                Ok(Verdict::Continue)
            }
            Message::DirectoryCreateResponse {
                path_name,
                message,
                status,
            } => {
                if !status {
                    let peer = self.client_host_port().await;
                    warn!(peer = %peer, path = %path_name, %message, "directory create refused by peer");
                }
                Ok(Verdict::Continue)
            }
            Message::DirectoryDeleteResponse {
                path_name,
                message,
                status,
            } => {
                if !status {
                    let peer = self.client_host_port().await;
                    warn!(peer = %peer, path = %path_name, %message, "directory delete refused by peer");
                }
                Ok(Verdict::Continue)
            }
        }
    }

    async fn on_handshake_request(&self, host_port: HostPort) -> Result<Verdict, SessionError> {
        if self.handshake_completed() {
            let peer = self.client_host_port().await;
            warn!(peer = %peer, "duplicate handshake request");
            self.write_message(&Message::InvalidProtocol {
                message: protocol::MSG_DUPLICATE_HANDSHAKE.to_string(),
            })
            .await?;
            return Ok(Verdict::Stop);
        }
        // The advertised endpoint, not the socket address, is the identity
        // worth handing out in refusal hints.
        self.set_client_host_port(host_port.clone()).await;
        if self.node.has_reached_max_connections().await {
            let peers = self.node.connected_peers(&host_port).await;
            info!(peer = %host_port, hints = peers.len(), "at capacity, refusing handshake");
            self.write_message(&Message::ConnectionRefused {
                message: protocol::MSG_MAX_CONNECTIONS.to_string(),
                peers,
            })
            .await?;
            return Ok(Verdict::Stop);
        }
        self.write_message(&Message::HandshakeResponse {
            host_port: self.server_host_port.clone(),
        })
        .await?;
        self.handshake_completed.store(true, Ordering::Release);
        info!(peer = %host_port, "handshake completed");
        Ok(Verdict::Continue)
    }

    /// First chunk request of a transfer: position 0, one block or the
    /// whole file, whichever is smaller.
    async fn send_first_bytes_request(
        &self,
        fd: &FileDescriptor,
        path: &str,
    ) -> Result<(), SessionError> {
        let length = self.node.block_size().min(fd.file_size);
        self.write_message(&Message::FileBytesRequest {
            file_descriptor: fd.clone(),
            path_name: path.to_string(),
            position: 0,
            length,
        })
        .await?;
        let peer = self.client_host_port().await;
        debug!(peer = %peer, path = %path, length, "requested first chunk");
        Ok(())
    }

    async fn on_file_create_request(
        &self,
        fd: FileDescriptor,
        path: String,
    ) -> Result<Verdict, SessionError> {
        let store = self.node.store();
        let respond = |message: &str, status: bool| Message::FileCreateResponse {
            file_descriptor: fd.clone(),
            path_name: path.clone(),
            message: message.to_string(),
            status,
        };
        if !store.is_safe_path_name(&path) {
            self.write_message(&respond("Path name is unsafe: File create request failed", false))
                .await?;
            return Ok(Verdict::Continue);
        }
        if store.file_matches(&path, &fd.md5) {
            self.write_message(&respond(
                "File with the same content has existed: File create request failed",
                false,
            ))
            .await?;
            return Ok(Verdict::Continue);
        }
        if store.file_name_exists(&path) {
            if !store.modify_file_loader(&path, &fd.md5, fd.last_modified)? {
                self.write_message(&respond(
                    "There is a newer version: File create request failed",
                    false,
                ))
                .await?;
            } else {
                self.write_message(&respond("Overwrite the older version", true))
                    .await?;
                self.send_first_bytes_request(&fd, &path).await?;
            }
            return Ok(Verdict::Continue);
        }
        store.create_file_loader(&path, &fd)?;
        if store.check_shortcut(&path)? {
            self.write_message(&respond(
                "There is a file with the same content, no need to transfer it again.",
                false,
            ))
            .await?;
            return Ok(Verdict::Continue);
        }
        self.write_message(&respond("File loader ready", true)).await?;
        self.send_first_bytes_request(&fd, &path).await?;
        Ok(Verdict::Continue)
    }

    async fn on_file_modify_request(
        &self,
        fd: FileDescriptor,
        path: String,
    ) -> Result<Verdict, SessionError> {
        let store = self.node.store();
        let respond = |message: &str, status: bool| Message::FileModifyResponse {
            file_descriptor: fd.clone(),
            path_name: path.clone(),
            message: message.to_string(),
            status,
        };
        if !store.is_safe_path_name(&path) {
            self.write_message(&respond("Path name is unsafe: File modify request failed", false))
                .await?;
            return Ok(Verdict::Continue);
        }
        if store.file_matches(&path, &fd.md5) {
            self.write_message(&respond(
                "File with the same content has existed: File modify request failed",
                false,
            ))
            .await?;
            return Ok(Verdict::Continue);
        }
        if !store.modify_file_loader(&path, &fd.md5, fd.last_modified)? {
            self.write_message(&respond("File doesn't exist: File modify request failed", false))
                .await?;
            return Ok(Verdict::Continue);
        }
        self.write_message(&respond("Modify file loader ready", true))
            .await?;
        self.send_first_bytes_request(&fd, &path).await?;
        Ok(Verdict::Continue)
    }

    async fn on_file_delete_request(
        &self,
        fd: FileDescriptor,
        path: String,
    ) -> Result<Verdict, SessionError> {
        let store = self.node.store();
        let respond = |message: &str, status: bool| Message::FileDeleteResponse {
            file_descriptor: fd.clone(),
            path_name: path.clone(),
            message: message.to_string(),
            status,
        };
        if !store.is_safe_path_name(&path) {
            self.write_message(&respond("Path name is unsafe: File delete request failed", false))
                .await?;
        } else if !store.delete_file(&path, fd.last_modified, &fd.md5) {
            self.write_message(&respond("File doesn't exist: File delete request failed", false))
                .await?;
        } else {
            self.write_message(&respond("The file was deleted", true)).await?;
        }
        Ok(Verdict::Continue)
    }

    async fn on_directory_create_request(&self, path: String) -> Result<Verdict, SessionError> {
        let store = self.node.store();
        let respond = |message: &str, status: bool| Message::DirectoryCreateResponse {
            path_name: path.clone(),
            message: message.to_string(),
            status,
        };
        if !store.is_safe_path_name(&path) {
            self.write_message(&respond(
                "Path name is unsafe: Directory create request failed",
                false,
            ))
            .await?;
        } else if store.dir_name_exists(&path) {
            self.write_message(&respond(
                "Directory name has existed: Directory create request failed",
                false,
            ))
            .await?;
        } else {
            let _ = store.make_directory(&path);
            self.write_message(&respond("Directory was created", true)).await?;
        }
        Ok(Verdict::Continue)
    }

    async fn on_directory_delete_request(&self, path: String) -> Result<Verdict, SessionError> {
        let store = self.node.store();
        let respond = |message: &str, status: bool| Message::DirectoryDeleteResponse {
            path_name: path.clone(),
            message: message.to_string(),
            status,
        };
        if !store.is_safe_path_name(&path) {
            self.write_message(&respond(
                "Path name is unsafe: Directory delete request failed",
                false,
            ))
            .await?;
        } else if !store.dir_name_exists(&path) {
            self.write_message(&respond(
                "Directory doesn't exist: Directory delete request failed",
                false,
            ))
            .await?;
        } else {
            let _ = store.delete_directory(&path);
            self.write_message(&respond("Directory was deleted", true)).await?;
        }
        Ok(Verdict::Continue)
    }

    async fn on_file_bytes_request(
        &self,
        fd: FileDescriptor,
        path: String,
        position: u64,
        length: u64,
    ) -> Result<Verdict, SessionError> {
        let bytes = self.node.store().read_file(&fd.md5, position, length)?;
        self.write_message(&Message::FileBytesResponse {
            file_descriptor: fd,
            path_name: path,
            position,
            length,
            content: BASE64.encode(&bytes),
            message: "successful read".to_string(),
            status: true,
        })
        .await?;
        Ok(Verdict::Continue)
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_file_bytes_response(
        &self,
        fd: FileDescriptor,
        path: String,
        position: u64,
        length: u64,
        content: String,
        message: String,
        status: bool,
    ) -> Result<Verdict, SessionError> {
        let store = self.node.store();
        if !status {
            let peer = self.client_host_port().await;
            warn!(
                peer = %peer,
                path = %path,
                %message,
                "chunk read failed on peer, abandoning transfer"
            );
            store.cancel_file_loader(&path)?;
            return Ok(Verdict::Continue);
        }
        let bytes = match BASE64.decode(content.as_bytes()) {
            Ok(bytes) => bytes,
            Err(err) => {
                let peer = self.client_host_port().await;
                debug!(peer = %peer, %err, "chunk content is not valid base64");
                self.write_message(&Message::InvalidProtocol {
                    message: protocol::MSG_MISSING_FIELDS.to_string(),
                })
                .await?;
                return Ok(Verdict::Stop);
            }
        };
        store.write_file(&path, &bytes, position)?;
        let next_position = position + length;
        // Keep the peer's chosen chunk size for the rest of the transfer.
        let next_length = fd.file_size.saturating_sub(next_position).min(length);
        if !store.check_write_complete(&path)? && next_length != 0 {
            self.write_message(&Message::FileBytesRequest {
                file_descriptor: fd,
                path_name: path,
                position: next_position,
                length: next_length,
            })
            .await?;
        } else {
            store.cancel_file_loader(&path)?;
            let peer = self.client_host_port().await;
            debug!(peer = %peer, "transfer finished");
        }
        Ok(Verdict::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    use crate::store::FileStore;

    struct MockLoader {
        descriptor: FileDescriptor,
        written: Vec<(u64, Vec<u8>)>,
    }

    /// Scriptable in-memory store: the bool knobs steer which dispatch
    /// rule fires, the maps record what the session did.
    struct MockStore {
        reject_paths: bool,
        shortcut: bool,
        modify_ok: bool,
        existing: StdMutex<HashMap<String, FileDescriptor>>,
        contents: StdMutex<HashMap<String, Vec<u8>>>,
        dirs: StdMutex<HashSet<String>>,
        loaders: StdMutex<HashMap<String, MockLoader>>,
        cancelled: StdMutex<HashMap<String, MockLoader>>,
    }

    impl MockStore {
        fn new() -> Self {
            Self {
                reject_paths: false,
                shortcut: false,
                modify_ok: true,
                existing: StdMutex::new(HashMap::new()),
                contents: StdMutex::new(HashMap::new()),
                dirs: StdMutex::new(HashSet::new()),
                loaders: StdMutex::new(HashMap::new()),
                cancelled: StdMutex::new(HashMap::new()),
            }
        }
    }

    impl FileStore for MockStore {
        fn is_safe_path_name(&self, path: &str) -> bool {
            !self.reject_paths && !path.contains("..")
        }

        fn file_name_exists(&self, path: &str) -> bool {
            self.existing.lock().unwrap().contains_key(path)
        }

        fn file_matches(&self, path: &str, md5: &str) -> bool {
            self.existing
                .lock()
                .unwrap()
                .get(path)
                .is_some_and(|fd| fd.md5 == md5)
        }

        fn dir_name_exists(&self, path: &str) -> bool {
            self.dirs.lock().unwrap().contains(path)
        }

        fn create_file_loader(
            &self,
            path: &str,
            descriptor: &FileDescriptor,
        ) -> Result<(), StoreError> {
            self.loaders.lock().unwrap().insert(
                path.to_string(),
                MockLoader {
                    descriptor: descriptor.clone(),
                    written: Vec::new(),
                },
            );
            Ok(())
        }

        fn modify_file_loader(
            &self,
            path: &str,
            md5: &str,
            last_modified: i64,
        ) -> Result<bool, StoreError> {
            if !self.modify_ok {
                return Ok(false);
            }
            let file_size = match self.existing.lock().unwrap().get(path) {
                Some(old) => old.file_size,
                None => return Ok(false),
            };
            self.loaders.lock().unwrap().insert(
                path.to_string(),
                MockLoader {
                    descriptor: FileDescriptor {
                        md5: md5.to_string(),
                        last_modified,
                        file_size,
                    },
                    written: Vec::new(),
                },
            );
            Ok(true)
        }

        fn check_shortcut(&self, path: &str) -> Result<bool, StoreError> {
            if !self.shortcut {
                return Ok(false);
            }
            self.loaders.lock().unwrap().remove(path);
            Ok(true)
        }

        fn write_file(&self, path: &str, bytes: &[u8], position: u64) -> Result<(), StoreError> {
            let mut loaders = self.loaders.lock().unwrap();
            let loader = loaders.get_mut(path).ok_or_else(|| StoreError::NoLoader {
                path: path.to_string(),
            })?;
            loader.written.push((position, bytes.to_vec()));
            Ok(())
        }

        fn check_write_complete(&self, path: &str) -> Result<bool, StoreError> {
            let loaders = self.loaders.lock().unwrap();
            let loader = loaders.get(path).ok_or_else(|| StoreError::NoLoader {
                path: path.to_string(),
            })?;
            let mut ranges: Vec<(u64, u64)> = loader
                .written
                .iter()
                .map(|(position, bytes)| (*position, position + bytes.len() as u64))
                .collect();
            ranges.sort_unstable();
            let mut end = 0;
            for (start, range_end) in ranges {
                if start > end {
                    return Ok(false);
                }
                end = end.max(range_end);
            }
            Ok(end == loader.descriptor.file_size)
        }

        fn cancel_file_loader(&self, path: &str) -> Result<(), StoreError> {
            if let Some(loader) = self.loaders.lock().unwrap().remove(path) {
                self.cancelled.lock().unwrap().insert(path.to_string(), loader);
            }
            Ok(())
        }

        fn read_file(&self, md5: &str, position: u64, length: u64) -> Result<Vec<u8>, StoreError> {
            let contents = self.contents.lock().unwrap();
            let bytes = contents.get(md5).ok_or_else(|| StoreError::UnknownContent {
                md5: md5.to_string(),
            })?;
            let start = position as usize;
            bytes
                .get(start..start + length as usize)
                .map(|slice| slice.to_vec())
                .ok_or_else(|| {
                    StoreError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "short read",
                    ))
                })
        }

        fn delete_file(&self, path: &str, last_modified: i64, md5: &str) -> bool {
            let mut existing = self.existing.lock().unwrap();
            match existing.get(path) {
                Some(fd) if fd.md5 == md5 && fd.last_modified <= last_modified => {
                    existing.remove(path);
                    true
                }
                _ => false,
            }
        }

        fn make_directory(&self, path: &str) -> bool {
            self.dirs.lock().unwrap().insert(path.to_string())
        }

        fn delete_directory(&self, path: &str) -> bool {
            self.dirs.lock().unwrap().remove(path)
        }
    }

    fn hp(host: &str, port: u16) -> HostPort {
        HostPort::new(host, port)
    }

    fn descriptor(md5: &str, last_modified: i64, file_size: u64) -> FileDescriptor {
        FileDescriptor {
            md5: md5.to_string(),
            last_modified,
            file_size,
        }
    }

    async fn spawn_node(
        store: Arc<MockStore>,
        block_size: u64,
        max_connections: usize,
    ) -> (Arc<LocalNode>, SocketAddr) {
        let node = LocalNode::new(store, hp("local", 9000), block_size, max_connections);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_node = node.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let _ = accept_node.clone().accept(stream).await;
            }
        });
        (node, addr)
    }

    struct TestPeer {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl TestPeer {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, write_half) = stream.into_split();
            Self {
                reader: BufReader::new(read_half),
                writer: write_half,
            }
        }

        async fn send(&mut self, msg: &Message) {
            let line = wire::encode_line(msg).unwrap();
            self.send_raw(&line).await;
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        /// Next message, or None on EOF. Panics after five seconds.
        async fn recv(&mut self) -> Option<Message> {
            let mut line = String::new();
            let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for a message")
                .expect("read failed");
            if n == 0 {
                None
            } else {
                Some(wire::decode_line(line.trim_end()).expect("undecodable line"))
            }
        }

        async fn handshake(&mut self, advertised: HostPort) {
            self.send(&Message::HandshakeRequest {
                host_port: advertised,
            })
            .await;
            match self.recv().await {
                Some(Message::HandshakeResponse { .. }) => {}
                other => panic!("expected handshake response, got {other:?}"),
            }
        }
    }

    /// Poll until the node sees `peer` as a connected endpoint.
    async fn wait_connected(node: &Arc<LocalNode>, peer: &HostPort) {
        for _ in 0..200 {
            if node.connected_peers(&hp("nobody", 0)).await.contains(peer) {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("{peer} never registered as connected");
    }

    #[tokio::test]
    async fn handshake_completes() {
        let (node, addr) = spawn_node(Arc::new(MockStore::new()), 1024, 4).await;
        let mut peer = TestPeer::connect(addr).await;
        peer.send(&Message::HandshakeRequest {
            host_port: hp("a", 1),
        })
        .await;
        match peer.recv().await {
            Some(Message::HandshakeResponse { host_port }) => {
                assert_eq!(host_port, hp("local", 9000));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        wait_connected(&node, &hp("a", 1)).await;
    }

    #[tokio::test]
    async fn duplicate_handshake_terminates_session() {
        let (node, addr) = spawn_node(Arc::new(MockStore::new()), 1024, 4).await;
        let mut peer = TestPeer::connect(addr).await;
        peer.handshake(hp("a", 1)).await;
        peer.send(&Message::HandshakeRequest {
            host_port: hp("a", 1),
        })
        .await;
        match peer.recv().await {
            Some(Message::InvalidProtocol { message }) => {
                assert_eq!(message, protocol::MSG_DUPLICATE_HANDSHAKE);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(peer.recv().await.is_none(), "socket should be closed");
        for _ in 0..200 {
            if node.session_count().await == 0 {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("session never deregistered");
    }

    #[tokio::test]
    async fn undecodable_line_is_a_protocol_violation() {
        let (_node, addr) = spawn_node(Arc::new(MockStore::new()), 1024, 4).await;
        let mut peer = TestPeer::connect(addr).await;
        peer.handshake(hp("a", 1)).await;
        peer.send_raw(r#"{"command":"FILE_CREATE_REQUEST"}"#).await;
        match peer.recv().await {
            Some(Message::InvalidProtocol { message }) => {
                assert_eq!(message, protocol::MSG_MISSING_FIELDS);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(peer.recv().await.is_none(), "socket should be closed");
    }

    #[tokio::test]
    async fn messages_before_handshake_are_dropped() {
        let store = Arc::new(MockStore::new());
        let (_node, addr) = spawn_node(store.clone(), 1024, 4).await;
        let mut peer = TestPeer::connect(addr).await;
        peer.send(&Message::DirectoryCreateRequest {
            path_name: "early".into(),
        })
        .await;
        peer.send(&Message::HandshakeRequest {
            host_port: hp("a", 1),
        })
        .await;
        // The first reply must be the handshake response, not a directory
        // response for the early request.
        match peer.recv().await {
            Some(Message::HandshakeResponse { .. }) => {}
            other => panic!("unexpected reply: {other:?}"),
        }
        peer.send(&Message::DirectoryCreateRequest {
            path_name: "late".into(),
        })
        .await;
        match peer.recv().await {
            Some(Message::DirectoryCreateResponse { path_name, status, .. }) => {
                assert_eq!(path_name, "late");
                assert!(status);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(!store.dirs.lock().unwrap().contains("early"));
    }

    #[tokio::test]
    async fn refusal_hints_connected_peers_excluding_requester() {
        let (node, addr) = spawn_node(Arc::new(MockStore::new()), 1024, 1).await;
        let mut first = TestPeer::connect(addr).await;
        first.handshake(hp("c", 3)).await;
        wait_connected(&node, &hp("c", 3)).await;

        let mut second = TestPeer::connect(addr).await;
        second
            .send(&Message::HandshakeRequest {
                host_port: hp("d", 4),
            })
            .await;
        match second.recv().await {
            Some(Message::ConnectionRefused { message, peers }) => {
                assert_eq!(message, protocol::MSG_MAX_CONNECTIONS);
                assert_eq!(peers, vec![hp("c", 3)]);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(second.recv().await.is_none(), "socket should be closed");
    }

    #[tokio::test]
    async fn create_drives_chunked_transfer_to_completion() {
        let store = Arc::new(MockStore::new());
        let (_node, addr) = spawn_node(store.clone(), 2, 4).await;
        let mut peer = TestPeer::connect(addr).await;
        peer.handshake(hp("a", 1)).await;

        let payload = b"hello";
        let fd = descriptor("x", 100, payload.len() as u64);
        peer.send(&Message::FileCreateRequest {
            file_descriptor: fd.clone(),
            path_name: "f".into(),
        })
        .await;
        match peer.recv().await {
            Some(Message::FileCreateResponse { status, message, .. }) => {
                assert!(status);
                assert_eq!(message, "File loader ready");
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        // Block size 2 over 5 bytes: three requests, then the loader
        // completes and no fourth request arrives.
        for (expect_position, expect_length) in [(0u64, 2u64), (2, 2), (4, 1)] {
            match peer.recv().await {
                Some(Message::FileBytesRequest {
                    position,
                    length,
                    path_name,
                    file_descriptor,
                }) => {
                    assert_eq!(position, expect_position);
                    assert_eq!(length, expect_length);
                    let chunk =
                        &payload[position as usize..(position + length) as usize];
                    peer.send(&Message::FileBytesResponse {
                        file_descriptor,
                        path_name,
                        position,
                        length,
                        content: BASE64.encode(chunk),
                        message: "successful read".into(),
                        status: true,
                    })
                    .await;
                }
                other => panic!("unexpected reply: {other:?}"),
            }
        }

        for _ in 0..200 {
            if store.cancelled.lock().unwrap().contains_key("f") {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let cancelled = store.cancelled.lock().unwrap();
        let loader = cancelled.get("f").expect("loader should be finalized");
        let positions: Vec<u64> = loader.written.iter().map(|(p, _)| *p).collect();
        assert_eq!(positions, vec![0, 2, 4]);
        let mut assembled = Vec::new();
        for (_, bytes) in &loader.written {
            assembled.extend_from_slice(bytes);
        }
        assert_eq!(assembled, payload);
    }

    #[tokio::test]
    async fn shortcut_skips_the_transfer() {
        let store = Arc::new(MockStore {
            shortcut: true,
            ..MockStore::new()
        });
        let (_node, addr) = spawn_node(store, 1024, 4).await;
        let mut peer = TestPeer::connect(addr).await;
        peer.handshake(hp("a", 1)).await;
        peer.send(&Message::FileCreateRequest {
            file_descriptor: descriptor("x", 100, 5),
            path_name: "f".into(),
        })
        .await;
        match peer.recv().await {
            Some(Message::FileCreateResponse { status, message, .. }) => {
                assert!(!status);
                assert_eq!(
                    message,
                    "There is a file with the same content, no need to transfer it again."
                );
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        // No FILE_BYTES_REQUEST in between: the very next reply belongs to
        // this marker request.
        peer.send(&Message::DirectoryCreateRequest {
            path_name: "marker".into(),
        })
        .await;
        match peer.recv().await {
            Some(Message::DirectoryCreateResponse { path_name, .. }) => {
                assert_eq!(path_name, "marker");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsafe_path_rule_fires_before_content_rules() {
        let store = Arc::new(MockStore::new());
        store
            .existing
            .lock()
            .unwrap()
            .insert("../evil".to_string(), descriptor("x", 50, 5));
        let (_node, addr) = spawn_node(store.clone(), 1024, 4).await;
        let mut peer = TestPeer::connect(addr).await;
        peer.handshake(hp("a", 1)).await;
        peer.send(&Message::FileCreateRequest {
            file_descriptor: descriptor("x", 100, 5),
            path_name: "../evil".into(),
        })
        .await;
        match peer.recv().await {
            Some(Message::FileCreateResponse { status, message, .. }) => {
                assert!(!status);
                assert!(message.starts_with("Path name is unsafe"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(store.loaders.lock().unwrap().is_empty(), "no store mutation");
    }

    #[tokio::test]
    async fn create_overwrites_older_version() {
        let store = Arc::new(MockStore::new());
        store
            .existing
            .lock()
            .unwrap()
            .insert("f".to_string(), descriptor("old", 50, 5));
        let (_node, addr) = spawn_node(store, 1024, 4).await;
        let mut peer = TestPeer::connect(addr).await;
        peer.handshake(hp("a", 1)).await;
        peer.send(&Message::FileCreateRequest {
            file_descriptor: descriptor("x", 100, 5),
            path_name: "f".into(),
        })
        .await;
        match peer.recv().await {
            Some(Message::FileCreateResponse { status, message, .. }) => {
                assert!(status);
                assert_eq!(message, "Overwrite the older version");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        match peer.recv().await {
            Some(Message::FileBytesRequest { position, length, .. }) => {
                assert_eq!(position, 0);
                assert_eq!(length, 5);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_refuses_newer_on_disk_version() {
        let store = Arc::new(MockStore {
            modify_ok: false,
            ..MockStore::new()
        });
        store
            .existing
            .lock()
            .unwrap()
            .insert("f".to_string(), descriptor("old", 500, 5));
        let (_node, addr) = spawn_node(store, 1024, 4).await;
        let mut peer = TestPeer::connect(addr).await;
        peer.handshake(hp("a", 1)).await;
        peer.send(&Message::FileCreateRequest {
            file_descriptor: descriptor("x", 100, 5),
            path_name: "f".into(),
        })
        .await;
        match peer.recv().await {
            Some(Message::FileCreateResponse { status, message, .. }) => {
                assert!(!status);
                assert_eq!(message, "There is a newer version: File create request failed");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_modify_is_refused() {
        let store = Arc::new(MockStore {
            modify_ok: false,
            ..MockStore::new()
        });
        store
            .existing
            .lock()
            .unwrap()
            .insert("f".to_string(), descriptor("old", 500, 5));
        let (_node, addr) = spawn_node(store, 1024, 4).await;
        let mut peer = TestPeer::connect(addr).await;
        peer.handshake(hp("a", 1)).await;
        peer.send(&Message::FileModifyRequest {
            file_descriptor: descriptor("new", 100, 5),
            path_name: "f".into(),
        })
        .await;
        match peer.recv().await {
            Some(Message::FileModifyResponse { status, message, .. }) => {
                assert!(!status);
                assert_eq!(message, "File doesn't exist: File modify request failed");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn serves_file_bytes_from_the_store() {
        let store = Arc::new(MockStore::new());
        store
            .contents
            .lock()
            .unwrap()
            .insert("abc".to_string(), b"0123456789".to_vec());
        let (_node, addr) = spawn_node(store, 1024, 4).await;
        let mut peer = TestPeer::connect(addr).await;
        peer.handshake(hp("a", 1)).await;
        peer.send(&Message::FileBytesRequest {
            file_descriptor: descriptor("abc", 0, 10),
            path_name: "f".into(),
            position: 3,
            length: 4,
        })
        .await;
        match peer.recv().await {
            Some(Message::FileBytesResponse {
                position,
                length,
                content,
                message,
                status,
                ..
            }) => {
                assert_eq!(position, 3);
                assert_eq!(length, 4);
                assert_eq!(content, BASE64.encode(b"3456"));
                assert_eq!(message, "successful read");
                assert!(status);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_chunk_abandons_the_transfer() {
        let store = Arc::new(MockStore::new());
        let (_node, addr) = spawn_node(store.clone(), 2, 4).await;
        let mut peer = TestPeer::connect(addr).await;
        peer.handshake(hp("a", 1)).await;
        peer.send(&Message::FileCreateRequest {
            file_descriptor: descriptor("x", 100, 5),
            path_name: "f".into(),
        })
        .await;
        assert!(matches!(
            peer.recv().await,
            Some(Message::FileCreateResponse { status: true, .. })
        ));
        let request = peer.recv().await;
        assert!(matches!(request, Some(Message::FileBytesRequest { .. })));
        peer.send(&Message::FileBytesResponse {
            file_descriptor: descriptor("x", 100, 5),
            path_name: "f".into(),
            position: 0,
            length: 2,
            content: String::new(),
            message: "unsuccessful read".into(),
            status: false,
        })
        .await;
        for _ in 0..200 {
            if store.cancelled.lock().unwrap().contains_key("f") {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let cancelled = store.cancelled.lock().unwrap();
        let loader = cancelled.get("f").expect("loader should be abandoned");
        assert!(loader.written.is_empty(), "nothing should have been written");
    }

    #[tokio::test]
    async fn delete_and_directory_rules() {
        let store = Arc::new(MockStore::new());
        store
            .existing
            .lock()
            .unwrap()
            .insert("f".to_string(), descriptor("x", 100, 5));
        let (_node, addr) = spawn_node(store, 1024, 4).await;
        let mut peer = TestPeer::connect(addr).await;
        peer.handshake(hp("a", 1)).await;

        peer.send(&Message::FileDeleteRequest {
            file_descriptor: descriptor("x", 100, 5),
            path_name: "f".into(),
        })
        .await;
        match peer.recv().await {
            Some(Message::FileDeleteResponse { status, message, .. }) => {
                assert!(status);
                assert_eq!(message, "The file was deleted");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        peer.send(&Message::FileDeleteRequest {
            file_descriptor: descriptor("x", 100, 5),
            path_name: "f".into(),
        })
        .await;
        match peer.recv().await {
            Some(Message::FileDeleteResponse { status, message, .. }) => {
                assert!(!status);
                assert_eq!(message, "File doesn't exist: File delete request failed");
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        peer.send(&Message::DirectoryCreateRequest { path_name: "d".into() }).await;
        match peer.recv().await {
            Some(Message::DirectoryCreateResponse { status, message, .. }) => {
                assert!(status);
                assert_eq!(message, "Directory was created");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        peer.send(&Message::DirectoryCreateRequest { path_name: "d".into() }).await;
        match peer.recv().await {
            Some(Message::DirectoryCreateResponse { status, message, .. }) => {
                assert!(!status);
                assert_eq!(
                    message,
                    "Directory name has existed: Directory create request failed"
                );
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        peer.send(&Message::DirectoryDeleteRequest { path_name: "d".into() }).await;
        match peer.recv().await {
            Some(Message::DirectoryDeleteResponse { status, message, .. }) => {
                assert!(status);
                assert_eq!(message, "Directory was deleted");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        peer.send(&Message::DirectoryDeleteRequest { path_name: "d".into() }).await;
        match peer.recv().await {
            Some(Message::DirectoryDeleteResponse { status, message, .. }) => {
                assert!(!status);
                assert_eq!(
                    message,
                    "Directory doesn't exist: Directory delete request failed"
                );
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fan_out_only_reaches_handshaken_sessions() {
        let (node, addr) = spawn_node(Arc::new(MockStore::new()), 1024, 4).await;
        let mut ready = TestPeer::connect(addr).await;
        ready.handshake(hp("a", 1)).await;
        wait_connected(&node, &hp("a", 1)).await;
        let mut silent = TestPeer::connect(addr).await;
        for _ in 0..200 {
            if node.session_count().await == 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        node.process_file_system_event(&FileSystemEvent::FileCreate {
            path: "f".into(),
            descriptor: descriptor("x", 100, 5),
        })
        .await;

        match ready.recv().await {
            Some(Message::FileCreateRequest { path_name, file_descriptor }) => {
                assert_eq!(path_name, "f");
                assert_eq!(file_descriptor, descriptor("x", 100, 5));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        let mut line = String::new();
        let quiet = timeout(
            Duration::from_millis(200),
            silent.reader.read_line(&mut line),
        )
        .await;
        assert!(quiet.is_err(), "pre-handshake session must stay silent");
    }

    #[tokio::test]
    async fn concurrent_writers_keep_lines_whole() {
        let (node, addr) = spawn_node(Arc::new(MockStore::new()), 1024, 4).await;
        let mut peer = TestPeer::connect(addr).await;
        peer.handshake(hp("a", 1)).await;
        wait_connected(&node, &hp("a", 1)).await;

        let fan_out_node = node.clone();
        let fan_out = tokio::spawn(async move {
            for i in 0..25 {
                fan_out_node
                    .process_file_system_event(&FileSystemEvent::DirectoryCreate {
                        path: format!("fanned-{i}"),
                    })
                    .await;
            }
        });
        for i in 0..25 {
            peer.send(&Message::DirectoryCreateRequest {
                path_name: format!("asked-{i}"),
            })
            .await;
        }
        // 25 fanned-out requests plus 25 responses; every line must decode,
        // which a torn write would break.
        for _ in 0..50 {
            assert!(peer.recv().await.is_some());
        }
        fan_out.await.unwrap();
    }

    #[tokio::test]
    async fn refusal_fallback_reaches_first_live_candidate() {
        let node = LocalNode::new(Arc::new(MockStore::new()), hp("a-host", 9), 1024, 8);

        let refusing = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let refusing_addr = refusing.local_addr().unwrap();
        let candidate = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let candidate_addr = candidate.local_addr().unwrap();
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let refusing_task = tokio::spawn(async move {
            let (stream, _) = refusing.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert!(matches!(
                wire::decode_line(line.trim_end()).unwrap(),
                Message::HandshakeRequest { .. }
            ));
            let refusal = wire::encode_line(&Message::ConnectionRefused {
                message: protocol::MSG_MAX_CONNECTIONS.to_string(),
                peers: vec![
                    hp("127.0.0.1", dead_addr.port()),
                    hp("127.0.0.1", candidate_addr.port()),
                ],
            })
            .unwrap();
            write_half.write_all(refusal.as_bytes()).await.unwrap();
            write_half.write_all(b"\n").await.unwrap();
        });

        let candidate_task = tokio::spawn(async move {
            let (stream, _) = candidate.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            match wire::decode_line(line.trim_end()).unwrap() {
                Message::HandshakeRequest { host_port } => {
                    assert_eq!(host_port, hp("a-host", 9));
                }
                other => panic!("expected handshake request, got {other:?}"),
            }
            let response = wire::encode_line(&Message::HandshakeResponse {
                host_port: hp("127.0.0.1", 0),
            })
            .unwrap();
            write_half.write_all(response.as_bytes()).await.unwrap();
            write_half.write_all(b"\n").await.unwrap();
            // Hold the socket open long enough for the session to read
            // the response.
            sleep(Duration::from_millis(500)).await;
        });

        let stream = TcpStream::connect(refusing_addr).await.unwrap();
        let session = node
            .clone()
            .connect(stream, hp("127.0.0.1", refusing_addr.port()))
            .await
            .unwrap();

        refusing_task.await.unwrap();
        candidate_task.await.unwrap();

        for _ in 0..200 {
            if session.handshake_completed() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(session.handshake_completed());
        assert_eq!(
            session.client_host_port().await,
            hp("127.0.0.1", candidate_addr.port())
        );
    }
}
