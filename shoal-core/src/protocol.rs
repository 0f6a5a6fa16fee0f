//! Sync protocol message types.

use serde::{Deserialize, Serialize};

use crate::hostport::HostPort;

/// Reason sent with INVALID_PROTOCOL when a line fails to decode or
/// validate.
pub const MSG_MISSING_FIELDS: &str = "Invalid protocol: the message misses required fields";

/// Reason sent with INVALID_PROTOCOL on a duplicate handshake request.
pub const MSG_DUPLICATE_HANDSHAKE: &str = "Invalid protocol: handshake has been completed";

/// Reason sent with INVALID_PROTOCOL when CONNECTION_REFUSED arrives on a
/// session whose handshake already completed.
pub const MSG_UNEXPECTED_REFUSAL: &str = "Invalid protocol: unexpected CONNECTION_REFUSED";

/// Message sent with CONNECTION_REFUSED when the session cap is reached.
pub const MSG_MAX_CONNECTIONS: &str = "The maximum connections has been reached";

/// Identifies one version of a file: content hash, mtime, size. Never
/// mutated after construction; `last_modified` is echoed exactly as the
/// store produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub md5: String,
    pub last_modified: i64,
    pub file_size: u64,
}

/// All protocol messages. One JSON object per line on the wire; the
/// `command` field selects the variant (see the wire module for the
/// line codec).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// First message on any session, sent by the initiator. Carries the
    /// sender's advertised endpoint.
    #[serde(rename_all = "camelCase")]
    HandshakeRequest { host_port: HostPort },
    /// Accepts a handshake; carries the responder's advertised endpoint.
    #[serde(rename_all = "camelCase")]
    HandshakeResponse { host_port: HostPort },
    /// Rejects a handshake, hinting other peers worth trying.
    ConnectionRefused {
        message: String,
        peers: Vec<HostPort>,
    },
    /// Terminal protocol-violation report.
    InvalidProtocol { message: String },

    #[serde(rename_all = "camelCase")]
    FileCreateRequest {
        file_descriptor: FileDescriptor,
        path_name: String,
    },
    #[serde(rename_all = "camelCase")]
    FileCreateResponse {
        file_descriptor: FileDescriptor,
        path_name: String,
        message: String,
        status: bool,
    },
    #[serde(rename_all = "camelCase")]
    FileDeleteRequest {
        file_descriptor: FileDescriptor,
        path_name: String,
    },
    #[serde(rename_all = "camelCase")]
    FileDeleteResponse {
        file_descriptor: FileDescriptor,
        path_name: String,
        message: String,
        status: bool,
    },
    #[serde(rename_all = "camelCase")]
    FileModifyRequest {
        file_descriptor: FileDescriptor,
        path_name: String,
    },
    #[serde(rename_all = "camelCase")]
    FileModifyResponse {
        file_descriptor: FileDescriptor,
        path_name: String,
        message: String,
        status: bool,
    },
    /// Ask the peer for one chunk of a file it advertised.
    #[serde(rename_all = "camelCase")]
    FileBytesRequest {
        file_descriptor: FileDescriptor,
        path_name: String,
        position: u64,
        length: u64,
    },
    /// One chunk of file content, Base64-encoded.
    #[serde(rename_all = "camelCase")]
    FileBytesResponse {
        file_descriptor: FileDescriptor,
        path_name: String,
        position: u64,
        length: u64,
        content: String,
        message: String,
        status: bool,
    },
    #[serde(rename_all = "camelCase")]
    DirectoryCreateRequest { path_name: String },
    #[serde(rename_all = "camelCase")]
    DirectoryCreateResponse {
        path_name: String,
        message: String,
        status: bool,
    },
    #[serde(rename_all = "camelCase")]
    DirectoryDeleteRequest { path_name: String },
    #[serde(rename_all = "camelCase")]
    DirectoryDeleteResponse {
        path_name: String,
        message: String,
        status: bool,
    },
}
