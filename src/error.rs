use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PairError>;

/// A chunk that could not be fetched before the session ran out of retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub index: usize,
    pub peers_tried: Vec<SocketAddr>,
    pub last_error: String,
}

#[derive(Error, Debug)]
pub enum PairError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("descriptor for {file} conflicts: {existing} chunks known, {proposed} proposed")]
    DescriptorConflict {
        file: String,
        existing: usize,
        proposed: usize,
    },

    #[error("invalid transition for {file}[{index}]: {from} -> {to}")]
    InvalidChunkTransition {
        file: String,
        index: usize,
        from: &'static str,
        to: &'static str,
    },

    #[error("chunk {file}[{index}] failed its integrity check")]
    CorruptChunk { file: String, index: usize },

    #[error("handshake with {peer} failed: {reason}")]
    HandshakeFailed { peer: SocketAddr, reason: String },

    #[error("request for {file}[{index}] to {peer} timed out")]
    ChunkRequestTimeout {
        peer: SocketAddr,
        file: String,
        index: usize,
    },

    #[error("chunk {file}[{index}] is not available")]
    ChunkNotAvailable { file: String, index: usize },

    #[error("peer {0} has not completed the handshake")]
    UnauthorizedPeer(SocketAddr),

    #[error("tracker unreachable after {attempts} attempts: {last_error}")]
    TrackerUnreachable { attempts: u32, last_error: String },

    #[error("tracker refused the request: {0}")]
    Tracker(String),

    #[error("no peers available for {0}")]
    NoPeersAvailable(String),

    #[error("{file} is incomplete: {} chunk(s) missing", .missing.len())]
    IncompleteFile {
        file: String,
        missing: Vec<usize>,
        failures: Vec<ChunkFailure>,
    },

    #[error("unknown file: {0}")]
    UnknownFile(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("peer reported error {code}: {message}")]
    Remote { code: u16, message: String },

    #[error("download of {0} was cancelled")]
    Cancelled(String),

    #[error("a download of {0} is already running")]
    DownloadInProgress(String),
}

impl PairError {
    /// Whether this failure makes the peer that produced it unusable for the
    /// rest of a download session, as opposed to affecting only one chunk.
    pub fn is_peer_fatal(&self) -> bool {
        matches!(
            self,
            PairError::HandshakeFailed { .. }
                | PairError::UnauthorizedPeer(_)
                | PairError::Io(_)
                | PairError::Protocol(_)
                | PairError::MessageTooLarge(_)
        )
    }
}

impl From<reqwest::Error> for PairError {
    fn from(err: reqwest::Error) -> Self {
        PairError::Io(std::io::Error::other(err))
    }
}

impl From<url::ParseError> for PairError {
    fn from(err: url::ParseError) -> Self {
        PairError::Protocol(format!("invalid tracker url: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_fatal_classification() {
        let peer: SocketAddr = "127.0.0.1:7000".parse().unwrap();

        assert!(
            PairError::HandshakeFailed {
                peer,
                reason: "bad signature".into()
            }
            .is_peer_fatal()
        );
        assert!(PairError::Io(std::io::Error::other("reset")).is_peer_fatal());

        assert!(
            !PairError::ChunkRequestTimeout {
                peer,
                file: "a".into(),
                index: 0
            }
            .is_peer_fatal()
        );
        assert!(
            !PairError::CorruptChunk {
                file: "a".into(),
                index: 1
            }
            .is_peer_fatal()
        );
        assert!(
            !PairError::Remote {
                code: 1,
                message: "missing".into()
            }
            .is_peer_fatal()
        );
    }

    #[test]
    fn test_incomplete_file_message() {
        let err = PairError::IncompleteFile {
            file: "song.mp3".into(),
            missing: vec![1, 2],
            failures: vec![],
        };
        assert_eq!(err.to_string(), "song.mp3 is incomplete: 2 chunk(s) missing");
    }
}
