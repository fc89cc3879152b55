use std::net::SocketAddr;
use std::ops::Range;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::Timeouts;
use crate::descriptor::{ChunkDigest, sha1_digest};
use crate::error::{PairError, Result};
use crate::identity::{Identity, PublicKeyBytes, short_key};
use crate::peer::handshake;
use crate::peer::message::{ChunkRequest, ChunkResponse, FrameReader, PeerMessage, write_message};

/// Lifecycle of one outbound connection. Requests go out one at a time, so
/// `RequestSent` and `AwaitingResponse` always return to `Ready` or end in
/// `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Ready,
    RequestSent,
    AwaitingResponse,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPayload {
    pub data: Vec<u8>,
    pub digest: ChunkDigest,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub requests: u64,
    pub responses: u64,
    pub timeouts: u64,
    pub stale_discarded: u64,
    pub bytes_received: u64,
}

#[derive(Debug)]
pub struct PeerConnection {
    pub addr: SocketAddr,
    pub stats: ConnectionStats,
    state: ConnectionState,
    stream: Option<TcpStream>,
    reader: FrameReader,
    remote_key: Option<PublicKeyBytes>,
    timeouts: Timeouts,
}

impl PeerConnection {
    /// `max_frame` bounds every incoming frame; size it to the largest chunk
    /// the session expects plus framing overhead.
    pub fn new(addr: SocketAddr, timeouts: Timeouts, max_frame: usize) -> Self {
        Self {
            addr,
            stats: ConnectionStats::default(),
            state: ConnectionState::Disconnected,
            stream: None,
            reader: FrameReader::new(max_frame),
            remote_key: None,
            timeouts,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Public key the peer proved ownership of. `None` until the handshake
    /// succeeds.
    pub fn remote_key(&self) -> Option<&PublicKeyBytes> {
        self.remote_key.as_ref()
    }

    /// Dials the peer and runs the handshake. On any failure the connection
    /// ends up `Closed` and is never usable for requests.
    pub async fn connect(
        &mut self,
        identity: &Identity,
        expected_key: Option<PublicKeyBytes>,
    ) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(PairError::Protocol(format!(
                "cannot connect from state {:?}",
                self.state
            )));
        }

        let mut stream = match timeout(self.timeouts.connect, TcpStream::connect(self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state = ConnectionState::Closed;
                return Err(e.into());
            }
            Err(_) => {
                self.state = ConnectionState::Closed;
                return Err(PairError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.addr),
                )));
            }
        };

        self.state = ConnectionState::Handshaking;
        match handshake::initiate(
            &mut stream,
            &mut self.reader,
            identity,
            self.addr,
            expected_key,
            self.timeouts.handshake,
        )
        .await
        {
            Ok(key) => {
                debug!(peer = %self.addr, key = %short_key(&key), "handshake complete");
                self.remote_key = Some(key);
                self.stream = Some(stream);
                self.state = ConnectionState::Ready;
                Ok(())
            }
            Err(e) => {
                let _ = stream.shutdown().await;
                self.state = ConnectionState::Closed;
                Err(e)
            }
        }
    }

    /// Convenience for `new` followed by `connect`.
    pub async fn open(
        addr: SocketAddr,
        identity: &Identity,
        expected_key: Option<PublicKeyBytes>,
        timeouts: Timeouts,
        max_frame: usize,
    ) -> Result<Self> {
        let mut conn = Self::new(addr, timeouts, max_frame);
        conn.connect(identity, expected_key).await?;
        Ok(conn)
    }

    /// Requests one chunk and waits at most the request timeout for it.
    ///
    /// A timeout leaves the connection `Ready`; whatever the peer sends for
    /// that request later is discarded. Transport and protocol failures close
    /// the connection.
    pub async fn request_chunk(
        &mut self,
        file: &str,
        index: usize,
        range: Range<u64>,
    ) -> Result<ChunkPayload> {
        if self.state != ConnectionState::Ready {
            return Err(PairError::Protocol(format!(
                "connection to {} is {:?}, not ready",
                self.addr, self.state
            )));
        }
        let wire_index = u32::try_from(index)
            .map_err(|_| PairError::Protocol(format!("chunk index {index} does not fit a request")))?;
        let Some(stream) = self.stream.as_mut() else {
            self.state = ConnectionState::Closed;
            return Err(PairError::Protocol(format!("no stream to {}", self.addr)));
        };

        let request = PeerMessage::ChunkRequest(ChunkRequest {
            file: file.to_string(),
            index: wire_index,
            start: range.start,
            end: range.end,
        });
        if let Err(e) = write_message(stream, &request).await {
            self.state = ConnectionState::Closed;
            return Err(e);
        }
        self.stats.requests += 1;
        self.state = ConnectionState::RequestSent;
        trace!(peer = %self.addr, file, index, "chunk requested");

        self.state = ConnectionState::AwaitingResponse;
        let waited = timeout(
            self.timeouts.request,
            await_response(stream, &mut self.reader, &mut self.stats, file, index),
        )
        .await;

        match waited {
            Err(_) => {
                self.stats.timeouts += 1;
                self.state = ConnectionState::Ready;
                Err(PairError::ChunkRequestTimeout {
                    peer: self.addr,
                    file: file.to_string(),
                    index,
                })
            }
            Ok(Ok(response)) => {
                self.state = ConnectionState::Ready;
                self.stats.responses += 1;
                self.stats.bytes_received += response.payload.len() as u64;
                if sha1_digest(&response.payload) != response.digest {
                    return Err(PairError::CorruptChunk {
                        file: file.to_string(),
                        index,
                    });
                }
                Ok(ChunkPayload {
                    data: response.payload,
                    digest: response.digest,
                })
            }
            Ok(Err(e @ PairError::Remote { .. })) => {
                self.state = ConnectionState::Ready;
                Err(e)
            }
            Ok(Err(e)) => {
                self.state = ConnectionState::Closed;
                self.stream = None;
                Err(e)
            }
        }
    }

    /// Says goodbye and drops the socket. Safe to call in any state.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;
        if let Some(mut stream) = self.stream.take() {
            let _ = write_message(&mut stream, &PeerMessage::Bye).await;
            let _ = stream.shutdown().await;
        }
        self.state = ConnectionState::Closed;
    }
}

/// Reads until the response for (`file`, `index`) shows up. Responses to
/// requests that already timed out are dropped.
async fn await_response(
    stream: &mut TcpStream,
    reader: &mut FrameReader,
    stats: &mut ConnectionStats,
    file: &str,
    index: usize,
) -> Result<ChunkResponse> {
    loop {
        match reader.read_message(stream).await? {
            PeerMessage::ChunkResponse(resp) if resp.file == file && resp.index as usize == index => {
                return Ok(resp);
            }
            PeerMessage::ChunkResponse(resp) => {
                stats.stale_discarded += 1;
                debug!(file = %resp.file, index = resp.index, "discarding stale response");
            }
            PeerMessage::Error(err) => {
                return Err(PairError::Remote {
                    code: err.code,
                    message: err.message,
                });
            }
            PeerMessage::Bye => {
                return Err(PairError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "peer said bye",
                )));
            }
            other => {
                return Err(PairError::Protocol(format!(
                    "unexpected message while awaiting a chunk: {other:?}"
                )));
            }
        }
    }
}
