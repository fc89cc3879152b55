use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Timeouts;
use crate::error::{PairError, Result};
use crate::identity::{Identity, PublicKeyBytes, SignatureBytes, short_key};
use crate::peer::handshake::{self, Handshake, Role};
use crate::peer::message::{
    ChunkRequest, ChunkResponse, ERR_BAD_REQUEST, ERR_NOT_AVAILABLE, ERR_UNAUTHORIZED,
    ErrorMessage, FRAME_OVERHEAD, FrameReader, PeerMessage, write_message,
};
use crate::store::{ChunkStore, read_verified_chunk};

/// Server-side view of one inbound connection. Nothing is served until the
/// remote side has signed the challenge sent in our hello.
#[derive(Debug)]
pub struct ServingSession {
    peer: SocketAddr,
    identity: Arc<Identity>,
    /// Their hello and ours, while their proof is outstanding.
    challenge: Option<(Handshake, Handshake)>,
    remote_key: Option<PublicKeyBytes>,
    store: Arc<Mutex<ChunkStore>>,
}

impl ServingSession {
    pub fn new(peer: SocketAddr, identity: Arc<Identity>, store: Arc<Mutex<ChunkStore>>) -> Self {
        Self {
            peer,
            identity,
            challenge: None,
            remote_key: None,
            store,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.remote_key.is_some()
    }

    /// Answers the dialer's hello with ours and a proof over both. The dialer
    /// is not trusted until [`ServingSession::accept_proof`] succeeds.
    pub fn accept_hello(&mut self, hello: &Handshake) -> Result<(Handshake, SignatureBytes)> {
        if self.remote_key.is_some() || self.challenge.is_some() {
            return Err(PairError::Protocol("repeated hello".into()));
        }
        let ours = Handshake::new(&self.identity);
        let proof = handshake::prove(&self.identity, Role::Acceptor, hello, &ours);
        self.challenge = Some((hello.clone(), ours.clone()));
        Ok((ours, proof))
    }

    pub fn accept_proof(&mut self, proof: &SignatureBytes) -> Result<PublicKeyBytes> {
        let Some((theirs, ours)) = self.challenge.take() else {
            return Err(PairError::Protocol("proof without a hello".into()));
        };
        if !handshake::check(Role::Dialer, &theirs, &ours, proof) {
            return Err(PairError::HandshakeFailed {
                peer: self.peer,
                reason: "invalid signature".into(),
            });
        }
        self.remote_key = Some(theirs.public_key);
        Ok(theirs.public_key)
    }

    /// Looks up a verified chunk for an authenticated peer. The requested
    /// range has to match the chunk boundaries of the local descriptor.
    pub async fn serve_chunk(&self, request: &ChunkRequest) -> Result<ChunkResponse> {
        if self.remote_key.is_none() {
            return Err(PairError::UnauthorizedPeer(self.peer));
        }

        let index = request.index as usize;
        let range = self
            .store
            .lock()
            .await
            .descriptor(&request.file)
            .and_then(|d| d.chunk_range(index))
            .ok_or_else(|| PairError::ChunkNotAvailable {
                file: request.file.clone(),
                index,
            })?;
        if range.start != request.start || range.end != request.end {
            return Err(PairError::Protocol(format!(
                "range {}..{} does not match chunk {index} ({}..{})",
                request.start, request.end, range.start, range.end
            )));
        }

        let (payload, digest) = read_verified_chunk(&self.store, &request.file, index).await?;
        Ok(ChunkResponse {
            file: request.file.clone(),
            index: request.index,
            digest,
            payload,
        })
    }
}

fn error_frame(code: u16, message: impl Into<String>) -> PeerMessage {
    PeerMessage::Error(ErrorMessage {
        code,
        message: message.into(),
    })
}

/// Runs one inbound connection to completion: handshake first, then chunk
/// requests until the peer says bye, goes idle, or misbehaves.
pub async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    identity: Arc<Identity>,
    store: Arc<Mutex<ChunkStore>>,
    timeouts: Timeouts,
) -> Result<()> {
    let mut reader = FrameReader::new(FRAME_OVERHEAD);
    let mut session = ServingSession::new(peer, identity, store);

    let outcome = loop {
        let wait = if session.is_authenticated() {
            timeouts.idle
        } else {
            timeouts.handshake
        };
        let msg = match timeout(wait, reader.read_message(&mut stream)).await {
            Err(_) => {
                debug!(%peer, "closing quiet connection");
                break Ok(());
            }
            Ok(Err(PairError::Io(e))) if e.kind() == ErrorKind::UnexpectedEof => break Ok(()),
            Ok(Err(e)) => break Err(e),
            Ok(Ok(msg)) => msg,
        };

        match msg {
            PeerMessage::Hello(hello) => match session.accept_hello(&hello) {
                Ok((ours, proof)) => {
                    write_message(&mut stream, &PeerMessage::Hello(ours)).await?;
                    write_message(&mut stream, &PeerMessage::Proof(proof)).await?;
                }
                Err(e) => {
                    let _ = write_message(&mut stream, &error_frame(ERR_BAD_REQUEST, e.to_string())).await;
                    break Err(e);
                }
            },
            PeerMessage::Proof(proof) => match session.accept_proof(&proof) {
                Ok(key) => debug!(%peer, key = %short_key(&key), "peer authenticated"),
                Err(e) => {
                    let _ = write_message(&mut stream, &error_frame(ERR_UNAUTHORIZED, e.to_string())).await;
                    break Err(e);
                }
            },
            PeerMessage::ChunkRequest(request) => match session.serve_chunk(&request).await {
                Ok(response) => write_message(&mut stream, &PeerMessage::ChunkResponse(response)).await?,
                Err(e @ PairError::UnauthorizedPeer(_)) => {
                    let _ = write_message(&mut stream, &error_frame(ERR_UNAUTHORIZED, e.to_string())).await;
                    break Err(e);
                }
                Err(e @ PairError::Protocol(_)) => {
                    write_message(&mut stream, &error_frame(ERR_BAD_REQUEST, e.to_string())).await?;
                }
                Err(e) => {
                    debug!(%peer, file = %request.file, index = request.index, error = %e, "cannot serve chunk");
                    write_message(&mut stream, &error_frame(ERR_NOT_AVAILABLE, e.to_string())).await?;
                }
            },
            PeerMessage::Bye => break Ok(()),
            other => {
                let _ = write_message(&mut stream, &error_frame(ERR_BAD_REQUEST, "unexpected message")).await;
                break Err(PairError::Protocol(format!("unexpected message from {peer}: {other:?}")));
            }
        }
    };

    let _ = stream.shutdown().await;
    outcome
}

/// Accepts inbound peers and serves each one on its own task.
#[derive(Debug)]
pub struct PeerServer {
    listener: TcpListener,
    identity: Arc<Identity>,
    store: Arc<Mutex<ChunkStore>>,
    timeouts: Timeouts,
}

impl PeerServer {
    pub async fn bind(
        addr: SocketAddr,
        identity: Arc<Identity>,
        store: Arc<Mutex<ChunkStore>>,
        timeouts: Timeouts,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            identity,
            store,
            timeouts,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until `shutdown` flips to true or its sender goes away.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut sessions = JoinSet::new();
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "listening for peers");
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "inbound connection");
                        let identity = Arc::clone(&self.identity);
                        let store = Arc::clone(&self.store);
                        let timeouts = self.timeouts;
                        sessions.spawn(async move {
                            if let Err(e) = serve_connection(stream, peer, identity, store, timeouts).await {
                                debug!(%peer, error = %e, "session ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        sessions.abort_all();
        info!("peer listener stopped");
    }
}
