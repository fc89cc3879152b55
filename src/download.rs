//! Download sessions: drive one file from wanted to complete across the
//! peers the tracker knows about.
//!
//! Every pass spreads the missing chunks round-robin over the live peers,
//! starting one position further down the list than the previous pass. Each
//! peer gets its own task and connection; the [`ChunkStore`] behind a mutex
//! is the only state they share. A chunk is claimed (`Requested`) under the
//! lock before any task sees it, so no chunk is ever in flight twice. Only
//! one session per file runs at a time on a coordinator.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, RetryPolicy, Timeouts};
use crate::descriptor::FileDescriptor;
use crate::error::{ChunkFailure, PairError, Result};
use crate::identity::{Identity, PublicKeyBytes};
use crate::peer::connection::PeerConnection;
use crate::peer::message::FRAME_OVERHEAD;
use crate::store::{ChunkStore, verify_chunk};
use crate::tracker::{PeerRecord, TrackerClient};

/// Outcome of a session that completed the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub file: String,
    pub passes: u32,
    /// Chunks each peer delivered, in delivery order.
    pub served_by: BTreeMap<SocketAddr, Vec<usize>>,
    /// Peers dropped for the session after a connection-level failure.
    pub dropped_peers: Vec<SocketAddr>,
    /// Per-chunk failures that were later recovered from another peer.
    pub recovered: Vec<ChunkFailure>,
}

/// A running download that can be cancelled.
#[derive(Debug)]
pub struct DownloadHandle {
    file: String,
    cancel: watch::Sender<bool>,
    task: JoinHandle<Result<DownloadReport>>,
}

impl DownloadHandle {
    pub fn file(&self) -> &str {
        &self.file
    }

    /// Asks the session to stop. Open connections are closed and unfinished
    /// chunks go back to `Missing`; `join` then yields `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<DownloadReport> {
        self.task
            .await
            .map_err(|e| PairError::Io(std::io::Error::other(e)))?
    }
}

pub struct DownloadCoordinator<T> {
    identity: Arc<Identity>,
    store: Arc<Mutex<ChunkStore>>,
    tracker: Arc<T>,
    timeouts: Timeouts,
    retry: RetryPolicy,
    /// Files with a session running.
    active: Arc<std::sync::Mutex<HashSet<String>>>,
}

/// Marks a file busy for as long as it lives.
#[derive(Debug)]
struct ActiveSession {
    file: String,
    active: Arc<std::sync::Mutex<HashSet<String>>>,
}

impl ActiveSession {
    fn begin(active: &Arc<std::sync::Mutex<HashSet<String>>>, file: &str) -> Result<Self> {
        let mut files = active.lock().unwrap_or_else(|e| e.into_inner());
        if !files.insert(file.to_string()) {
            return Err(PairError::DownloadInProgress(file.to_string()));
        }
        Ok(Self {
            file: file.to_string(),
            active: Arc::clone(active),
        })
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.file);
    }
}

impl<T: TrackerClient + 'static> DownloadCoordinator<T> {
    pub fn new(
        identity: Arc<Identity>,
        store: Arc<Mutex<ChunkStore>>,
        tracker: Arc<T>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            identity,
            store,
            tracker,
            timeouts: config.timeouts,
            retry: config.retry,
            active: Arc::default(),
        }
    }

    /// Whether a session for `file` is running right now.
    pub fn is_downloading(&self, file: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(file)
    }

    pub async fn download(&self, file: &str) -> Result<DownloadReport> {
        let (_keep, cancel) = watch::channel(false);
        self.run(file, cancel).await
    }

    /// Runs the session on its own task.
    pub fn spawn(self: &Arc<Self>, file: impl Into<String>) -> DownloadHandle {
        let file = file.into();
        let (tx, rx) = watch::channel(false);
        let this = Arc::clone(self);
        let name = file.clone();
        let task = tokio::spawn(async move { this.run(&name, rx).await });
        DownloadHandle {
            file,
            cancel: tx,
            task,
        }
    }

    /// Asks the tracker who has `file`, then downloads from them.
    pub async fn run(&self, file: &str, cancel: watch::Receiver<bool>) -> Result<DownloadReport> {
        let peers = self.tracker.find_peers(file).await?;
        if peers.is_empty() {
            return Err(PairError::NoPeersAvailable(file.to_string()));
        }
        self.run_with_peers(file, peers, cancel).await
    }

    /// Downloads `file` from an explicit candidate set. One peer or many is
    /// the same algorithm.
    ///
    /// Fails with `DownloadInProgress` while another session holds `file`;
    /// pending chunks belong to that session and are left alone.
    pub async fn run_with_peers(
        &self,
        file: &str,
        mut peers: Vec<PeerRecord>,
        cancel: watch::Receiver<bool>,
    ) -> Result<DownloadReport> {
        let _session = ActiveSession::begin(&self.active, file)?;
        let descriptor = Arc::new(self.resolve_descriptor(file, &peers).await?);
        peers.retain(|p| {
            let same = p
                .advertised(file)
                .is_none_or(|d| d.chunk_digests == descriptor.chunk_digests);
            if !same {
                warn!(peer = %p.addr, file, "peer advertises different content, skipping");
            }
            same
        });
        if peers.is_empty() {
            return Err(PairError::NoPeersAvailable(file.to_string()));
        }

        let keys: HashMap<SocketAddr, Option<PublicKeyBytes>> =
            peers.iter().map(|p| (p.addr, p.public_key)).collect();
        let order: Vec<SocketAddr> = peers.iter().map(|p| p.addr).collect();
        let worker = Worker {
            identity: Arc::clone(&self.identity),
            store: Arc::clone(&self.store),
            max_frame: descriptor.chunk_size as usize + FRAME_OVERHEAD,
            descriptor,
            timeouts: self.timeouts,
        };

        let mut ledger = Ledger::default();
        let mut passes = 0;
        for pass in 0..self.retry.max_passes {
            if *cancel.borrow() {
                break;
            }
            let missing: Vec<usize> = self.store.lock().await.missing_chunks(file)?.collect();
            if missing.is_empty() {
                break;
            }
            let live: Vec<SocketAddr> = order
                .iter()
                .copied()
                .filter(|a| !ledger.dropped.contains(a))
                .collect();
            let plan = plan_pass(&missing, &live, pass, &ledger, self.retry.max_chunk_attempts);
            if plan.is_empty() {
                debug!(file, pass, "no untried peer left for the missing chunks");
                break;
            }

            let plan = self.claim(file, plan).await;
            passes += 1;
            info!(file, pass, missing = missing.len(), peers = plan.len(), "starting pass");

            let mut tasks = JoinSet::new();
            for (peer, chunks) in plan {
                let worker = worker.clone();
                let expected_key = keys.get(&peer).copied().flatten();
                tasks.spawn(worker.fetch(peer, expected_key, chunks, cancel.clone()));
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => ledger.record(outcome),
                    Err(e) => warn!(file, error = %e, "peer task failed"),
                }
            }
            // Anything a crashed task left behind goes back to the pool.
            self.store.lock().await.reset_pending(file);
        }

        let mut store = self.store.lock().await;
        store.reset_pending(file);
        if *cancel.borrow() {
            info!(file, "download cancelled");
            return Err(PairError::Cancelled(file.to_string()));
        }

        let missing: Vec<usize> = store.missing_chunks(file)?.collect();
        if !missing.is_empty() {
            let failures = ledger.failures(&missing);
            warn!(file, missing = missing.len(), passes, "download incomplete");
            return Err(PairError::IncompleteFile {
                file: file.to_string(),
                missing,
                failures,
            });
        }

        info!(file, passes, "download complete");
        let recovered = ledger.failures(&ledger.failed_chunks());
        Ok(DownloadReport {
            file: file.to_string(),
            passes,
            served_by: ledger.served_by,
            dropped_peers: ledger.dropped,
            recovered,
        })
    }

    /// Uses the local descriptor when there is one, otherwise the first one a
    /// peer advertised, which is then registered locally.
    async fn resolve_descriptor(&self, file: &str, peers: &[PeerRecord]) -> Result<FileDescriptor> {
        let mut store = self.store.lock().await;
        let known = store.descriptor(file).cloned();
        match known {
            Some(descriptor) => Ok(descriptor),
            None => {
                let advertised = peers
                    .iter()
                    .find_map(|p| p.advertised(file))
                    .cloned()
                    .ok_or_else(|| {
                        PairError::Protocol(format!("no peer advertised a descriptor for {file}"))
                    })?;
                store.register_file(advertised.clone())?;
                Ok(advertised)
            }
        }
    }

    /// Moves every planned chunk to `Requested` under a single lock. Chunks
    /// that are no longer `Missing` are dropped from the plan.
    async fn claim(
        &self,
        file: &str,
        plan: Vec<(SocketAddr, Vec<usize>)>,
    ) -> Vec<(SocketAddr, Vec<usize>)> {
        let mut store = self.store.lock().await;
        plan.into_iter()
            .filter_map(|(peer, chunks)| {
                let claimed: Vec<usize> = chunks
                    .into_iter()
                    .filter(|&index| match store.mark_requested(file, index, peer) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(file, index, error = %e, "chunk already claimed");
                            false
                        }
                    })
                    .collect();
                (!claimed.is_empty()).then_some((peer, claimed))
            })
            .collect()
    }
}

/// Splits `missing` over `peers` round-robin. The list is rotated by `pass`
/// so a slow peer at the front does not get the first chunk every time.
/// Chunks skip peers that already failed them, and chunks whose attempt
/// budget is spent are left out.
fn plan_pass(
    missing: &[usize],
    peers: &[SocketAddr],
    pass: u32,
    ledger: &Ledger,
    max_attempts: u32,
) -> Vec<(SocketAddr, Vec<usize>)> {
    let n = peers.len();
    if n == 0 {
        return Vec::new();
    }
    let rotated: Vec<SocketAddr> = (0..n).map(|i| peers[(i + pass as usize) % n]).collect();
    let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); n];

    let mut cursor = 0;
    for &index in missing {
        if ledger.attempts(index) >= max_attempts {
            continue;
        }
        let tried = ledger.tried(index);
        let slot = (0..n)
            .map(|k| (cursor + k) % n)
            .find(|&slot| !tried.contains(&rotated[slot]));
        if let Some(slot) = slot {
            buckets[slot].push(index);
            cursor = slot + 1;
        }
    }

    rotated
        .into_iter()
        .zip(buckets)
        .filter(|(_, chunks)| !chunks.is_empty())
        .collect()
}

/// What the session learned about chunks and peers so far.
#[derive(Debug, Default)]
struct Ledger {
    tried: HashMap<usize, Vec<SocketAddr>>,
    attempts: HashMap<usize, u32>,
    last_error: HashMap<usize, String>,
    dropped: Vec<SocketAddr>,
    served_by: BTreeMap<SocketAddr, Vec<usize>>,
}

impl Ledger {
    fn tried(&self, index: usize) -> &[SocketAddr] {
        self.tried.get(&index).map(Vec::as_slice).unwrap_or(&[])
    }

    fn attempts(&self, index: usize) -> u32 {
        self.attempts.get(&index).copied().unwrap_or(0)
    }

    fn note_tried(&mut self, index: usize, peer: SocketAddr, error: String) {
        let tried = self.tried.entry(index).or_default();
        if !tried.contains(&peer) {
            tried.push(peer);
        }
        self.last_error.insert(index, error);
    }

    fn record(&mut self, outcome: PeerOutcome) {
        let peer = outcome.peer;
        if !outcome.delivered.is_empty() {
            self.served_by
                .entry(peer)
                .or_default()
                .extend(&outcome.delivered);
        }
        for (index, error) in outcome.failed {
            *self.attempts.entry(index).or_default() += 1;
            self.note_tried(index, peer, error);
        }
        if let Some(error) = outcome.peer_error {
            // Chunks the dead peer never got to still count as tried by it.
            for index in outcome.untouched {
                self.note_tried(index, peer, error.clone());
            }
            if !self.dropped.contains(&peer) {
                warn!(%peer, error = %error, "dropping peer for this session");
                self.dropped.push(peer);
            }
        }
    }

    fn failed_chunks(&self) -> Vec<usize> {
        let mut chunks: Vec<usize> = self.last_error.keys().copied().collect();
        chunks.sort_unstable();
        chunks
    }

    fn failures(&self, chunks: &[usize]) -> Vec<ChunkFailure> {
        chunks
            .iter()
            .map(|&index| ChunkFailure {
                index,
                peers_tried: self.tried(index).to_vec(),
                last_error: self
                    .last_error
                    .get(&index)
                    .cloned()
                    .unwrap_or_else(|| "retry budget exhausted".to_string()),
            })
            .collect()
    }
}

#[derive(Debug)]
struct PeerOutcome {
    peer: SocketAddr,
    delivered: Vec<usize>,
    failed: Vec<(usize, String)>,
    /// Chunks handed back without a request going out.
    untouched: Vec<usize>,
    /// Set when the peer became unusable.
    peer_error: Option<String>,
}

impl PeerOutcome {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            delivered: Vec::new(),
            failed: Vec::new(),
            untouched: Vec::new(),
            peer_error: None,
        }
    }
}

/// Everything one peer task needs; cheap to clone per peer.
#[derive(Debug, Clone)]
struct Worker {
    identity: Arc<Identity>,
    store: Arc<Mutex<ChunkStore>>,
    descriptor: Arc<FileDescriptor>,
    timeouts: Timeouts,
    max_frame: usize,
}

impl Worker {
    async fn fetch(
        self,
        peer: SocketAddr,
        expected_key: Option<PublicKeyBytes>,
        chunks: Vec<usize>,
        mut cancel: watch::Receiver<bool>,
    ) -> PeerOutcome {
        let file = self.descriptor.name.as_str();
        let mut outcome = PeerOutcome::new(peer);
        let mut conn = PeerConnection::new(peer, self.timeouts, self.max_frame);

        let connected = tokio::select! {
            r = conn.connect(&self.identity, expected_key) => r,
            _ = cancelled(&mut cancel) => Err(PairError::Cancelled(file.to_string())),
        };
        if let Err(e) = connected {
            if !matches!(e, PairError::Cancelled(_)) {
                warn!(%peer, error = %e, "could not open connection");
                outcome.peer_error = Some(e.to_string());
            }
            self.release(&chunks).await;
            outcome.untouched = chunks;
            conn.close().await;
            return outcome;
        }

        for (pos, &index) in chunks.iter().enumerate() {
            let Some(range) = self.descriptor.chunk_range(index) else {
                continue;
            };
            let marked = self.store.lock().await.mark_in_flight(file, index);
            if let Err(e) = marked {
                warn!(file, index, error = %e, "chunk left the requested state");
                continue;
            }

            let result = tokio::select! {
                r = conn.request_chunk(file, index, range) => r,
                _ = cancelled(&mut cancel) => Err(PairError::Cancelled(file.to_string())),
            };

            match result {
                Ok(payload) => {
                    let received = self.store.lock().await.mark_received(file, index, payload.data);
                    let stored = match received {
                        Ok(()) => verify_chunk(&self.store, file, index).await,
                        Err(e) => Err(e),
                    };
                    match stored {
                        Ok(()) => {
                            debug!(%peer, file, index, "chunk verified");
                            outcome.delivered.push(index);
                        }
                        Err(e) => {
                            self.release(&[index]).await;
                            warn!(%peer, file, index, error = %e, "chunk rejected");
                            outcome.failed.push((index, e.to_string()));
                        }
                    }
                }
                Err(PairError::Cancelled(_)) => {
                    self.release(&chunks[pos..]).await;
                    outcome.untouched.extend(&chunks[pos..]);
                    break;
                }
                Err(e) => {
                    let _ = self.store.lock().await.reset_to_missing(file, index);
                    debug!(%peer, file, index, error = %e, "chunk request failed");
                    let fatal = e.is_peer_fatal();
                    outcome.failed.push((index, e.to_string()));
                    if fatal {
                        outcome.peer_error = Some(e.to_string());
                        self.release(&chunks[pos + 1..]).await;
                        outcome.untouched.extend(&chunks[pos + 1..]);
                        break;
                    }
                }
            }
        }

        conn.close().await;
        outcome
    }

    /// Hands chunks this worker still holds back to `Missing`.
    async fn release(&self, chunks: &[usize]) {
        let file = self.descriptor.name.as_str();
        let mut store = self.store.lock().await;
        for &index in chunks {
            if store.state(file, index).is_some_and(|s| s.is_pending()) {
                let _ = store.reset_to_missing(file, index);
            }
        }
    }
}

/// Resolves once the session is cancelled. A dropped sender never cancels.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
