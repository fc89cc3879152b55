//! Per-node record of which chunks of which files are present.
//!
//! Every chunk moves through
//! `Missing -> Requested -> InFlight -> Received -> Verified`, and any
//! non-terminal state can fall back to `Missing` when a peer fails. The store
//! is not internally synchronised: owners share it behind an
//! `Arc<tokio::sync::Mutex<ChunkStore>>` so that checking and transitioning a
//! chunk happen under one lock. Storage I/O for a shared store goes through
//! [`verify_chunk`], [`read_verified_chunk`] and [`assemble_file`], which only
//! take the lock around state changes.
//!
//! Bytes of a file that is still downloading live under [`partial_name`] and
//! move to the real name once the last chunk is verified.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::descriptor::{ChunkDigest, FileDescriptor, sha1_digest};
use crate::error::{PairError, Result};
use crate::storage::Storage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkState {
    Missing,
    Requested { peer: SocketAddr },
    InFlight { peer: SocketAddr },
    /// Payload held in memory until its digest is checked.
    Received { peer: SocketAddr, data: Vec<u8> },
    Verified,
}

impl ChunkState {
    pub fn name(&self) -> &'static str {
        match self {
            ChunkState::Missing => "Missing",
            ChunkState::Requested { .. } => "Requested",
            ChunkState::InFlight { .. } => "InFlight",
            ChunkState::Received { .. } => "Received",
            ChunkState::Verified => "Verified",
        }
    }

    /// Requested, in flight or awaiting verification.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ChunkState::Requested { .. } | ChunkState::InFlight { .. } | ChunkState::Received { .. }
        )
    }
}

pub const PARTIAL_SUFFIX: &str = ".part";

pub fn partial_name(file: &str) -> String {
    format!("{file}{PARTIAL_SUFFIX}")
}

#[derive(Debug)]
struct FileEntry {
    descriptor: FileDescriptor,
    states: Vec<ChunkState>,
    /// Bytes are under the file's own name rather than the partial one.
    finalized: bool,
}

impl FileEntry {
    fn location(&self) -> String {
        if self.finalized {
            self.descriptor.name.clone()
        } else {
            partial_name(&self.descriptor.name)
        }
    }

    fn all_verified(&self) -> bool {
        self.states.iter().all(|s| *s == ChunkState::Verified)
    }
}

/// A received payload taken out of the store so it can be checked and written
/// with the lock released. The chunk stays `Received` meanwhile.
#[derive(Debug)]
pub struct StagedChunk {
    file: String,
    index: usize,
    location: String,
    range: Range<u64>,
    expected: ChunkDigest,
    data: Vec<u8>,
}

impl StagedChunk {
    /// Digest check, then the write. Nothing reaches storage on a mismatch.
    pub fn persist(&self, storage: &dyn Storage) -> Result<()> {
        let (file, index) = (self.file.as_str(), self.index);
        if self.data.len() as u64 != self.range.end - self.range.start
            || sha1_digest(&self.data) != self.expected
        {
            warn!(file, index, "chunk failed integrity check");
            return Err(PairError::CorruptChunk {
                file: file.to_string(),
                index,
            });
        }
        storage
            .write(&self.location, self.range.start, &self.data)
            .inspect_err(|e| warn!(file, index, error = %e, "failed to persist verified chunk"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub verified: usize,
    pub pending: usize,
    pub missing: usize,
    pub total: usize,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.verified == self.total
    }
}

/// Ascending indices of chunks currently `Missing`. Cloning restarts the walk
/// from where the clone was taken.
#[derive(Debug, Clone)]
pub struct MissingChunks<'a> {
    states: &'a [ChunkState],
    next: usize,
}

impl Iterator for MissingChunks<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.next < self.states.len() {
            let index = self.next;
            self.next += 1;
            if self.states[index] == ChunkState::Missing {
                return Some(index);
            }
        }
        None
    }
}

pub struct ChunkStore {
    files: HashMap<String, FileEntry>,
    storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut files: Vec<&String> = self.files.keys().collect();
        files.sort();
        f.debug_struct("ChunkStore").field("files", &files).finish_non_exhaustive()
    }
}

impl ChunkStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            files: HashMap::new(),
            storage,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Adds a file we want, or refreshes the descriptor of a known one. Chunk
    /// states survive a refresh as long as the chunk layout is unchanged.
    pub fn register_file(&mut self, descriptor: FileDescriptor) -> Result<()> {
        if !descriptor.is_consistent() {
            return Err(PairError::Protocol(format!(
                "descriptor for {} has {} digests for {} chunks",
                descriptor.name,
                descriptor.chunk_digests.len(),
                descriptor.chunk_count()
            )));
        }

        match self.files.get_mut(&descriptor.name) {
            Some(entry) => {
                let existing = entry.descriptor.chunk_count();
                let proposed = descriptor.chunk_count();
                if existing != proposed {
                    return Err(PairError::DescriptorConflict {
                        file: descriptor.name,
                        existing,
                        proposed,
                    });
                }
                entry.descriptor = descriptor;
            }
            None => {
                let states = vec![ChunkState::Missing; descriptor.chunk_count()];
                debug!(file = %descriptor.name, chunks = states.len(), "registered file");
                let entry = FileEntry {
                    finalized: states.is_empty(),
                    descriptor,
                    states,
                };
                self.files.insert(entry.descriptor.name.clone(), entry);
            }
        }
        Ok(())
    }

    /// Registers a file whose bytes are already in storage under its own
    /// name; every chunk starts out `Verified`.
    pub fn publish(&mut self, descriptor: FileDescriptor) -> Result<()> {
        let name = descriptor.name.clone();
        self.register_file(descriptor)?;
        if let Some(entry) = self.files.get_mut(&name) {
            entry.states.fill(ChunkState::Verified);
            entry.finalized = true;
        }
        Ok(())
    }

    pub fn descriptor(&self, file: &str) -> Option<&FileDescriptor> {
        self.files.get(file).map(|entry| &entry.descriptor)
    }

    pub fn state(&self, file: &str, index: usize) -> Option<&ChunkState> {
        self.files.get(file)?.states.get(index)
    }

    /// Descriptors of every complete file, sorted by name.
    pub fn catalog(&self) -> Vec<FileDescriptor> {
        let mut catalog: Vec<FileDescriptor> = self
            .files
            .values()
            .filter(|entry| entry.all_verified())
            .map(|entry| entry.descriptor.clone())
            .collect();
        catalog.sort_by(|a, b| a.name.cmp(&b.name));
        catalog
    }

    fn entry_mut(&mut self, file: &str) -> Result<&mut FileEntry> {
        self.files
            .get_mut(file)
            .ok_or_else(|| PairError::UnknownFile(file.to_string()))
    }

    fn slot(&mut self, file: &str, index: usize) -> Result<&mut ChunkState> {
        let entry = self.entry_mut(file)?;
        entry
            .states
            .get_mut(index)
            .ok_or_else(|| PairError::InvalidChunkTransition {
                file: file.to_string(),
                index,
                from: "absent",
                to: "any",
            })
    }

    fn invalid(file: &str, index: usize, from: &ChunkState, to: &'static str) -> PairError {
        PairError::InvalidChunkTransition {
            file: file.to_string(),
            index,
            from: from.name(),
            to,
        }
    }

    /// Claims a missing chunk for `peer`. Fails if the chunk is already
    /// assigned, which keeps at most one request per chunk outstanding.
    pub fn mark_requested(&mut self, file: &str, index: usize, peer: SocketAddr) -> Result<()> {
        let slot = self.slot(file, index)?;
        match slot {
            ChunkState::Missing => {
                *slot = ChunkState::Requested { peer };
                Ok(())
            }
            other => Err(Self::invalid(file, index, other, "Requested")),
        }
    }

    pub fn mark_in_flight(&mut self, file: &str, index: usize) -> Result<()> {
        let slot = self.slot(file, index)?;
        match slot {
            ChunkState::Requested { peer } => {
                *slot = ChunkState::InFlight { peer: *peer };
                Ok(())
            }
            other => Err(Self::invalid(file, index, other, "InFlight")),
        }
    }

    pub fn mark_received(&mut self, file: &str, index: usize, data: Vec<u8>) -> Result<()> {
        let slot = self.slot(file, index)?;
        match slot {
            ChunkState::Requested { peer } | ChunkState::InFlight { peer } => {
                *slot = ChunkState::Received { peer: *peer, data };
                Ok(())
            }
            other => Err(Self::invalid(file, index, other, "Received")),
        }
    }

    /// Lifts the payload of a `Received` chunk out for [`StagedChunk::persist`].
    pub fn stage_received(&mut self, file: &str, index: usize) -> Result<StagedChunk> {
        let entry = self.entry_mut(file)?;
        let location = entry.location();
        let (expected, range) = match (
            entry.descriptor.chunk_digest(index),
            entry.descriptor.chunk_range(index),
        ) {
            (Some(digest), Some(range)) => (*digest, range),
            _ => {
                return Err(PairError::InvalidChunkTransition {
                    file: file.to_string(),
                    index,
                    from: "absent",
                    to: "Verified",
                });
            }
        };

        match &mut entry.states[index] {
            ChunkState::Received { data, .. } => Ok(StagedChunk {
                file: file.to_string(),
                index,
                location,
                range,
                expected,
                data: std::mem::take(data),
            }),
            other => Err(Self::invalid(file, index, other, "Verified")),
        }
    }

    /// `Received -> Verified` for a chunk already on storage. Returns true
    /// when this completed a file that still sits under its partial name.
    pub fn commit_verified(&mut self, file: &str, index: usize) -> Result<bool> {
        let slot = self.slot(file, index)?;
        match slot {
            ChunkState::Received { .. } => *slot = ChunkState::Verified,
            other => return Err(Self::invalid(file, index, other, "Verified")),
        }
        Ok(self
            .files
            .get(file)
            .is_some_and(|entry| !entry.finalized && entry.all_verified()))
    }

    /// Records that a completed file was moved to its own name.
    pub fn mark_finalized(&mut self, file: &str) {
        if let Some(entry) = self.files.get_mut(file) {
            entry.finalized = true;
        }
    }

    /// Checks a received payload against the descriptor digest and commits it
    /// to storage in place. A mismatch sends the chunk back to `Missing` and
    /// returns [`PairError::CorruptChunk`]. Shared stores use [`verify_chunk`].
    pub fn mark_verified(&mut self, file: &str, index: usize) -> Result<()> {
        let staged = self.stage_received(file, index)?;
        if let Err(e) = staged.persist(self.storage.as_ref()) {
            let _ = self.reset_to_missing(file, index);
            return Err(e);
        }
        if self.commit_verified(file, index)? {
            match self.storage.rename(&partial_name(file), file) {
                Ok(()) => self.mark_finalized(file),
                Err(e) => warn!(file, error = %e, "complete file stays under its partial name"),
            }
        }
        Ok(())
    }

    pub fn reset_to_missing(&mut self, file: &str, index: usize) -> Result<()> {
        let slot = self.slot(file, index)?;
        if slot.is_pending() {
            *slot = ChunkState::Missing;
            Ok(())
        } else {
            Err(Self::invalid(file, index, slot, "Missing"))
        }
    }

    /// Returns every requested, in-flight or unverified chunk of `file` to
    /// `Missing`; used when a session ends or is cancelled.
    pub fn reset_pending(&mut self, file: &str) -> Vec<usize> {
        let Some(entry) = self.files.get_mut(file) else {
            return Vec::new();
        };
        let mut reset = Vec::new();
        for (index, state) in entry.states.iter_mut().enumerate() {
            if state.is_pending() {
                *state = ChunkState::Missing;
                reset.push(index);
            }
        }
        reset
    }

    pub fn missing_chunks(&self, file: &str) -> Result<MissingChunks<'_>> {
        let entry = self
            .files
            .get(file)
            .ok_or_else(|| PairError::UnknownFile(file.to_string()))?;
        Ok(MissingChunks {
            states: &entry.states,
            next: 0,
        })
    }

    pub fn is_complete(&self, file: &str) -> bool {
        self.files
            .get(file)
            .is_some_and(FileEntry::all_verified)
    }

    pub fn progress(&self, file: &str) -> Option<Progress> {
        let entry = self.files.get(file)?;
        let mut progress = Progress {
            total: entry.states.len(),
            ..Progress::default()
        };
        for state in &entry.states {
            match state {
                ChunkState::Verified => progress.verified += 1,
                ChunkState::Missing => progress.missing += 1,
                _ => progress.pending += 1,
            }
        }
        Some(progress)
    }

    /// Where the bytes of a verified chunk are, for reading outside the lock.
    fn locate_chunk(&self, file: &str, index: usize) -> Result<(String, Range<u64>, ChunkDigest)> {
        let not_available = || PairError::ChunkNotAvailable {
            file: file.to_string(),
            index,
        };
        let entry = self.files.get(file).ok_or_else(not_available)?;
        if entry.states.get(index) != Some(&ChunkState::Verified) {
            return Err(not_available());
        }
        let range = entry.descriptor.chunk_range(index).ok_or_else(not_available)?;
        let digest = *entry.descriptor.chunk_digest(index).ok_or_else(not_available)?;
        Ok((entry.location(), range, digest))
    }

    /// Storage name and length of a complete file; `None` for an empty one.
    fn locate_file(&self, file: &str) -> Result<Option<(String, u64)>> {
        let entry = self
            .files
            .get(file)
            .ok_or_else(|| PairError::UnknownFile(file.to_string()))?;
        let missing: Vec<usize> = entry
            .states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s != ChunkState::Verified)
            .map(|(i, _)| i)
            .collect();
        if !missing.is_empty() {
            return Err(PairError::IncompleteFile {
                file: file.to_string(),
                missing,
                failures: Vec::new(),
            });
        }
        if entry.descriptor.total_size == 0 {
            return Ok(None);
        }
        Ok(Some((entry.location(), entry.descriptor.total_size)))
    }

    /// Concatenates every chunk of a complete file in index order.
    pub fn assemble(&self, file: &str) -> Result<Vec<u8>> {
        match self.locate_file(file)? {
            Some((location, len)) => self.storage.read(&location, 0..len),
            None => Ok(Vec::new()),
        }
    }
}

/// Runs storage work on the blocking pool.
pub(crate) async fn blocking<R, F>(work: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PairError::Io(std::io::Error::other(e)))?
}

/// [`ChunkStore::mark_verified`] for a shared store. The lock is held for the
/// state changes only; the digest check, the write and the final rename run
/// on the blocking pool.
pub async fn verify_chunk(store: &Mutex<ChunkStore>, file: &str, index: usize) -> Result<()> {
    let (staged, storage) = {
        let mut guard = store.lock().await;
        (guard.stage_received(file, index)?, Arc::clone(&guard.storage))
    };
    let persisted = {
        let storage = Arc::clone(&storage);
        blocking(move || staged.persist(storage.as_ref())).await
    };

    let mut guard = store.lock().await;
    if let Err(e) = persisted {
        if guard.state(file, index).is_some_and(ChunkState::is_pending) {
            let _ = guard.reset_to_missing(file, index);
        }
        return Err(e);
    }
    if !guard.commit_verified(file, index)? {
        return Ok(());
    }
    drop(guard);

    let (from, to) = (partial_name(file), file.to_string());
    match blocking(move || storage.rename(&from, &to)).await {
        Ok(()) => store.lock().await.mark_finalized(file),
        Err(e) => warn!(file, error = %e, "complete file stays under its partial name"),
    }
    Ok(())
}

/// Reads back a verified chunk together with its digest, for serving. Only
/// the lookup holds the lock.
pub async fn read_verified_chunk(
    store: &Mutex<ChunkStore>,
    file: &str,
    index: usize,
) -> Result<(Vec<u8>, ChunkDigest)> {
    let (storage, location, range, digest) = {
        let guard = store.lock().await;
        let (location, range, digest) = guard.locate_chunk(file, index)?;
        (Arc::clone(&guard.storage), location, range, digest)
    };
    let data = blocking(move || storage.read(&location, range))
        .await
        .map_err(|_| PairError::ChunkNotAvailable {
            file: file.to_string(),
            index,
        })?;
    Ok((data, digest))
}

/// [`ChunkStore::assemble`] for a shared store, reading outside the lock.
pub async fn assemble_file(store: &Mutex<ChunkStore>, file: &str) -> Result<Vec<u8>> {
    let (storage, located) = {
        let guard = store.lock().await;
        (Arc::clone(&guard.storage), guard.locate_file(file)?)
    };
    match located {
        Some((location, len)) => blocking(move || storage.read(&location, 0..len)).await,
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage};
    use assert_matches::assert_matches;

    fn peer() -> SocketAddr {
        "127.0.0.1:7001".parse().unwrap()
    }

    fn original() -> Vec<u8> {
        (0..300u32).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn store_with_song() -> (ChunkStore, FileDescriptor) {
        let mut store = ChunkStore::new(Arc::new(MemoryStorage::new()));
        let descriptor = FileDescriptor::from_bytes("song.mp3", &original(), 100);
        store.register_file(descriptor.clone()).unwrap();
        (store, descriptor)
    }

    fn deliver(store: &mut ChunkStore, index: usize, data: &[u8]) -> Result<()> {
        store.mark_requested("song.mp3", index, peer())?;
        store.mark_in_flight("song.mp3", index)?;
        store.mark_received("song.mp3", index, data.to_vec())?;
        store.mark_verified("song.mp3", index)
    }

    #[test]
    fn test_new_file_is_all_missing() {
        let (store, _) = store_with_song();
        let missing: Vec<usize> = store.missing_chunks("song.mp3").unwrap().collect();
        assert_eq!(missing, vec![0, 1, 2]);
        assert!(!store.is_complete("song.mp3"));
    }

    #[test]
    fn test_descriptor_conflict() {
        let (mut store, _) = store_with_song();
        let other = FileDescriptor::from_bytes("song.mp3", &original(), 50);
        assert_matches!(
            store.register_file(other),
            Err(PairError::DescriptorConflict {
                existing: 3,
                proposed: 6,
                ..
            })
        );
    }

    #[test]
    fn test_reregister_same_layout_keeps_states() {
        let (mut store, descriptor) = store_with_song();
        deliver(&mut store, 0, &original()[..100]).unwrap();
        store.register_file(descriptor).unwrap();
        assert_eq!(store.state("song.mp3", 0), Some(&ChunkState::Verified));
    }

    #[test]
    fn test_full_round_trip_out_of_order() {
        let (mut store, _) = store_with_song();
        let data = original();

        deliver(&mut store, 2, &data[200..]).unwrap();
        deliver(&mut store, 0, &data[..100]).unwrap();
        assert!(!store.is_complete("song.mp3"));
        deliver(&mut store, 1, &data[100..200]).unwrap();

        assert!(store.is_complete("song.mp3"));
        assert_eq!(store.assemble("song.mp3").unwrap(), data);
    }

    #[test]
    fn test_received_without_request_is_rejected() {
        let (mut store, _) = store_with_song();
        assert_matches!(
            store.mark_received("song.mp3", 0, vec![0; 100]),
            Err(PairError::InvalidChunkTransition {
                from: "Missing",
                to: "Received",
                ..
            })
        );
    }

    #[test]
    fn test_double_request_is_rejected() {
        let (mut store, _) = store_with_song();
        store.mark_requested("song.mp3", 1, peer()).unwrap();

        let other: SocketAddr = "127.0.0.1:7002".parse().unwrap();
        assert_matches!(
            store.mark_requested("song.mp3", 1, other),
            Err(PairError::InvalidChunkTransition { from: "Requested", .. })
        );
        store.mark_in_flight("song.mp3", 1).unwrap();
        assert_matches!(
            store.mark_requested("song.mp3", 1, other),
            Err(PairError::InvalidChunkTransition { from: "InFlight", .. })
        );
        assert_eq!(
            store.state("song.mp3", 1),
            Some(&ChunkState::InFlight { peer: peer() })
        );
    }

    #[test]
    fn test_corrupt_chunk_returns_to_missing() {
        let (mut store, _) = store_with_song();
        let mut tampered = original()[100..200].to_vec();
        tampered[5] ^= 0x01;

        assert_matches!(
            deliver(&mut store, 1, &tampered),
            Err(PairError::CorruptChunk { index: 1, .. })
        );
        assert_eq!(store.state("song.mp3", 1), Some(&ChunkState::Missing));
        let missing: Vec<usize> = store.missing_chunks("song.mp3").unwrap().collect();
        assert_eq!(missing, vec![0, 1, 2]);
    }

    #[test]
    fn test_truncated_chunk_is_corrupt() {
        let (mut store, _) = store_with_song();
        assert_matches!(
            deliver(&mut store, 0, &original()[..99]),
            Err(PairError::CorruptChunk { index: 0, .. })
        );
    }

    #[test]
    fn test_verify_requires_received() {
        let (mut store, _) = store_with_song();
        store.mark_requested("song.mp3", 0, peer()).unwrap();
        assert_matches!(
            store.mark_verified("song.mp3", 0),
            Err(PairError::InvalidChunkTransition { from: "Requested", .. })
        );
        assert_eq!(
            store.state("song.mp3", 0),
            Some(&ChunkState::Requested { peer: peer() })
        );
    }

    #[test]
    fn test_reset_to_missing() {
        let (mut store, _) = store_with_song();
        store.mark_requested("song.mp3", 0, peer()).unwrap();
        store.reset_to_missing("song.mp3", 0).unwrap();
        assert_eq!(store.state("song.mp3", 0), Some(&ChunkState::Missing));

        assert_matches!(
            store.reset_to_missing("song.mp3", 0),
            Err(PairError::InvalidChunkTransition { from: "Missing", .. })
        );

        deliver(&mut store, 0, &original()[..100]).unwrap();
        assert_matches!(
            store.reset_to_missing("song.mp3", 0),
            Err(PairError::InvalidChunkTransition { from: "Verified", .. })
        );
    }

    #[test]
    fn test_reset_pending() {
        let (mut store, _) = store_with_song();
        store.mark_requested("song.mp3", 0, peer()).unwrap();
        store.mark_requested("song.mp3", 2, peer()).unwrap();
        store.mark_in_flight("song.mp3", 2).unwrap();

        assert_eq!(store.reset_pending("song.mp3"), vec![0, 2]);
        assert_eq!(store.progress("song.mp3").unwrap().missing, 3);
    }

    #[test]
    fn test_missing_chunks_is_restartable() {
        let (mut store, _) = store_with_song();
        deliver(&mut store, 1, &original()[100..200]).unwrap();

        let first: Vec<usize> = store.missing_chunks("song.mp3").unwrap().collect();
        let second: Vec<usize> = store.missing_chunks("song.mp3").unwrap().collect();
        assert_eq!(first, vec![0, 2]);
        assert_eq!(first, second);

        let mut walk = store.missing_chunks("song.mp3").unwrap();
        assert_eq!(walk.next(), Some(0));
        let restarted = walk.clone();
        assert_eq!(walk.collect::<Vec<_>>(), restarted.collect::<Vec<_>>());
    }

    #[test]
    fn test_assemble_incomplete() {
        let (mut store, _) = store_with_song();
        deliver(&mut store, 0, &original()[..100]).unwrap();
        assert_matches!(
            store.assemble("song.mp3"),
            Err(PairError::IncompleteFile { missing, .. }) if missing == vec![1, 2]
        );
    }

    #[tokio::test]
    async fn test_publish_and_read_chunk() {
        let storage = Arc::new(MemoryStorage::new());
        let data = original();
        storage.write("song.mp3", 0, &data).unwrap();

        let mut store = ChunkStore::new(storage);
        let descriptor = FileDescriptor::from_bytes("song.mp3", &data, 100);
        store.publish(descriptor.clone()).unwrap();
        assert_eq!(store.catalog(), vec![descriptor.clone()]);
        let store = Mutex::new(store);

        let (chunk, digest) = read_verified_chunk(&store, "song.mp3", 2).await.unwrap();
        assert_eq!(chunk, &data[200..]);
        assert_eq!(digest, descriptor.chunk_digests[2]);

        assert_matches!(
            read_verified_chunk(&store, "song.mp3", 3).await,
            Err(PairError::ChunkNotAvailable { index: 3, .. })
        );
        assert_matches!(
            read_verified_chunk(&store, "other", 0).await,
            Err(PairError::ChunkNotAvailable { .. })
        );
        assert_eq!(assemble_file(&store, "song.mp3").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_read_chunk_requires_verified() {
        let (store, _) = store_with_song();
        assert!(store.catalog().is_empty());
        let store = Mutex::new(store);
        assert_matches!(
            read_verified_chunk(&store, "song.mp3", 0).await,
            Err(PairError::ChunkNotAvailable { .. })
        );
    }

    #[test]
    fn test_incomplete_file_stays_under_partial_name() {
        let storage = Arc::new(MemoryStorage::new());
        let mut store = ChunkStore::new(storage.clone());
        store
            .register_file(FileDescriptor::from_bytes("song.mp3", &original(), 100))
            .unwrap();
        let data = original();

        deliver(&mut store, 0, &data[..100]).unwrap();
        deliver(&mut store, 2, &data[200..]).unwrap();
        assert_eq!(storage.list().unwrap(), vec!["song.mp3.part"]);

        deliver(&mut store, 1, &data[100..200]).unwrap();
        assert_eq!(storage.list().unwrap(), vec!["song.mp3"]);
        assert_eq!(store.assemble("song.mp3").unwrap(), data);
    }

    /// Memory storage whose reads and writes take a while.
    #[derive(Debug, Default)]
    struct SlowStorage {
        inner: MemoryStorage,
    }

    const SLOW: std::time::Duration = std::time::Duration::from_millis(300);

    impl Storage for SlowStorage {
        fn read(&self, file: &str, range: Range<u64>) -> Result<Vec<u8>> {
            std::thread::sleep(SLOW);
            self.inner.read(file, range)
        }

        fn write(&self, file: &str, offset: u64, bytes: &[u8]) -> Result<()> {
            std::thread::sleep(SLOW);
            self.inner.write(file, offset, bytes)
        }

        fn len(&self, file: &str) -> Result<u64> {
            self.inner.len(file)
        }

        fn rename(&self, from: &str, to: &str) -> Result<()> {
            self.inner.rename(from, to)
        }

        fn list(&self) -> Result<Vec<String>> {
            self.inner.list()
        }
    }

    #[tokio::test]
    async fn test_storage_io_runs_without_the_lock() {
        let mut store = ChunkStore::new(Arc::new(SlowStorage::default()));
        store
            .register_file(FileDescriptor::from_bytes("song.mp3", &original(), 100))
            .unwrap();
        store.mark_requested("song.mp3", 0, peer()).unwrap();
        store
            .mark_received("song.mp3", 0, original()[..100].to_vec())
            .unwrap();
        let store = Arc::new(Mutex::new(store));

        let shared = Arc::clone(&store);
        let verifying = tokio::spawn(async move { verify_chunk(&shared, "song.mp3", 0).await });
        tokio::time::sleep(SLOW / 3).await;
        {
            let guard = store.try_lock().expect("store must stay free during the write");
            assert_matches!(guard.state("song.mp3", 0), Some(ChunkState::Received { .. }));
        }
        verifying.await.unwrap().unwrap();
        assert_eq!(
            store.lock().await.state("song.mp3", 0),
            Some(&ChunkState::Verified)
        );

        let shared = Arc::clone(&store);
        let reading = tokio::spawn(async move { read_verified_chunk(&shared, "song.mp3", 0).await });
        tokio::time::sleep(SLOW / 3).await;
        assert!(store.try_lock().is_ok(), "store must stay free during the read");
        let (chunk, _) = reading.await.unwrap().unwrap();
        assert_eq!(chunk, &original()[..100]);
    }

    #[tokio::test]
    async fn test_verify_chunk_rejects_corrupt_payload() {
        let (mut store, _) = store_with_song();
        store.mark_requested("song.mp3", 1, peer()).unwrap();
        store.mark_in_flight("song.mp3", 1).unwrap();
        store.mark_received("song.mp3", 1, vec![0u8; 100]).unwrap();
        let store = Mutex::new(store);

        assert_matches!(
            verify_chunk(&store, "song.mp3", 1).await,
            Err(PairError::CorruptChunk { index: 1, .. })
        );
        let store = store.lock().await;
        assert_eq!(store.state("song.mp3", 1), Some(&ChunkState::Missing));
        assert!(store.storage().list().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_file() {
        let (mut store, _) = store_with_song();
        assert_matches!(store.missing_chunks("rare.iso"), Err(PairError::UnknownFile(_)));
        assert_matches!(
            store.mark_requested("rare.iso", 0, peer()),
            Err(PairError::UnknownFile(_))
        );
        assert!(!store.is_complete("rare.iso"));
    }

    #[test]
    fn test_empty_file_is_complete() {
        let mut store = ChunkStore::new(Arc::new(MemoryStorage::new()));
        store
            .register_file(FileDescriptor::from_bytes("empty", &[], 100))
            .unwrap();
        assert!(store.is_complete("empty"));
        assert_eq!(store.assemble("empty").unwrap(), Vec::<u8>::new());
    }
}
