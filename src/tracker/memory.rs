use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use super::message::{RegisterAck, RegisterRequest, SignOutRequest};
use super::{PeerRecord, TrackerClient};
use crate::descriptor::FileDescriptor;
use crate::error::{PairError, Result};
use crate::identity::Identity;

const INTERVAL: Duration = Duration::from_secs(1800);

/// A tracker living inside the process. Peers are returned in the order they
/// first registered.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    peers: Mutex<Vec<PeerRecord>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn peers(&self) -> Result<std::sync::MutexGuard<'_, Vec<PeerRecord>>> {
        self.peers
            .lock()
            .map_err(|_| PairError::Tracker("tracker state poisoned".into()))
    }

    /// Applies a signed registration, replacing any earlier one from the same
    /// address.
    pub fn accept_registration(&self, request: &RegisterRequest) -> Result<RegisterAck> {
        if !request.verify() {
            return Err(PairError::Tracker("invalid registration signature".into()));
        }
        self.upsert(PeerRecord {
            addr: request.peer,
            public_key: Some(request.public_key),
            advertised_files: request.files.clone(),
        })?;
        Ok(RegisterAck { interval: INTERVAL })
    }

    /// Records a peer without a signature check.
    pub fn upsert(&self, record: PeerRecord) -> Result<()> {
        let mut peers = self.peers()?;
        match peers.iter_mut().find(|p| p.addr == record.addr) {
            Some(existing) => *existing = record,
            None => peers.push(record),
        }
        Ok(())
    }

    pub fn accept_sign_out(&self, request: &SignOutRequest) -> Result<()> {
        if !request.verify() {
            return Err(PairError::Tracker("invalid sign-out signature".into()));
        }
        let mut peers = self.peers()?;
        peers.retain(|p| !(p.addr == request.peer && p.public_key == Some(request.public_key)));
        Ok(())
    }

    pub fn peer_count(&self) -> usize {
        self.peers().map(|p| p.len()).unwrap_or(0)
    }
}

impl TrackerClient for MemoryTracker {
    async fn register(
        &self,
        identity: &Identity,
        advertised: SocketAddr,
        catalog: &[FileDescriptor],
    ) -> Result<RegisterAck> {
        let request = RegisterRequest::signed(identity, advertised, catalog.to_vec());
        let ack = self.accept_registration(&request)?;
        debug!(peer = %advertised, files = catalog.len(), "registered in memory tracker");
        Ok(ack)
    }

    async fn find_peers(&self, file: &str) -> Result<Vec<PeerRecord>> {
        let peers = self.peers()?;
        Ok(peers
            .iter()
            .filter_map(|p| {
                let descriptor = p.advertised(file)?;
                Some(PeerRecord {
                    addr: p.addr,
                    public_key: p.public_key,
                    advertised_files: vec![descriptor.clone()],
                })
            })
            .collect())
    }

    async fn search(&self, keyword: &str) -> Result<Vec<FileDescriptor>> {
        let keyword = keyword.to_lowercase();
        let peers = self.peers()?;
        let mut found: Vec<FileDescriptor> = Vec::new();
        for descriptor in peers.iter().flat_map(|p| &p.advertised_files) {
            if descriptor.name.to_lowercase().contains(&keyword)
                && !found.iter().any(|d| d.name == descriptor.name)
            {
                found.push(descriptor.clone());
            }
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn sign_out(&self, identity: &Identity, advertised: SocketAddr) -> Result<()> {
        self.accept_sign_out(&SignOutRequest::signed(identity, advertised))
    }
}
