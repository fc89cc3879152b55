//! The pair itself: one identity, the local catalog, a serving socket and
//! the download sessions started from it.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::descriptor::FileDescriptor;
use crate::download::{DownloadCoordinator, DownloadHandle, DownloadReport};
use crate::error::{PairError, Result};
use crate::identity::{Identity, PublicKeyBytes, short_key};
use crate::peer::server::PeerServer;
use crate::storage::Storage;
use crate::store::{ChunkStore, PARTIAL_SUFFIX, Progress, assemble_file, blocking};
use crate::tracker::{HttpTracker, RegisterAck, TrackerClient};

struct Listening {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<()>,
    refresh: Option<JoinHandle<()>>,
}

pub struct Node<T> {
    config: NodeConfig,
    identity: Arc<Identity>,
    store: Arc<Mutex<ChunkStore>>,
    tracker: Arc<T>,
    coordinator: Arc<DownloadCoordinator<T>>,
    listening: std::sync::Mutex<Option<Listening>>,
}

impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listening = self
            .listening
            .lock()
            .ok()
            .and_then(|l| l.as_ref().map(|l| l.addr));
        f.debug_struct("Node")
            .field("key", &short_key(&self.identity.public_key_bytes()))
            .field("listening", &listening)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn poisoned() -> PairError {
    PairError::Io(std::io::Error::other("node state poisoned"))
}

impl<T: TrackerClient + 'static> Node<T> {
    /// Creates the node and its identity. Nothing touches the network until
    /// [`Node::start_listening`].
    pub fn new(config: NodeConfig, storage: Arc<dyn Storage>, tracker: Arc<T>) -> Result<Self> {
        let identity = Arc::new(Identity::generate()?);
        let store = Arc::new(Mutex::new(ChunkStore::new(storage)));
        let coordinator = Arc::new(DownloadCoordinator::new(
            Arc::clone(&identity),
            Arc::clone(&store),
            Arc::clone(&tracker),
            &config,
        ));
        info!(key = %short_key(&identity.public_key_bytes()), "node created");

        Ok(Self {
            config,
            identity,
            store,
            tracker,
            coordinator,
            listening: std::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn public_key(&self) -> PublicKeyBytes {
        self.identity.public_key_bytes()
    }

    pub fn store(&self) -> &Arc<Mutex<ChunkStore>> {
        &self.store
    }

    /// Binds the serving socket and starts accepting peers. Calling it again
    /// returns the address already bound.
    pub async fn start_listening(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.listen_addr() {
            return Ok(addr);
        }

        let server = PeerServer::bind(
            self.config.listen_addr,
            Arc::clone(&self.identity),
            Arc::clone(&self.store),
            self.config.timeouts,
        )
        .await?;
        let addr = server.local_addr()?;
        let (shutdown, rx) = watch::channel(false);
        let server = tokio::spawn(server.run(rx));

        let mut listening = self.listening.lock().map_err(|_| poisoned())?;
        *listening = Some(Listening {
            addr,
            shutdown,
            server,
            refresh: None,
        });
        Ok(addr)
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listening
            .lock()
            .ok()
            .and_then(|l| l.as_ref().map(|l| l.addr))
    }

    /// Address announced to the tracker: the configured one, or the bound one
    /// with an unspecified IP replaced by loopback.
    pub fn advertised_addr(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.config.advertised_addr {
            return Ok(addr);
        }
        let mut addr = self
            .listen_addr()
            .ok_or_else(|| PairError::Protocol("node is not listening".into()))?;
        if addr.ip().is_unspecified() {
            warn!(%addr, "no advertised address configured, announcing loopback");
            addr.set_ip(Ipv4Addr::LOCALHOST.into());
        }
        Ok(addr)
    }

    /// Stores `bytes` under `name`, publishes it and, when serving, tells the
    /// tracker about the new catalog.
    pub async fn add_shared_file(&self, name: &str, bytes: &[u8]) -> Result<FileDescriptor> {
        let descriptor = FileDescriptor::from_bytes(name, bytes, self.config.chunk_size);
        let storage = Arc::clone(self.store.lock().await.storage());
        let (target, content) = (name.to_string(), bytes.to_vec());
        blocking(move || storage.write(&target, 0, &content)).await?;
        self.store.lock().await.publish(descriptor.clone())?;
        info!(file = name, size = bytes.len(), chunks = descriptor.chunk_count(), "sharing file");
        self.catalog_changed().await?;
        Ok(descriptor)
    }

    /// Publishes every file already present in storage that is not in the
    /// catalog yet. Unfinished downloads, kept under their partial name, are
    /// skipped.
    pub async fn scan_storage(&self) -> Result<Vec<FileDescriptor>> {
        let storage = Arc::clone(self.store.lock().await.storage());
        let listed = {
            let storage = Arc::clone(&storage);
            blocking(move || storage.list()).await?
        };
        let unknown: Vec<String> = {
            let store = self.store.lock().await;
            listed
                .into_iter()
                .filter(|name| !name.ends_with(PARTIAL_SUFFIX) && store.descriptor(name).is_none())
                .collect()
        };

        let chunk_size = self.config.chunk_size;
        let found = blocking(move || {
            unknown
                .into_iter()
                .map(|name| {
                    let len = storage.len(&name)?;
                    let bytes = storage.read(&name, 0..len)?;
                    Ok(FileDescriptor::from_bytes(name.as_str(), &bytes, chunk_size))
                })
                .collect::<Result<Vec<_>>>()
        })
        .await?;

        let mut added = Vec::new();
        {
            let mut store = self.store.lock().await;
            for descriptor in found {
                if store.descriptor(&descriptor.name).is_some() {
                    continue;
                }
                store.publish(descriptor.clone())?;
                debug!(file = %descriptor.name, size = descriptor.total_size, "found file in storage");
                added.push(descriptor);
            }
        }
        if !added.is_empty() {
            self.catalog_changed().await?;
        }
        Ok(added)
    }

    pub async fn catalog(&self) -> Vec<FileDescriptor> {
        self.store.lock().await.catalog()
    }

    /// Downloads `file` from whoever the tracker names. A completed file is
    /// advertised right away when this node is serving.
    pub async fn download(&self, file: &str) -> Result<DownloadReport> {
        let report = self.coordinator.download(file).await?;
        self.catalog_changed().await?;
        Ok(report)
    }

    /// Starts a download in the background.
    pub fn start_download(&self, file: &str) -> DownloadHandle {
        self.coordinator.spawn(file)
    }

    pub async fn download_status(&self, file: &str) -> Option<Progress> {
        self.store.lock().await.progress(file)
    }

    pub async fn assemble(&self, file: &str) -> Result<Vec<u8>> {
        assemble_file(&self.store, file).await
    }

    /// Sends the full catalog to the tracker. Safe to repeat.
    pub async fn register_with_tracker(&self) -> Result<RegisterAck> {
        let addr = self.advertised_addr()?;
        let catalog = self.catalog().await;
        let ack = self.tracker.register(&self.identity, addr, &catalog).await?;
        debug!(%addr, files = catalog.len(), "registered with tracker");
        Ok(ack)
    }

    /// Re-registers in the background at the interval the tracker asks for,
    /// falling back to the configured one. Stops with [`Node::shutdown`].
    pub fn keep_registered(&self) -> Result<()> {
        let addr = self.advertised_addr()?;
        let mut listening = self.listening.lock().map_err(|_| poisoned())?;
        let Some(listening) = listening.as_mut() else {
            return Err(PairError::Protocol("node is not listening".into()));
        };
        if listening.refresh.is_some() {
            return Ok(());
        }

        let task = refresh_loop(
            Arc::clone(&self.tracker),
            Arc::clone(&self.identity),
            Arc::clone(&self.store),
            addr,
            self.config.refresh_interval,
            listening.shutdown.subscribe(),
        );
        listening.refresh = Some(tokio::spawn(task));
        Ok(())
    }

    pub async fn search(&self, keyword: &str) -> Result<Vec<FileDescriptor>> {
        self.tracker.search(keyword).await
    }

    /// Stops serving and withdraws this node from the tracker.
    pub async fn shutdown(&self) -> Result<()> {
        let listening = self.listening.lock().map_err(|_| poisoned())?.take();
        let Some(listening) = listening else {
            return Ok(());
        };

        listening.shutdown.send_replace(true);
        let _ = listening.server.await;
        if let Some(refresh) = listening.refresh {
            let _ = refresh.await;
        }

        let addr = self.config.advertised_addr.unwrap_or_else(|| {
            let mut addr = listening.addr;
            if addr.ip().is_unspecified() {
                addr.set_ip(Ipv4Addr::LOCALHOST.into());
            }
            addr
        });
        self.tracker.sign_out(&self.identity, addr).await?;
        info!(%addr, "node shut down");
        Ok(())
    }

    async fn catalog_changed(&self) -> Result<()> {
        if self.listen_addr().is_some() {
            self.register_with_tracker().await?;
        }
        Ok(())
    }
}

impl Node<HttpTracker> {
    /// Builds a node talking to the HTTP tracker named in `config`.
    pub fn with_http_tracker(config: NodeConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        let url = config
            .tracker_url
            .as_deref()
            .ok_or_else(|| PairError::Protocol("no tracker URL configured".into()))?;
        let tracker = Arc::new(HttpTracker::new(url, config.timeouts, config.retry)?);
        Self::new(config, storage, tracker)
    }
}

async fn refresh_loop<T: TrackerClient>(
    tracker: Arc<T>,
    identity: Arc<Identity>,
    store: Arc<Mutex<ChunkStore>>,
    addr: SocketAddr,
    fallback: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let catalog = store.lock().await.catalog();
        let wait = match tracker.register(&identity, addr, &catalog).await {
            Ok(ack) if ack.interval > Duration::ZERO => ack.interval,
            Ok(_) => fallback,
            Err(e) => {
                warn!(error = %e, "periodic registration failed");
                fallback
            }
        };
        debug!(?wait, files = catalog.len(), "next registration scheduled");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
