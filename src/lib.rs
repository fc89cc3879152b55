pub mod bencode_parser;
pub mod config;
pub mod descriptor;
pub mod download;
pub mod error;
pub mod identity;
pub mod node;
pub mod peer;
pub mod storage;
pub mod store;
pub mod tracker;

// Re-export commonly used types and functions for easier access
pub use bencode_parser::parser::{Value, parse};
pub use config::{NodeConfig, RetryPolicy, Timeouts};
pub use descriptor::FileDescriptor;
pub use download::{DownloadCoordinator, DownloadHandle, DownloadReport};
pub use error::{ChunkFailure, PairError, Result};
pub use identity::Identity;
pub use node::Node;
pub use storage::{FsStorage, MemoryStorage, Storage};
pub use store::{ChunkState, ChunkStore, Progress};
pub use tracker::{HttpTracker, MemoryTracker, PeerRecord, TrackerClient};
