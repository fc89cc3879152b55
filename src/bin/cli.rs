use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pairshare::config::{DEFAULT_CHUNK_SIZE, DEFAULT_LISTEN_ADDR};
use pairshare::{FsStorage, HttpTracker, Node, NodeConfig, PairError};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Share files with other pairs through a tracker.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Base URL of the tracker.
    #[arg(short, long)]
    tracker: String,

    /// Folder holding shared and downloaded files.
    #[arg(short, long, default_value = "shared")]
    dir: PathBuf,

    /// Address to accept peers on.
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: SocketAddr,

    /// Address other peers should dial, if different from the listen address.
    #[arg(short, long)]
    advertise: Option<SocketAddr>,

    /// Chunk size used for files shared by this node.
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Share everything in the folder and serve until interrupted.
    Serve,
    /// Copy files into the folder, then serve them.
    Share { files: Vec<PathBuf> },
    /// Download a file into the folder.
    Get {
        name: String,
        /// Also write the assembled file here.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// List files on the tracker whose name contains a keyword.
    Search { keyword: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = NodeConfig {
        listen_addr: args.listen,
        advertised_addr: args.advertise,
        tracker_url: Some(args.tracker),
        chunk_size: args.chunk_size,
        ..NodeConfig::default()
    };
    let storage = Arc::new(FsStorage::new(&args.dir)?);
    let node = Node::with_http_tracker(config, storage)?;

    match args.command {
        Command::Serve => serve(&node).await?,
        Command::Share { files } => {
            for path in files {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| PairError::Protocol(format!("unusable file name: {}", path.display())))?
                    .to_string();
                let bytes = tokio::fs::read(&path).await?;
                let descriptor = node.add_shared_file(&name, &bytes).await?;
                println!("Sharing {} ({} bytes, {} chunks)", name, descriptor.total_size, descriptor.chunk_count());
            }
            serve(&node).await?;
        }
        Command::Get { name, out } => {
            let report = node.download(&name).await?;
            println!("Downloaded {} in {} pass(es) from {} peer(s)", name, report.passes, report.served_by.len());
            if let Some(out) = out {
                let bytes = node.assemble(&name).await?;
                tokio::fs::write(&out, bytes).await?;
                println!("Wrote {}", out.display());
            }
        }
        Command::Search { keyword } => {
            let found = node.search(&keyword).await?;
            if found.is_empty() {
                println!("No files match {keyword:?}");
            }
            for descriptor in found {
                println!("{}\t{} bytes", descriptor.name, descriptor.total_size);
            }
        }
    }

    Ok(())
}

async fn serve(node: &Node<HttpTracker>) -> Result<(), Box<dyn std::error::Error>> {
    let addr = node.start_listening().await?;
    let found = node.scan_storage().await?;
    node.keep_registered()?;
    info!(%addr, files = node.catalog().await.len(), new = found.len(), "serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    node.shutdown().await?;
    Ok(())
}
