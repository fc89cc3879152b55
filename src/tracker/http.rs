use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use reqwest::{Client, StatusCode};
use tracing::{debug, info};
use url::Url;

use super::message::{
    QueryResponse, RegisterAck, RegisterRequest, SignOutRequest, ack_from_bencode,
    search_response_from_bencode,
};
use super::{PeerRecord, TrackerClient, with_retry};
use crate::config::{RetryPolicy, Timeouts};
use crate::descriptor::FileDescriptor;
use crate::error::{PairError, Result};
use crate::identity::Identity;

const USER_AGENT: &str = "pairshare/0.1";

fn encode_bytes(bytes: &[u8]) -> String {
    percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

/// Tracker reached over HTTP with bencoded bodies.
#[derive(Debug)]
pub struct HttpTracker {
    client: Client,
    base: Url,
    timeouts: Timeouts,
    retry: RetryPolicy,
    last_registration: Mutex<Option<Instant>>,
}

impl HttpTracker {
    pub fn new(base_url: &str, timeouts: Timeouts, retry: RetryPolicy) -> Result<Self> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeouts.tracker)
            .build()?;

        Ok(Self {
            client,
            base,
            timeouts,
            retry,
            last_registration: Mutex::new(None),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    pub fn build_query_url(&self, file: &str) -> Result<Url> {
        let mut url = self.endpoint("query")?;
        url.set_query(Some(&format!("file={}", encode_bytes(file.as_bytes()))));
        Ok(url)
    }

    pub fn build_search_url(&self, keyword: &str) -> Result<Url> {
        let mut url = self.endpoint("search")?;
        url.set_query(Some(&format!("q={}", encode_bytes(keyword.as_bytes()))));
        Ok(url)
    }

    /// When the last registration was acknowledged, if ever.
    pub fn last_registration(&self) -> Option<Instant> {
        self.last_registration.lock().ok().and_then(|guard| *guard)
    }

    pub fn needs_refresh(&self, interval: Duration) -> bool {
        self.last_registration()
            .is_none_or(|at| at.elapsed() >= interval)
    }

    async fn contact_tracker(&self, request: reqwest::RequestBuilder) -> Result<Vec<u8>> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PairError::Io(std::io::Error::other(format!(
                "tracker error: {status}"
            ))));
        }
        if !status.is_success() {
            return Err(PairError::Tracker(format!("tracker error: {status}")));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn get(&self, url: Url) -> Result<Vec<u8>> {
        self.contact_tracker(self.client.get(url)).await
    }

    async fn post(&self, url: Url, body: Vec<u8>) -> Result<Vec<u8>> {
        self.contact_tracker(self.client.post(url).body(body)).await
    }
}

impl TrackerClient for HttpTracker {
    async fn register(
        &self,
        identity: &Identity,
        advertised: SocketAddr,
        catalog: &[FileDescriptor],
    ) -> Result<RegisterAck> {
        let url = self.endpoint("register")?;
        let body = RegisterRequest::signed(identity, advertised, catalog.to_vec()).to_bencode();

        let (url, body) = (&url, &body);
        let ack = with_retry(&self.retry, self.timeouts.tracker, "register", move || async move {
            let reply = self.post(url.clone(), body.clone()).await?;
            ack_from_bencode(&reply)
        })
        .await?;

        if let Ok(mut guard) = self.last_registration.lock() {
            *guard = Some(Instant::now());
        }
        info!(files = catalog.len(), interval = ?ack.interval, "registered with tracker");
        Ok(ack)
    }

    async fn find_peers(&self, file: &str) -> Result<Vec<PeerRecord>> {
        let url = self.build_query_url(file)?;
        let url = &url;
        let response = with_retry(&self.retry, self.timeouts.tracker, "query", move || async move {
            let reply = self.get(url.clone()).await?;
            QueryResponse::from_bencode(&reply)
        })
        .await?;

        debug!(file, peers = response.peers.len(), "tracker query answered");
        Ok(response.peers)
    }

    async fn search(&self, keyword: &str) -> Result<Vec<FileDescriptor>> {
        let url = self.build_search_url(keyword)?;
        let url = &url;
        with_retry(&self.retry, self.timeouts.tracker, "search", move || async move {
            let reply = self.get(url.clone()).await?;
            search_response_from_bencode(&reply)
        })
        .await
    }

    async fn sign_out(&self, identity: &Identity, advertised: SocketAddr) -> Result<()> {
        let url = self.endpoint("sign_out")?;
        let body = SignOutRequest::signed(identity, advertised).to_bencode();
        let (url, body) = (&url, &body);
        with_retry(&self.retry, self.timeouts.tracker, "sign_out", move || async move {
            let reply = self.post(url.clone(), body.clone()).await?;
            ack_from_bencode(&reply).map(|_| ())
        })
        .await?;

        if let Ok(mut guard) = self.last_registration.lock() {
            *guard = None;
        }
        info!("signed out from tracker");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::message::{ack_to_bencode, failure_to_bencode};
    use assert_matches::assert_matches;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn create_test_tracker(base: &str) -> HttpTracker {
        let retry = RetryPolicy {
            tracker_attempts: 2,
            tracker_backoff: Duration::from_millis(5),
            ..RetryPolicy::default()
        };
        let timeouts = Timeouts {
            tracker: Duration::from_secs(2),
            ..Timeouts::default()
        };
        HttpTracker::new(base, timeouts, retry).unwrap()
    }

    /// Answers `count` HTTP requests with `body` and returns the raw requests.
    async fn serve_http(
        listener: TcpListener,
        count: usize,
        body: Vec<u8>,
    ) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let mut requests = Vec::new();
            for _ in 0..count {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 64 * 1024];
                let mut read = 0;
                loop {
                    let n = socket.read(&mut buf[read..]).await.unwrap();
                    read += n;
                    let text = String::from_utf8_lossy(&buf[..read]).to_string();
                    if let Some(head_end) = text.find("\r\n\r\n") {
                        let length = text
                            .lines()
                            .find_map(|l| {
                                l.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap())
                            })
                            .unwrap_or(0);
                        if read >= head_end + 4 + length {
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }
                requests.push(String::from_utf8_lossy(&buf[..read]).to_string());
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(&body).await.unwrap();
                socket.shutdown().await.ok();
            }
            requests
        })
    }

    #[test]
    fn test_build_query_url() {
        let tracker = create_test_tracker("http://tracker.example.com:8080/announce");
        let url = tracker.build_query_url("song one.mp3").unwrap();

        assert!(
            url.as_str()
                .starts_with("http://tracker.example.com:8080/announce/query?")
        );
        assert!(url.as_str().contains("file=song%20one%2Emp3"));
    }

    #[test]
    fn test_build_search_url_encoding() {
        let tracker = create_test_tracker("https://tracker.example.com/");
        let url = tracker.build_search_url("a&b").unwrap();
        assert_eq!(url.as_str(), "https://tracker.example.com/search?q=a%26b");
    }

    #[test]
    fn test_invalid_base_url() {
        let result = HttpTracker::new("invalid_url", Timeouts::default(), RetryPolicy::default());
        assert_matches!(result, Err(PairError::Protocol(_)));
    }

    #[test]
    fn test_needs_refresh() {
        let tracker = create_test_tracker("http://127.0.0.1:1/");
        assert!(tracker.needs_refresh(Duration::from_secs(60)));

        *tracker.last_registration.lock().unwrap() = Some(Instant::now());
        assert!(!tracker.needs_refresh(Duration::from_secs(60)));
        assert!(tracker.needs_refresh(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_register_posts_signed_catalog() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/", listener.local_addr().unwrap());
        let ack = ack_to_bencode(&RegisterAck {
            interval: Duration::from_secs(120),
        });
        let server = serve_http(listener, 1, ack).await;

        let tracker = create_test_tracker(&base);
        let identity = Identity::generate().unwrap();
        let catalog = vec![FileDescriptor::from_bytes("song.mp3", &[1u8; 300], 100)];
        let advertised: SocketAddr = "10.0.0.1:7000".parse().unwrap();

        let ack = tracker.register(&identity, advertised, &catalog).await.unwrap();
        assert_eq!(ack.interval, Duration::from_secs(120));
        assert!(tracker.last_registration().is_some());

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("POST /register"));
        assert!(requests[0].contains("song.mp3"));
        assert!(requests[0].contains("10.0.0.1:7000"));
    }

    #[tokio::test]
    async fn test_find_peers_parses_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/", listener.local_addr().unwrap());
        let file = FileDescriptor::from_bytes("song.mp3", &[1u8; 300], 100);
        let reply = QueryResponse {
            file: Some(file.clone()),
            peers: vec![PeerRecord {
                addr: "192.168.1.1:6881".parse().unwrap(),
                public_key: None,
                advertised_files: vec![file.clone()],
            }],
        }
        .to_bencode();
        let server = serve_http(listener, 1, reply).await;

        let tracker = create_test_tracker(&base);
        let peers = tracker.find_peers("song.mp3").await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].advertised("song.mp3"), Some(&file));

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("GET /query?file=song%2Emp3"));
    }

    #[tokio::test]
    async fn test_tracker_refusal_surfaces() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/", listener.local_addr().unwrap());
        let server = serve_http(listener, 1, failure_to_bencode("go away")).await;

        let tracker = create_test_tracker(&base);
        let result = tracker.search("song").await;
        assert_matches!(result, Err(PairError::Tracker(reason)) if reason == "go away");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_tracker() {
        // Bind then drop so the port is very likely closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);

        let tracker = create_test_tracker(&base);
        let identity = Identity::generate().unwrap();
        let advertised: SocketAddr = "10.0.0.1:7000".parse().unwrap();

        let result = tracker.register(&identity, advertised, &[]).await;
        assert_matches!(result, Err(PairError::TrackerUnreachable { attempts: 2, .. }));
        assert!(tracker.last_registration().is_none());
    }
}
