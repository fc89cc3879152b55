use std::net::SocketAddr;
use std::time::Duration;

use crate::bencode_parser::encoder::dict;
use crate::bencode_parser::parser::{Value, parse};
use crate::descriptor::{ChunkDigest, FileDescriptor};
use crate::error::{PairError, Result};
use crate::identity::{self, Identity, PublicKeyBytes, SignatureBytes};

const DEFAULT_INTERVAL_SECS: i64 = 1800;

/// A peer as known from the tracker or from an inbound connection. The key is
/// only trusted once a handshake with that peer has verified it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub addr: SocketAddr,
    pub public_key: Option<PublicKeyBytes>,
    pub advertised_files: Vec<FileDescriptor>,
}

impl PeerRecord {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            public_key: None,
            advertised_files: Vec::new(),
        }
    }

    pub fn advertised(&self, file: &str) -> Option<&FileDescriptor> {
        self.advertised_files.iter().find(|d| d.name == file)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterAck {
    /// How long the tracker keeps the registration before expecting a refresh.
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub peer: SocketAddr,
    pub public_key: PublicKeyBytes,
    pub signature: SignatureBytes,
    pub files: Vec<FileDescriptor>,
}

impl RegisterRequest {
    pub fn signed(identity: &Identity, peer: SocketAddr, files: Vec<FileDescriptor>) -> Self {
        let public_key = identity.public_key_bytes();
        let signature = identity.sign(&Self::signed_payload(peer, &public_key, &files));
        Self {
            peer,
            public_key,
            signature,
            files,
        }
    }

    /// Canonical bytes covered by the signature.
    pub fn signed_payload(peer: SocketAddr, public_key: &[u8], files: &[FileDescriptor]) -> Vec<u8> {
        let peer = peer.to_string();
        let digests = digest_buffers(files);
        dict([
            ("files", descriptor_list(files, &digests)),
            ("peer", Value::Bytes(peer.as_bytes())),
            ("public_key", Value::Bytes(public_key)),
        ])
        .encode()
    }

    pub fn verify(&self) -> bool {
        let payload = Self::signed_payload(self.peer, &self.public_key, &self.files);
        identity::verify(&self.public_key, &payload, &self.signature)
    }

    pub fn to_bencode(&self) -> Vec<u8> {
        let peer = self.peer.to_string();
        let digests = digest_buffers(&self.files);
        dict([
            ("files", descriptor_list(&self.files, &digests)),
            ("peer", Value::Bytes(peer.as_bytes())),
            ("public_key", Value::Bytes(&self.public_key)),
            ("signature", Value::Bytes(&self.signature)),
        ])
        .encode()
    }

    /// Tracker-side encoding; this crate only ever reads it.
    #[cfg(test)]
    pub fn from_bencode(data: &[u8]) -> Result<Self> {
        let parsed = parse_top(data)?;
        let top = parsed.first().ok_or_else(|| protocol("empty register request"))?;
        let files = get_list(top, b"files")?
            .iter()
            .map(descriptor_from_value)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            peer: get_addr(top, b"peer")?,
            public_key: get_array(top, b"public_key")?,
            signature: get_array(top, b"signature")?,
            files,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignOutRequest {
    pub peer: SocketAddr,
    pub public_key: PublicKeyBytes,
    pub signature: SignatureBytes,
}

impl SignOutRequest {
    pub fn signed(identity: &Identity, peer: SocketAddr) -> Self {
        let public_key = identity.public_key_bytes();
        let signature = identity.sign(&Self::signed_payload(peer, &public_key));
        Self {
            peer,
            public_key,
            signature,
        }
    }

    pub fn signed_payload(peer: SocketAddr, public_key: &[u8]) -> Vec<u8> {
        let peer = peer.to_string();
        dict([
            ("action", Value::Bytes(b"sign_out")),
            ("peer", Value::Bytes(peer.as_bytes())),
            ("public_key", Value::Bytes(public_key)),
        ])
        .encode()
    }

    pub fn verify(&self) -> bool {
        let payload = Self::signed_payload(self.peer, &self.public_key);
        identity::verify(&self.public_key, &payload, &self.signature)
    }

    pub fn to_bencode(&self) -> Vec<u8> {
        let peer = self.peer.to_string();
        dict([
            ("peer", Value::Bytes(peer.as_bytes())),
            ("public_key", Value::Bytes(&self.public_key)),
            ("signature", Value::Bytes(&self.signature)),
        ])
        .encode()
    }
}

/// Tracker answer to a peer query for one file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryResponse {
    pub file: Option<FileDescriptor>,
    pub peers: Vec<PeerRecord>,
}

impl QueryResponse {
    /// Tracker-side encoding; this crate only ever reads it.
    #[cfg(test)]
    pub fn to_bencode(&self) -> Vec<u8> {
        let addrs: Vec<String> = self.peers.iter().map(|p| p.addr.to_string()).collect();
        let peers = self
            .peers
            .iter()
            .zip(&addrs)
            .map(|(peer, addr)| {
                let mut entries = vec![("addr", Value::Bytes(addr.as_bytes()))];
                if let Some(key) = &peer.public_key {
                    entries.push(("public_key", Value::Bytes(key)));
                }
                dict(entries)
            })
            .collect();

        let digests = self
            .file
            .as_ref()
            .map(|d| d.chunk_digests.concat())
            .unwrap_or_default();
        let mut entries = vec![("peers", Value::List(peers))];
        if let Some(file) = &self.file {
            entries.push(("file", descriptor_value(file, &digests)));
        }
        dict(entries).encode()
    }

    /// Decodes a query reply. Every returned peer advertises the queried file.
    pub fn from_bencode(data: &[u8]) -> Result<Self> {
        let parsed = parse_top(data)?;
        let top = parsed.first().ok_or_else(|| protocol("empty query response"))?;
        check_failure(top)?;

        let file = top.get(b"file").map(descriptor_from_value).transpose()?;
        let peers = get_list(top, b"peers")?
            .iter()
            .map(|entry| -> Result<PeerRecord> {
                let public_key = match entry.get(b"public_key") {
                    Some(_) => Some(get_array(entry, b"public_key")?),
                    None => None,
                };
                Ok(PeerRecord {
                    addr: get_addr(entry, b"addr")?,
                    public_key,
                    advertised_files: file.iter().cloned().collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { file, peers })
    }
}

/// Tracker-side encoding; this crate only ever reads it.
#[cfg(test)]
pub fn search_response_to_bencode(files: &[FileDescriptor]) -> Vec<u8> {
    let digests = digest_buffers(files);
    dict([("files", descriptor_list(files, &digests))]).encode()
}

pub fn search_response_from_bencode(data: &[u8]) -> Result<Vec<FileDescriptor>> {
    let parsed = parse_top(data)?;
    let top = parsed.first().ok_or_else(|| protocol("empty search response"))?;
    check_failure(top)?;
    get_list(top, b"files")?
        .iter()
        .map(descriptor_from_value)
        .collect()
}

/// Tracker-side encoding; this crate only ever reads it.
#[cfg(test)]
pub fn ack_to_bencode(ack: &RegisterAck) -> Vec<u8> {
    dict([("interval", Value::Integer(ack.interval.as_secs() as i64))]).encode()
}

pub fn ack_from_bencode(data: &[u8]) -> Result<RegisterAck> {
    let parsed = parse_top(data)?;
    let top = parsed.first().ok_or_else(|| protocol("empty register ack"))?;
    check_failure(top)?;
    let interval = top
        .get(b"interval")
        .and_then(Value::as_integer)
        .unwrap_or(DEFAULT_INTERVAL_SECS)
        .max(1);
    Ok(RegisterAck {
        interval: Duration::from_secs(interval as u64),
    })
}

/// Tracker-side encoding; this crate only ever reads it.
#[cfg(test)]
pub fn failure_to_bencode(reason: &str) -> Vec<u8> {
    dict([("failure reason", Value::Bytes(reason.as_bytes()))]).encode()
}

fn check_failure(top: &Value<'_>) -> Result<()> {
    match top.get(b"failure reason").and_then(Value::as_str) {
        Some(reason) => Err(PairError::Tracker(reason.to_string())),
        None => Ok(()),
    }
}

fn protocol(message: &str) -> PairError {
    PairError::Protocol(message.to_string())
}

fn parse_top(data: &[u8]) -> Result<Vec<Value<'_>>> {
    parse(data).map_err(|e| PairError::Protocol(format!("invalid bencode: {e}")))
}

fn missing(key: &[u8]) -> PairError {
    PairError::Protocol(format!(
        "missing or invalid field '{}'",
        String::from_utf8_lossy(key)
    ))
}

fn get_string(value: &Value<'_>, key: &[u8]) -> Result<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| missing(key))
}

fn get_u64(value: &Value<'_>, key: &[u8]) -> Result<u64> {
    value
        .get(key)
        .and_then(Value::as_integer)
        .and_then(|i| u64::try_from(i).ok())
        .ok_or_else(|| missing(key))
}

fn get_list<'v, 'a>(value: &'v Value<'a>, key: &[u8]) -> Result<&'v [Value<'a>]> {
    value
        .get(key)
        .and_then(Value::as_list)
        .ok_or_else(|| missing(key))
}

fn get_array<const N: usize>(value: &Value<'_>, key: &[u8]) -> Result<[u8; N]> {
    value
        .get(key)
        .and_then(Value::as_bytes)
        .and_then(|b| <[u8; N]>::try_from(b).ok())
        .ok_or_else(|| missing(key))
}

fn get_addr(value: &Value<'_>, key: &[u8]) -> Result<SocketAddr> {
    get_string(value, key)?
        .parse()
        .map_err(|_| missing(key))
}

fn digest_buffers(files: &[FileDescriptor]) -> Vec<Vec<u8>> {
    files.iter().map(|f| f.chunk_digests.concat()).collect()
}

fn descriptor_list<'a>(files: &'a [FileDescriptor], digests: &'a [Vec<u8>]) -> Value<'a> {
    Value::List(
        files
            .iter()
            .zip(digests)
            .map(|(file, digest)| descriptor_value(file, digest))
            .collect(),
    )
}

fn descriptor_value<'a>(file: &'a FileDescriptor, digests: &'a [u8]) -> Value<'a> {
    dict([
        ("chunk_size", Value::Integer(file.chunk_size as i64)),
        ("digests", Value::Bytes(digests)),
        ("name", Value::Bytes(file.name.as_bytes())),
        ("sha1", Value::Bytes(&file.file_digest)),
        ("size", Value::Integer(file.total_size as i64)),
    ])
}

fn descriptor_from_value(value: &Value<'_>) -> Result<FileDescriptor> {
    let digests = value
        .get(b"digests")
        .and_then(Value::as_bytes)
        .ok_or_else(|| missing(b"digests"))?;
    if digests.len() % 20 != 0 {
        return Err(protocol("digest list is not a multiple of 20 bytes"));
    }
    let chunk_digests = digests
        .chunks_exact(20)
        .map(|chunk| {
            let mut digest: ChunkDigest = [0u8; 20];
            digest.copy_from_slice(chunk);
            digest
        })
        .collect();

    let descriptor = FileDescriptor {
        name: get_string(value, b"name")?,
        total_size: get_u64(value, b"size")?,
        chunk_size: get_u64(value, b"chunk_size")?,
        chunk_digests,
        file_digest: get_array(value, b"sha1")?,
    };
    if !descriptor.is_consistent() {
        return Err(PairError::Protocol(format!(
            "descriptor for {} is inconsistent",
            descriptor.name
        )));
    }
    Ok(descriptor)
}
