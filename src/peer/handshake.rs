use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;
use rand::rngs::OsRng;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{PairError, Result};
use crate::identity::{self, Identity, PUBLIC_KEY_LEN, PublicKeyBytes, SignatureBytes};
use crate::peer::message::{FrameReader, PeerMessage, write_message};

pub const PSTR: &str = "pairshare/1";
pub const PSTR_LEN: u8 = PSTR.len() as u8; // always 11
pub const NONCE_LEN: usize = 32;

const HELLO_LEN: usize = 1 + PSTR.len() + PUBLIC_KEY_LEN + NONCE_LEN;

/// Opening message of either side: the key it claims and a fresh challenge
/// for the other side to sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub public_key: PublicKeyBytes,
    pub nonce: [u8; NONCE_LEN],
}

impl Handshake {
    pub fn new(identity: &Identity) -> Self {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        Self {
            public_key: identity.public_key_bytes(),
            nonce,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HELLO_LEN);
        buf.push(PSTR_LEN);
        buf.extend_from_slice(PSTR.as_bytes());
        buf.extend_from_slice(&self.public_key);
        buf.extend_from_slice(&self.nonce);

        buf
    }

    pub fn deserialize(buf: &[u8]) -> Option<Self> {
        if buf.len() != HELLO_LEN || buf[0] != PSTR_LEN {
            return None;
        }
        if &buf[1..1 + PSTR.len()] != PSTR.as_bytes() {
            return None;
        }

        let offset = 1 + PSTR.len();
        let public_key = <PublicKeyBytes>::try_from(&buf[offset..offset + PUBLIC_KEY_LEN]).ok()?;
        let nonce = <[u8; NONCE_LEN]>::try_from(&buf[offset + PUBLIC_KEY_LEN..]).ok()?;

        Some(Self { public_key, nonce })
    }
}

/// Which end of the connection produced a proof. Labels differ per side, so
/// a dialer proof never passes as an acceptor proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Acceptor,
}

impl Role {
    fn label(self) -> &'static [u8] {
        match self {
            Role::Dialer => b"pairshare/1 dialer",
            Role::Acceptor => b"pairshare/1 acceptor",
        }
    }
}

/// Bytes signed by `role`: both hellos, dialer first. Both nonces are in
/// there, so a proof is only good for the connection it was made on.
fn transcript(role: Role, dialer: &Handshake, acceptor: &Handshake) -> Vec<u8> {
    let label = role.label();
    let mut buf = Vec::with_capacity(label.len() + 2 * (PUBLIC_KEY_LEN + NONCE_LEN));
    buf.extend_from_slice(label);
    buf.extend_from_slice(&dialer.public_key);
    buf.extend_from_slice(&dialer.nonce);
    buf.extend_from_slice(&acceptor.public_key);
    buf.extend_from_slice(&acceptor.nonce);
    buf
}

pub fn prove(identity: &Identity, role: Role, dialer: &Handshake, acceptor: &Handshake) -> SignatureBytes {
    identity.sign(&transcript(role, dialer, acceptor))
}

/// Checks a proof against the key `role` claimed in its own hello.
pub fn check(role: Role, dialer: &Handshake, acceptor: &Handshake, proof: &SignatureBytes) -> bool {
    let key = match role {
        Role::Dialer => &dialer.public_key,
        Role::Acceptor => &acceptor.public_key,
    };
    identity::verify(key, &transcript(role, dialer, acceptor), proof)
}

fn failed(peer: SocketAddr, reason: impl Into<String>) -> PairError {
    PairError::HandshakeFailed {
        peer,
        reason: reason.into(),
    }
}

/// Dialer side: send our hello, take the peer's hello and its proof over both
/// nonces, then prove ourselves the same way. When the tracker vouched for a
/// key, the peer must present exactly that key.
pub async fn initiate(
    stream: &mut TcpStream,
    reader: &mut FrameReader,
    identity: &Identity,
    peer: SocketAddr,
    expected_key: Option<PublicKeyBytes>,
    limit: Duration,
) -> Result<PublicKeyBytes> {
    let ours = Handshake::new(identity);
    let exchange = async {
        write_message(&mut *stream, &PeerMessage::Hello(ours.clone())).await?;
        let theirs = match reader.read_message(&mut *stream).await? {
            PeerMessage::Hello(hello) => hello,
            PeerMessage::Error(err) => return Err(failed(peer, err.message)),
            other => return Err(failed(peer, format!("expected hello, got {other:?}"))),
        };
        if let Some(expected) = expected_key {
            if expected != theirs.public_key {
                return Err(failed(peer, "key differs from the tracker's record"));
            }
        }

        let proof = match reader.read_message(&mut *stream).await? {
            PeerMessage::Proof(proof) => proof,
            PeerMessage::Error(err) => return Err(failed(peer, err.message)),
            other => return Err(failed(peer, format!("expected proof, got {other:?}"))),
        };
        if !check(Role::Acceptor, &ours, &theirs, &proof) {
            return Err(failed(peer, "invalid signature"));
        }

        let reply = prove(identity, Role::Dialer, &ours, &theirs);
        write_message(&mut *stream, &PeerMessage::Proof(reply)).await?;
        Ok::<_, PairError>(theirs.public_key)
    };

    match timeout(limit, exchange).await {
        Ok(Ok(key)) => Ok(key),
        Ok(Err(e @ PairError::HandshakeFailed { .. })) => Err(e),
        Ok(Err(e)) => Err(failed(peer, e.to_string())),
        Err(_) => Err(failed(peer, format!("handshake not finished within {limit:?}"))),
    }
}
