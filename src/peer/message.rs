use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::descriptor::ChunkDigest;
use crate::error::{PairError, Result};
use crate::identity::{SIGNATURE_LEN, SignatureBytes};
use crate::peer::handshake::Handshake;

/// Room reserved in a frame for everything but the chunk payload.
pub const FRAME_OVERHEAD: usize = 4096;

pub const ERR_NOT_AVAILABLE: u16 = 1;
pub const ERR_UNAUTHORIZED: u16 = 2;
pub const ERR_BAD_REQUEST: u16 = 3;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Hello = 0,
    ChunkRequest = 1,
    ChunkResponse = 2,
    Error = 3,
    Bye = 4,
    Proof = 5,
}

impl TryFrom<u8> for MessageId {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, ()> {
        match value {
            0 => Ok(Self::Hello),
            1 => Ok(Self::ChunkRequest),
            2 => Ok(Self::ChunkResponse),
            3 => Ok(Self::Error),
            4 => Ok(Self::Bye),
            5 => Ok(Self::Proof),
            _ => Err(()),
        }
    }
}

/// A raw frame: 4-byte big-endian length, 1-byte id, payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageId,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn serialize(&self) -> Vec<u8> {
        let total_len = 1 + self.payload.len(); // 1 byte for ID
        let mut buf = Vec::with_capacity(4 + total_len);

        buf.extend_from_slice(&(total_len as u32).to_be_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.payload);

        buf
    }

    pub fn deserialize(buf: &[u8]) -> Option<Self> {
        if buf.len() < 5 {
            return None; // must be at least 4 (length) + 1 (ID)
        }

        let len = u32::from_be_bytes(buf[0..4].try_into().ok()?) as usize;
        if len == 0 || buf.len() < 4 + len {
            return None;
        }

        let kind = MessageId::try_from(buf[4]).ok()?;
        let payload = buf[5..4 + len].to_vec();

        Some(Self { kind, payload })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub file: String,
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResponse {
    pub file: String,
    pub index: u32,
    pub digest: ChunkDigest,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Hello(Handshake),
    ChunkRequest(ChunkRequest),
    ChunkResponse(ChunkResponse),
    Error(ErrorMessage),
    Bye,
    /// Signature over both hellos of the connection.
    Proof(SignatureBytes),
}

impl TryFrom<&PeerMessage> for Message {
    type Error = PairError;

    fn try_from(msg: &PeerMessage) -> Result<Self> {
        let message = match msg {
            PeerMessage::Hello(handshake) => Message {
                kind: MessageId::Hello,
                payload: handshake.serialize(),
            },
            PeerMessage::ChunkRequest(req) => {
                let mut payload = Vec::with_capacity(20 + req.file.len());
                payload.extend_from_slice(&req.index.to_be_bytes());
                payload.extend_from_slice(&req.start.to_be_bytes());
                payload.extend_from_slice(&req.end.to_be_bytes());
                payload.extend_from_slice(req.file.as_bytes());
                Message {
                    kind: MessageId::ChunkRequest,
                    payload,
                }
            }
            PeerMessage::ChunkResponse(resp) => {
                let name_len = u16::try_from(resp.file.len()).map_err(|_| {
                    PairError::Protocol(format!("file name of {} bytes does not fit a response", resp.file.len()))
                })?;
                let mut payload = Vec::with_capacity(26 + resp.file.len() + resp.payload.len());
                payload.extend_from_slice(&resp.index.to_be_bytes());
                payload.extend_from_slice(&resp.digest);
                payload.extend_from_slice(&name_len.to_be_bytes());
                payload.extend_from_slice(resp.file.as_bytes());
                payload.extend_from_slice(&resp.payload);
                Message {
                    kind: MessageId::ChunkResponse,
                    payload,
                }
            }
            PeerMessage::Error(err) => {
                let mut payload = Vec::with_capacity(2 + err.message.len());
                payload.extend_from_slice(&err.code.to_be_bytes());
                payload.extend_from_slice(err.message.as_bytes());
                Message {
                    kind: MessageId::Error,
                    payload,
                }
            }
            PeerMessage::Bye => Message {
                kind: MessageId::Bye,
                payload: vec![],
            },
            PeerMessage::Proof(signature) => Message {
                kind: MessageId::Proof,
                payload: signature.to_vec(),
            },
        };
        Ok(message)
    }
}

fn malformed(what: &str) -> PairError {
    PairError::Protocol(format!("malformed {what} message"))
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

fn utf8(bytes: &[u8], what: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| malformed(what))
}

impl TryFrom<Message> for PeerMessage {
    type Error = PairError;

    fn try_from(msg: Message) -> Result<Self> {
        let p = &msg.payload;
        match msg.kind {
            MessageId::Hello => Handshake::deserialize(p)
                .map(PeerMessage::Hello)
                .ok_or_else(|| malformed("hello")),
            MessageId::ChunkRequest => {
                if p.len() < 20 {
                    return Err(malformed("chunk request"));
                }
                Ok(PeerMessage::ChunkRequest(ChunkRequest {
                    index: be_u32(&p[0..4]),
                    start: be_u64(&p[4..12]),
                    end: be_u64(&p[12..20]),
                    file: utf8(&p[20..], "chunk request")?,
                }))
            }
            MessageId::ChunkResponse => {
                if p.len() < 26 {
                    return Err(malformed("chunk response"));
                }
                let name_len = u16::from_be_bytes([p[24], p[25]]) as usize;
                if p.len() < 26 + name_len {
                    return Err(malformed("chunk response"));
                }
                let mut digest: ChunkDigest = [0u8; 20];
                digest.copy_from_slice(&p[4..24]);
                Ok(PeerMessage::ChunkResponse(ChunkResponse {
                    index: be_u32(&p[0..4]),
                    digest,
                    file: utf8(&p[26..26 + name_len], "chunk response")?,
                    payload: p[26 + name_len..].to_vec(),
                }))
            }
            MessageId::Error => {
                if p.len() < 2 {
                    return Err(malformed("error"));
                }
                Ok(PeerMessage::Error(ErrorMessage {
                    code: u16::from_be_bytes([p[0], p[1]]),
                    message: String::from_utf8_lossy(&p[2..]).into_owned(),
                }))
            }
            MessageId::Bye => Ok(PeerMessage::Bye),
            MessageId::Proof => {
                if p.len() != SIGNATURE_LEN {
                    return Err(malformed("proof"));
                }
                let mut signature: SignatureBytes = [0u8; SIGNATURE_LEN];
                signature.copy_from_slice(p);
                Ok(PeerMessage::Proof(signature))
            }
        }
    }
}

pub async fn write_message<W>(writer: &mut W, msg: &PeerMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&Message::try_from(msg)?.serialize()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reassembles frames from partial reads. Reading is cancel safe: bytes
/// already pulled off the socket stay buffered if the caller gives up
/// waiting, so the next call resumes at the same frame boundary.
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
    max_frame: usize,
}

impl FrameReader {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
        }
    }

    pub fn set_max_frame(&mut self, max_frame: usize) {
        self.max_frame = max_frame;
    }

    /// Splits one complete frame off the buffer, if there is one.
    fn take_frame(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = be_u32(&self.buf[0..4]) as usize;
        if len == 0 {
            return Err(PairError::Protocol("empty frame".into()));
        }
        if len > self.max_frame {
            return Err(PairError::MessageTooLarge(len));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..4 + len).collect();
        Message::deserialize(&frame)
            .map(Some)
            .ok_or_else(|| PairError::Protocol(format!("unknown message id {}", frame[4])))
    }

    pub async fn read_message<R>(&mut self, reader: &mut R) -> Result<PeerMessage>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; 8192];
        loop {
            if let Some(message) = self.take_frame()? {
                return PeerMessage::try_from(message);
            }
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(PairError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::sha1_digest;
    use crate::identity::Identity;
    use assert_matches::assert_matches;

    #[test]
    fn test_message_id_try_from() {
        assert_eq!(MessageId::try_from(0), Ok(MessageId::Hello));
        assert_eq!(MessageId::try_from(2), Ok(MessageId::ChunkResponse));
        assert_eq!(MessageId::try_from(4), Ok(MessageId::Bye));
        assert_eq!(MessageId::try_from(5), Ok(MessageId::Proof));
        assert_eq!(MessageId::try_from(6), Err(()));
        assert_eq!(MessageId::try_from(255), Err(()));
    }

    #[test]
    fn test_message_serialize_layout() {
        let msg = Message {
            kind: MessageId::Error,
            payload: vec![0x00, 0x01, b'x'],
        };
        let serialized = msg.serialize();

        assert_eq!(serialized[0..4], [0, 0, 0, 4]); // length = 1 + 3
        assert_eq!(serialized[4], 3);
        assert_eq!(serialized[5..], [0x00, 0x01, b'x']);
    }

    #[test]
    fn test_message_deserialize_rejects_short_or_unknown() {
        assert!(Message::deserialize(&[0, 0, 0]).is_none());
        assert!(Message::deserialize(&[0, 0, 0, 1, 99]).is_none());
        assert!(Message::deserialize(&[0, 0, 0, 5, 1, 0x12]).is_none());
    }

    #[test]
    fn test_chunk_request_layout() {
        let msg = PeerMessage::ChunkRequest(ChunkRequest {
            file: "song.mp3".into(),
            index: 2,
            start: 200,
            end: 300,
        });
        let raw = Message::try_from(&msg).unwrap();
        assert_eq!(raw.kind, MessageId::ChunkRequest);
        assert_eq!(raw.payload[0..4], [0, 0, 0, 2]);
        assert_eq!(raw.payload[20..], *b"song.mp3");

        assert_eq!(PeerMessage::try_from(raw).unwrap(), msg);
    }

    #[test]
    fn test_chunk_response_decoding() {
        let payload = vec![0xAB; 100];
        let msg = PeerMessage::ChunkResponse(ChunkResponse {
            file: "song.mp3".into(),
            index: 1,
            digest: sha1_digest(&payload),
            payload,
        });
        let bytes = Message::try_from(&msg).unwrap().serialize();
        let decoded = PeerMessage::try_from(Message::deserialize(&bytes).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_truncated_chunk_response() {
        let raw = Message {
            kind: MessageId::ChunkResponse,
            payload: vec![0; 25],
        };
        assert_matches!(PeerMessage::try_from(raw), Err(PairError::Protocol(_)));

        let mut payload = vec![0; 26];
        payload[25] = 10; // name longer than what follows
        let raw = Message {
            kind: MessageId::ChunkResponse,
            payload,
        };
        assert_matches!(PeerMessage::try_from(raw), Err(PairError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_frame_reader_reassembles_partial_reads() {
        let identity = Identity::generate().unwrap();
        let hello = PeerMessage::Hello(Handshake::new(&identity));
        let request = PeerMessage::ChunkRequest(ChunkRequest {
            file: "a".into(),
            index: 0,
            start: 0,
            end: 10,
        });

        let mut bytes = Message::try_from(&hello).unwrap().serialize();
        bytes.extend(Message::try_from(&request).unwrap().serialize());
        bytes.extend(Message::try_from(&PeerMessage::Bye).unwrap().serialize());

        // Feed the stream three bytes at a time.
        let (mut client, mut server) = tokio::io::duplex(3);
        let writer = tokio::spawn(async move {
            for piece in bytes.chunks(3) {
                client.write_all(piece).await.unwrap();
            }
        });

        let mut reader = FrameReader::new(FRAME_OVERHEAD);
        assert_eq!(reader.read_message(&mut server).await.unwrap(), hello);
        assert_eq!(reader.read_message(&mut server).await.unwrap(), request);
        assert_eq!(reader.read_message(&mut server).await.unwrap(), PeerMessage::Bye);
        writer.await.unwrap();

        assert_matches!(reader.read_message(&mut server).await, Err(PairError::Io(_)));
    }

    #[tokio::test]
    async fn test_frame_reader_rejects_oversized_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(1_000_000u32).to_be_bytes()).await.unwrap();

        let mut reader = FrameReader::new(FRAME_OVERHEAD);
        assert_matches!(
            reader.read_message(&mut server).await,
            Err(PairError::MessageTooLarge(1_000_000))
        );
    }

    #[tokio::test]
    async fn test_overlong_file_name_is_not_sent() {
        let (mut client, _server) = tokio::io::duplex(1024);
        let msg = PeerMessage::ChunkResponse(ChunkResponse {
            file: "x".repeat(u16::MAX as usize + 1),
            index: 0,
            digest: sha1_digest(b""),
            payload: Vec::new(),
        });
        assert_matches!(write_message(&mut client, &msg).await, Err(PairError::Protocol(_)));
    }

    #[test]
    fn test_proof_frame() {
        let msg = PeerMessage::Proof([7u8; SIGNATURE_LEN]);
        let raw = Message::try_from(&msg).unwrap();
        assert_eq!(raw.kind, MessageId::Proof);
        assert_eq!(PeerMessage::try_from(raw).unwrap(), msg);

        let short = Message {
            kind: MessageId::Proof,
            payload: vec![0; 10],
        };
        assert_matches!(PeerMessage::try_from(short), Err(PairError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_write_message() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_message(&mut client, &PeerMessage::Bye).await.unwrap();

        let mut reader = FrameReader::new(FRAME_OVERHEAD);
        assert_eq!(reader.read_message(&mut server).await.unwrap(), PeerMessage::Bye);
    }
}
