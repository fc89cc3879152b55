use std::ops::Range;

use sha1::{Digest, Sha1};

pub type ChunkDigest = [u8; 20];

pub fn sha1_digest(data: &[u8]) -> ChunkDigest {
    Sha1::digest(data).into()
}

/// Describes one shareable file: its size, how it is cut into chunks and the
/// SHA-1 digest of every chunk as computed by the node that published it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub name: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunk_digests: Vec<ChunkDigest>,
    pub file_digest: ChunkDigest,
}

impl FileDescriptor {
    /// Builds the descriptor of a file we hold in full.
    pub fn from_bytes(name: impl Into<String>, data: &[u8], chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        let chunk_digests = data
            .chunks(chunk_size as usize)
            .map(sha1_digest)
            .collect();

        Self {
            name: name.into(),
            total_size: data.len() as u64,
            chunk_size,
            chunk_digests,
            file_digest: sha1_digest(data),
        }
    }

    pub fn chunk_count(&self) -> usize {
        chunk_count(self.total_size, self.chunk_size)
    }

    /// Half-open byte range `[start, end)` covered by chunk `index`.
    pub fn chunk_range(&self, index: usize) -> Option<Range<u64>> {
        if index >= self.chunk_count() {
            return None;
        }
        let start = index as u64 * self.chunk_size;
        let end = (start + self.chunk_size).min(self.total_size);
        Some(start..end)
    }

    pub fn chunk_digest(&self, index: usize) -> Option<&ChunkDigest> {
        self.chunk_digests.get(index)
    }

    /// A descriptor is usable for transfers only when it carries one digest
    /// per chunk.
    pub fn is_consistent(&self) -> bool {
        self.chunk_size > 0 && self.chunk_digests.len() == self.chunk_count()
    }
}

pub fn chunk_count(total_size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count_rounds_up() {
        assert_eq!(chunk_count(300, 100), 3);
        assert_eq!(chunk_count(301, 100), 4);
        assert_eq!(chunk_count(99, 100), 1);
        assert_eq!(chunk_count(0, 100), 0);
        assert_eq!(chunk_count(10, 0), 0);
    }

    #[test]
    fn test_from_bytes() {
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let descriptor = FileDescriptor::from_bytes("song.mp3", &data, 100);

        assert_eq!(descriptor.name, "song.mp3");
        assert_eq!(descriptor.total_size, 250);
        assert_eq!(descriptor.chunk_count(), 3);
        assert_eq!(descriptor.chunk_digests.len(), 3);
        assert_eq!(descriptor.chunk_digests[2], sha1_digest(&data[200..]));
        assert_eq!(descriptor.file_digest, sha1_digest(&data));
        assert!(descriptor.is_consistent());
    }

    #[test]
    fn test_chunk_range_last_chunk_is_short() {
        let descriptor = FileDescriptor::from_bytes("a", &[7u8; 250], 100);

        assert_eq!(descriptor.chunk_range(0), Some(0..100));
        assert_eq!(descriptor.chunk_range(1), Some(100..200));
        assert_eq!(descriptor.chunk_range(2), Some(200..250));
        assert_eq!(descriptor.chunk_range(3), None);
    }

    #[test]
    fn test_empty_file() {
        let descriptor = FileDescriptor::from_bytes("empty", &[], 100);
        assert_eq!(descriptor.chunk_count(), 0);
        assert!(descriptor.chunk_digests.is_empty());
        assert!(descriptor.is_consistent());
    }

    #[test]
    fn test_inconsistent_descriptor() {
        let mut descriptor = FileDescriptor::from_bytes("a", &[1u8; 300], 100);
        descriptor.chunk_digests.pop();
        assert!(!descriptor.is_consistent());
    }

    #[test]
    fn test_sha1_known_value() {
        // SHA-1("abc")
        let expected = [
            0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78, 0x50,
            0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d,
        ];
        assert_eq!(sha1_digest(b"abc"), expected);
    }
}
