use crate::core::errors::{PoolError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Compression applied to a value before it is cut into fragments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Zstd { level: i32 },
}

/// One cell of a chunked value.
///
/// A well-formed sequence is `Start`, exactly `parts` `Part`s, then `End`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Start {
        total_len: usize,
        parts: usize,
        compressed: bool,
    },
    Part(Vec<u8>),
    End,
}

/// A value stored as a framed run of fragments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedValue {
    fragments: Vec<Fragment>,
}

impl ChunkedValue {
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Number of byte fragments between the markers
    pub fn part_count(&self) -> usize {
        self.fragments
            .iter()
            .filter(|f| matches!(f, Fragment::Part(_)))
            .count()
    }

    /// Payload bytes held, markers excluded
    pub fn byte_len(&self) -> usize {
        self.fragments
            .iter()
            .map(|f| match f {
                Fragment::Part(bytes) => bytes.len(),
                _ => 0,
            })
            .sum()
    }

    pub fn into_fragments(self) -> Vec<Fragment> {
        self.fragments
    }
}

/// Serializes values with bincode and splits them into bounded fragments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCodec {
    max_part_size: usize,
    compression: Compression,
}

impl ChunkCodec {
    pub fn new(max_part_size: usize) -> Self {
        Self {
            max_part_size: max_part_size.max(1),
            compression: Compression::None,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn max_part_size(&self) -> usize {
        self.max_part_size
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Serialized size of `value` without compression
    pub fn serialized_size<T: Serialize>(&self, value: &T) -> Result<u64> {
        Ok(bincode::serialized_size(value)?)
    }

    /// Whether `value` is too large to travel as a single part
    pub fn needs_chunking<T: Serialize>(&self, value: &T) -> Result<bool> {
        Ok(self.serialized_size(value)? > self.max_part_size as u64)
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<ChunkedValue> {
        let raw = bincode::serialize(value)?;
        let (bytes, compressed) = match self.compression {
            Compression::None => (raw, false),
            Compression::Zstd { level } => (
                zstd::bulk::compress(&raw, level)
                    .map_err(|e| PoolError::compression("zstd encode", e))?,
                true,
            ),
        };

        let parts: Vec<Vec<u8>> = bytes
            .chunks(self.max_part_size)
            .map(|c| c.to_vec())
            .collect();

        let mut fragments = Vec::with_capacity(parts.len() + 2);
        fragments.push(Fragment::Start {
            total_len: bytes.len(),
            parts: parts.len(),
            compressed,
        });
        fragments.extend(parts.into_iter().map(Fragment::Part));
        fragments.push(Fragment::End);

        Ok(ChunkedValue { fragments })
    }

    /// Reassemble a value from its fragments.
    ///
    /// Any framing mismatch, and any failure to decompress or deserialize the
    /// joined bytes, is reported as `CorruptChunk`.
    pub fn decode<T: DeserializeOwned>(&self, fragments: &[Fragment]) -> Result<T> {
        let (total_len, parts, compressed) = match fragments.first() {
            Some(Fragment::Start {
                total_len,
                parts,
                compressed,
            }) => (*total_len, *parts, *compressed),
            Some(_) => return Err(PoolError::corrupt_chunk("missing start marker")),
            None => return Err(PoolError::corrupt_chunk("empty fragment sequence")),
        };

        if !matches!(fragments.last(), Some(Fragment::End)) || fragments.len() < 2 {
            return Err(PoolError::corrupt_chunk("missing end marker"));
        }

        let body = &fragments[1..fragments.len() - 1];
        if body.len() != parts {
            return Err(PoolError::corrupt_chunk(format!(
                "expected {} parts, found {}",
                parts,
                body.len()
            )));
        }

        let mut pieces = Vec::with_capacity(body.len());
        for fragment in body {
            match fragment {
                Fragment::Part(bytes) => pieces.push(bytes.as_slice()),
                _ => return Err(PoolError::corrupt_chunk("marker inside fragment run")),
            }
        }
        // the announced length is trusted only once the parts add up to it
        let found: usize = pieces.iter().map(|piece| piece.len()).sum();
        if found != total_len {
            return Err(PoolError::corrupt_chunk(format!(
                "expected {} bytes, found {}",
                total_len, found
            )));
        }
        let joined = pieces.concat();

        let raw = if compressed {
            zstd::stream::decode_all(joined.as_slice())
                .map_err(|e| PoolError::corrupt_chunk(format!("zstd decode: {}", e)))?
        } else {
            joined
        };

        bincode::deserialize(&raw)
            .map_err(|e| PoolError::corrupt_chunk(format!("deserialize: {}", e)))
    }
}

/// Split `value` into fragments of at most `max_part_size` bytes
pub fn encode<T: Serialize>(value: &T, max_part_size: usize) -> Result<ChunkedValue> {
    ChunkCodec::new(max_part_size).encode(value)
}

/// Rebuild a value produced by [`encode`] or any [`ChunkCodec`]
pub fn decode<T: DeserializeOwned>(fragments: &[Fragment]) -> Result<T> {
    // framing carries everything decode needs; the part size is irrelevant here
    ChunkCodec::new(usize::MAX).decode(fragments)
}
