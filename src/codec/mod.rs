//! Oversized-value chunking for the shared result stores.

pub mod chunk;

pub use chunk::{decode, encode, ChunkCodec, ChunkedValue, Compression, Fragment};
