//! Tabular files, checkpoint log and HTTP fetch utilities for tdir.

pub mod checkpoint;
pub mod directory;
pub mod http;
pub mod tabular;

use std::path::Path;

use anyhow::Context;
use sha2::{Digest, Sha256};

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointLog};
pub use directory::{
    load_directory, read_key_list, record_from_row, record_to_row, write_directory,
    write_key_list, DIRECTORY_COLUMNS,
};
pub use http::{
    classify_reqwest_error, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
};
pub use tabular::{write_atomic, AppendSink, ChunkedReader, Header, Row};

pub const CRATE_NAME: &str = "tdir-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Size and SHA-256 of a file on disk.
pub fn file_digest(path: &Path) -> anyhow::Result<(u64, String)> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok((bytes.len() as u64, sha256_hex(&bytes)))
}
