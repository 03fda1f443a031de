//! SHA256 hashing utilities for content deduplication.
//!
//! Content hashes are stored on the object store as base64 text; entity tags
//! produced by the in-memory store are hex.

use base64::{engine::general_purpose, Engine as _};
use sha2::{Digest, Sha256};
use std::io::{self, Read};

const BUFFER_SIZE: usize = 64 * 1024;

/// Hash a stream, returning the base64 SHA256 digest and the number of bytes read
pub fn sha256_base64(reader: &mut dyn Read) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..read]);
        total += read as u64;
    }

    Ok((general_purpose::STANDARD.encode(hasher.finalize()), total))
}

/// Hex SHA256 of in-memory content
pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}
