//! Hashing functions.
//!
//! Cache keys are SHA-256 digests rendered as lowercase hex. Files are hashed
//! by streaming their bytes in fixed-size chunks so arbitrarily large weight
//! dumps never need to be resident in memory.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// Read buffer size for streaming hashes.
const CHUNK_SIZE: usize = 64 * 1024;

/// Stream everything from `reader` into SHA-256 and return the hex digest.
pub fn hash_reader<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash the whole content of the file at `path`.
///
/// Fails with [`KilnError::Io`](crate::KilnError::Io) if the file is missing
/// or unreadable.
pub fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let file = File::open(path.as_ref())?;
    hash_reader(BufReader::new(file))
}
