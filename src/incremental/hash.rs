//! Content hashing — xxh3-64 rendered as 16 hex digits.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Hash an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:016x}", xxh3_64(data))
}

/// Hash a file's contents without loading it whole.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Xxh3::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:016x}", hasher.digest()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_hash_is_stable_and_hex() {
        let a = hash_bytes(b"package main\n");
        let b = hash_bytes(b"package main\n");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, hash_bytes(b"package other\n"));
    }

    #[test]
    fn test_file_hash_matches_buffer_hash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.go");
        // Larger than one read buffer so the streaming path is exercised.
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(hash_file(&path).unwrap(), hash_bytes(&data));
    }

    #[test]
    fn test_missing_file_errors() {
        let dir = tempdir().unwrap();
        assert!(hash_file(&dir.path().join("nope.go")).is_err());
    }
}
