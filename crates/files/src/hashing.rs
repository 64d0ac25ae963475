//! Streaming content hashing and best-effort media sniffing.

use crate::constants::HASH_BLOCK_SIZE;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::path::Path;

/// Computes the SHA-256 digest of a file as lowercase hex.
///
/// The file is read in [`HASH_BLOCK_SIZE`] blocks, so memory use does not depend on the
/// file's size.
///
/// # Errors
///
/// Returns any I/O error raised while opening or reading the file.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut block = vec![0u8; HASH_BLOCK_SIZE];

    loop {
        let read = match file.read(&mut block) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&block[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Computes the SHA-256 digest of an in-memory buffer as lowercase hex.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Detects a media type from the file's leading magic bytes.
///
/// This is a best-effort detection and should not be considered authoritative; the
/// catalog's MIME type always comes from the extension allow-list.
pub fn sniff_media_type(path: &Path) -> Option<String> {
    match infer::get_from_path(path) {
        Ok(kind) => kind.map(|k| k.mime_type().to_string()),
        Err(e) => {
            tracing::debug!("media sniffing failed for {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_file_matches_bytes_across_blocks() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("big.bin");
        let data: Vec<u8> = (0..(HASH_BLOCK_SIZE * 3 + 17))
            .map(|i| (i % 251) as u8)
            .collect();
        fs::write(&path, &data).unwrap();

        assert_eq!(sha256_file(&path).unwrap(), sha256_bytes(&data));
    }

    #[test]
    fn test_sha256_file_missing() {
        let temp = TempDir::new().unwrap();
        assert!(sha256_file(&temp.path().join("absent")).is_err());
    }

    #[test]
    fn test_sniff_png() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("image.png");
        fs::write(&path, [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]).unwrap();

        assert_eq!(sniff_media_type(&path).as_deref(), Some("image/png"));
    }

    #[test]
    fn test_sniff_plain_text_is_unknown() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("notes.txt");
        fs::write(&path, b"just words").unwrap();

        assert_eq!(sniff_media_type(&path), None);
    }
}
