//! File digests used for post-upload integrity checks.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;

const READ_BUFFER: usize = 1024 * 1024;

/// Dropbox hashes content in 4 MiB blocks.
pub const DROPBOX_BLOCK: usize = 4 * 1024 * 1024;

/// Lowercase hex MD5 of a file (Google Drive `md5Checksum`).
pub async fn md5_hex(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// Lowercase hex SHA-256 of a file (OneDrive `sha256Hash`).
pub async fn sha256_hex(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Dropbox `content_hash`: SHA-256 over the concatenated SHA-256 digests of
/// each 4 MiB block.
pub async fn dropbox_content_hash(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut overall = Sha256::new();
    let mut block = vec![0u8; DROPBOX_BLOCK];
    loop {
        let mut filled = 0;
        while filled < DROPBOX_BLOCK {
            let n = file.read(&mut block[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        overall.update(Sha256::digest(&block[..filled]));
        if filled < DROPBOX_BLOCK {
            break;
        }
    }
    Ok(hex::encode(overall.finalize()))
}

/// Dropbox content hash of an in-memory buffer.
pub fn dropbox_content_hash_bytes(data: &[u8]) -> String {
    let mut overall = Sha256::new();
    for block in data.chunks(DROPBOX_BLOCK) {
        overall.update(Sha256::digest(block));
    }
    hex::encode(overall.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_known_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"abc").await.unwrap();
        assert_eq!(md5_hex(&path).await.unwrap(), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(
            sha256_hex(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_dropbox_hash_matches_in_memory_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let data: Vec<u8> = (0..DROPBOX_BLOCK + 1000).map(|i| (i % 13) as u8).collect();
        fs::write(&path, &data).await.unwrap();
        assert_eq!(
            dropbox_content_hash(&path).await.unwrap(),
            dropbox_content_hash_bytes(&data)
        );
    }
}
