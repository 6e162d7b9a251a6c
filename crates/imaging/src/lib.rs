use anyhow::{anyhow, bail, Context, Result};
use raspi_core::human_size;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub human_size: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageDigest {
    pub source: String,
    pub total_size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Copy)]
pub struct HashProgress {
    pub bytes_hashed: u64,
    pub total_bytes: u64,
}

pub trait ProgressObserver {
    /// Returning `false` cancels the hash.
    fn on_progress(&mut self, progress: HashProgress) -> bool;
}

/// Checks that `path` is a non-empty regular file that can be opened.
pub fn inspect_image(path: impl AsRef<Path>) -> Result<ImageInfo> {
    let path = path.as_ref();
    let meta = std::fs::metadata(path)
        .with_context(|| format!("image {} is not accessible", path.display()))?;
    if !meta.is_file() {
        bail!("image {} is not a regular file", path.display());
    }
    if meta.len() == 0 {
        bail!("image {} is empty", path.display());
    }
    File::open(path).with_context(|| format!("image {} is not readable", path.display()))?;
    Ok(ImageInfo {
        path: path.to_path_buf(),
        size_bytes: meta.len(),
        human_size: human_size(meta.len()),
    })
}

pub fn hash_image_readonly(
    path: impl AsRef<Path>,
    chunk_size: u64,
    mut observer: Option<&mut dyn ProgressObserver>,
) -> Result<ImageDigest> {
    if chunk_size == 0 {
        return Err(anyhow!("chunk_size must be > 0"));
    }
    let chunk_size = usize::try_from(chunk_size)
        .map_err(|_| anyhow!("chunk_size too large for this platform"))?;
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let total_size = file.metadata()?.len();

    let mut reader = BufReader::new(file);
    let mut buffer = vec![0u8; chunk_size];
    let mut hasher = Sha256::new();
    let mut offset = 0u64;

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        offset += read as u64;
        if let Some(obs) = observer.as_deref_mut() {
            let progress = HashProgress {
                bytes_hashed: offset,
                total_bytes: total_size,
            };
            if !obs.on_progress(progress) {
                return Err(anyhow!("hash cancelled"));
            }
        }
    }

    Ok(ImageDigest {
        source: path.display().to_string(),
        total_size,
        sha256: to_hex(&hasher.finalize()),
    })
}

/// Hashes the image and compares against `expected` (hex, case-insensitive).
pub fn verify_image_sha256(
    path: impl AsRef<Path>,
    expected: &str,
    observer: Option<&mut dyn ProgressObserver>,
) -> Result<ImageDigest> {
    let digest = hash_image_readonly(path, DEFAULT_CHUNK_SIZE, observer)?;
    if !digest.sha256.eq_ignore_ascii_case(expected.trim()) {
        bail!(
            "sha256 mismatch for {}: expected {}, got {}",
            digest.source,
            expected.trim(),
            digest.sha256
        );
    }
    Ok(digest)
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn inspect_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("raspbian.img");
        fs::write(&img, vec![0u8; 2048]).unwrap();
        let info = inspect_image(&img).unwrap();
        assert_eq!(info.size_bytes, 2048);
        assert_eq!(info.human_size, "2KB");
    }

    #[test]
    fn inspect_rejects_missing_empty_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(inspect_image(dir.path().join("nope.img")).is_err());
        assert!(inspect_image(dir.path()).is_err());
        let empty = dir.path().join("empty.img");
        fs::write(&empty, b"").unwrap();
        assert!(inspect_image(&empty).is_err());
    }

    #[test]
    fn hashes_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("abc.img");
        fs::write(&img, b"abc").unwrap();
        let digest = hash_image_readonly(&img, 1, None).unwrap();
        assert_eq!(digest.sha256, ABC_SHA256);
        assert_eq!(digest.total_size, 3);
    }

    #[test]
    fn verify_accepts_uppercase_and_rejects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("abc.img");
        fs::write(&img, b"abc").unwrap();
        assert!(verify_image_sha256(&img, &ABC_SHA256.to_uppercase(), None).is_ok());
        let err = verify_image_sha256(&img, "00", None).unwrap_err();
        assert!(err.to_string().contains("sha256 mismatch"));
    }

    struct CancelAfter(u64);

    impl ProgressObserver for CancelAfter {
        fn on_progress(&mut self, progress: HashProgress) -> bool {
            progress.bytes_hashed < self.0
        }
    }

    #[test]
    fn observer_can_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("abc.img");
        fs::write(&img, b"abcdef").unwrap();
        let mut cancel = CancelAfter(2);
        let err = hash_image_readonly(&img, 1, Some(&mut cancel)).unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
