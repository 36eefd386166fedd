use crate::error::EngineError;
use crate::models::file::FileEntry;
use crate::storage::{self, StorageProvider};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::sync::Arc;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(EngineError::BadInput(format!(
                "unsupported hash algorithm: {}",
                other
            ))),
        }
    }
}

enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Streams a file's content from the provider through the configured
/// digest. Oversized files are rejected before any bytes move.
pub struct HashService {
    provider: Arc<dyn StorageProvider>,
    algorithm: HashAlgorithm,
    max_file_size: i64,
    buffer_size: usize,
    max_attempts: u32,
}

impl HashService {
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        algorithm: HashAlgorithm,
        max_file_size: i64,
        buffer_size: usize,
    ) -> Self {
        Self {
            provider,
            algorithm,
            max_file_size,
            buffer_size: buffer_size.max(4 * 1024),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub async fn digest(&self, file: &FileEntry) -> Result<String, EngineError> {
        if self.max_file_size > 0 && file.size > self.max_file_size {
            return Err(EngineError::HashTooLarge {
                size: file.size,
                max: self.max_file_size,
            });
        }

        let id = file.id.clone();
        let digest = storage::with_retries(self.max_attempts, || self.stream_digest(&id)).await?;
        Ok(digest)
    }

    async fn stream_digest(&self, id: &str) -> Result<String, crate::storage::StorageError> {
        use futures_util::TryStreamExt;
        use tokio::io::AsyncReadExt;
        use tokio_util::io::StreamReader;

        let stream = self.provider.download(id).await?;
        let io_stream = stream.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let mut reader = StreamReader::new(io_stream);

        let mut hasher = Hasher::new(self.algorithm);
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| crate::storage::StorageError::Network(e.to_string()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mock::MockProvider;

    fn service(provider: Arc<MockProvider>, algorithm: HashAlgorithm) -> HashService {
        HashService::new(provider, algorithm, 1024 * 1024, 64 * 1024)
    }

    #[tokio::test]
    async fn test_digest_matches_known_vectors() {
        let provider = Arc::new(MockProvider::new());
        provider.add_file("f1", "hello.txt", "root", b"hello world");
        let file = FileEntry::new("f1", "hello.txt", 11);

        let sha256 = service(provider.clone(), HashAlgorithm::Sha256)
            .digest(&file)
            .await
            .unwrap();
        assert_eq!(
            sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );

        let sha1 = service(provider.clone(), HashAlgorithm::Sha1)
            .digest(&file)
            .await
            .unwrap();
        assert_eq!(sha1, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");

        let md5 = service(provider, HashAlgorithm::Md5)
            .digest(&file)
            .await
            .unwrap();
        assert_eq!(md5, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_digest_retries_transient_failures() {
        let provider = Arc::new(MockProvider::new());
        provider.add_file("f1", "a.bin", "root", b"retry me");
        provider.fail_downloads("f1", 2);

        let file = FileEntry::new("f1", "a.bin", 8);
        let digest = service(provider, HashAlgorithm::Sha256)
            .digest(&file)
            .await
            .unwrap();
        assert!(!digest.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_file_is_rejected() {
        let provider = Arc::new(MockProvider::new());
        let svc = HashService::new(provider, HashAlgorithm::Sha256, 100, 64 * 1024);

        let file = FileEntry::new("big", "big.iso", 101);
        match svc.digest(&file).await {
            Err(EngineError::HashTooLarge { size, max }) => {
                assert_eq!(size, 101);
                assert_eq!(max, 100);
            }
            other => panic!("expected HashTooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("SHA256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert_eq!("md5".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Md5);
        assert!("crc32".parse::<HashAlgorithm>().is_err());
    }
}
