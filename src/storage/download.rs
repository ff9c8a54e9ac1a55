use std::path::Path;

use futures_util::StreamExt;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::swift::BlobStore;
use crate::errors::PersistError;

/// Download `container/object` to `dest`, resuming from the last written byte
/// after an interruption. At most `max_resumes` re-requests are made; a server
/// that ignores the range restarts the file from byte 0.
pub async fn resumable_download(
    store: &dyn BlobStore,
    container: &str,
    object: &str,
    dest: &Path,
    max_resumes: u32,
) -> Result<u64, PersistError> {
    let io_err = |source| PersistError::Io {
        path: dest.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
    let mut written: u64 = 0;
    let mut resumes: u32 = 0;

    loop {
        let interrupted = match store.open_range(container, object, written).await {
            Err(e) => Some(e),
            Ok(body) => {
                if body.start != written {
                    tracing::debug!(object, offset = written, "range ignored, restarting download");
                    file.set_len(0).await.map_err(io_err)?;
                    file.seek(std::io::SeekFrom::Start(0))
                        .await
                        .map_err(io_err)?;
                    written = 0;
                }
                let mut stream = body.stream;
                let mut failure = None;
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => {
                            file.write_all(&bytes).await.map_err(io_err)?;
                            written += bytes.len() as u64;
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                failure
            }
        };

        match interrupted {
            None => {
                file.flush().await.map_err(io_err)?;
                return Ok(written);
            }
            Some(e) if resumes < max_resumes => {
                resumes += 1;
                tracing::warn!(object, offset = written, resumes, error = %e, "download interrupted, resuming");
            }
            Some(e) => {
                tracing::error!(object, resumes, error = %e, "download interrupted too often");
                return Err(PersistError::ResumesExhausted {
                    object: object.to_string(),
                    resumes,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBlobStore;
    use tempfile::tempdir;

    fn payload() -> Vec<u8> {
        (0..100u8).collect()
    }

    #[tokio::test]
    async fn resumes_from_last_byte() {
        let store = MemoryBlobStore::new();
        store.put("c", "o", payload());
        store.interrupt_after(vec![30, 40]);

        let dir = tempdir().unwrap();
        let dest = dir.path().join("o.tar");
        let n = resumable_download(&store, "c", "o", &dest, 10).await.unwrap();

        assert_eq!(n, 100);
        assert_eq!(std::fs::read(&dest).unwrap(), payload());
        assert_eq!(store.range_offsets(), vec![0, 30, 70]);
    }

    #[tokio::test]
    async fn ignored_range_restarts_file() {
        let store = MemoryBlobStore::new();
        store.put("c", "o", payload());
        store.ignore_ranges();
        store.interrupt_after(vec![50]);

        let dir = tempdir().unwrap();
        let dest = dir.path().join("o.tar");
        resumable_download(&store, "c", "o", &dest, 10).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), payload());
    }

    #[tokio::test]
    async fn exceeding_resume_bound_is_terminal() {
        let store = MemoryBlobStore::new();
        store.put("c", "o", payload());
        store.interrupt_after(vec![10, 10, 10]);

        let dir = tempdir().unwrap();
        let err = resumable_download(&store, "c", "o", &dir.path().join("o.tar"), 2)
            .await
            .unwrap_err();
        match err {
            PersistError::ResumesExhausted { object, resumes } => {
                assert_eq!(object, "o");
                assert_eq!(resumes, 2);
            }
            other => panic!("Expected ResumesExhausted, got {:?}", other),
        }
        assert_eq!(store.range_offsets().len(), 3);
    }
}
