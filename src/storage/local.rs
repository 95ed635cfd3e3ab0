use super::{BlobError, BlobProbe, BlobResult, BlobStore, BlobStream, validate_key};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

/// Container stored as a directory tree under `<root>/<container>`.
pub struct LocalBlobStore {
    container: String,
    dir: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: &Path, container: &str) -> std::io::Result<Self> {
        let dir = root.join(container);
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            container: container.to_string(),
            dir,
        })
    }

    fn path_for(&self, key: &str) -> BlobResult<PathBuf> {
        let key = validate_key(key)?;
        Ok(self.dir.join(key))
    }

    fn map_io(&self, key: &str, err: std::io::Error) -> BlobError {
        if err.kind() == ErrorKind::NotFound {
            BlobError::NotFound {
                container: self.container.clone(),
                key: key.to_string(),
            }
        } else {
            BlobError::Io(err)
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn container(&self) -> &str {
        &self.container
    }

    async fn probe(&self, key: &str) -> BlobResult<BlobProbe> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(BlobProbe::found(metadata.len())),
            Ok(_) => Ok(BlobProbe::missing()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BlobProbe::missing()),
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    async fn get(&self, key: &str, max_bytes: u64) -> BlobResult<Bytes> {
        let path = self.path_for(key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| self.map_io(key, err))?;
        let metadata = file.metadata().await.map_err(BlobError::Io)?;
        if metadata.len() > max_bytes {
            return Err(BlobError::TooLarge { limit: max_bytes });
        }
        let mut buffer = Vec::with_capacity(metadata.len() as usize);
        file.take(max_bytes.saturating_add(1))
            .read_to_end(&mut buffer)
            .await
            .map_err(BlobError::Io)?;
        if buffer.len() as u64 > max_bytes {
            return Err(BlobError::TooLarge { limit: max_bytes });
        }
        Ok(Bytes::from(buffer))
    }

    async fn get_stream(&self, key: &str) -> BlobResult<BlobStream> {
        let path = self.path_for(key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| self.map_io(key, err))?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn put(&self, key: &str, bytes: Bytes, _content_type: &str) -> BlobResult<()> {
        let path = self.path_for(key)?;
        let parent = path.parent().unwrap_or(&self.dir).to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(BlobError::Io)?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("blob");
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        let temp_path = parent.join(format!(".{file_name}.tmp-{nonce}-{}", std::process::id()));
        if let Err(err) = tokio::fs::write(&temp_path, &bytes).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(BlobError::Io(err));
        }
        if let Err(err) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(BlobError::Io(err));
        }
        Ok(())
    }
}
