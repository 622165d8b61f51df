//! Chunks stored one file per cell under a root directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use streaming::{
    BoxFuture, ChunkSourceSpec, DataSource, DataSourceProvider, FetchError, FetchRequest,
    RegistryError,
};
use tracing::debug;

use crate::chunk_name;

#[derive(Debug, Clone)]
pub struct FilesystemSource {
    root: PathBuf,
}

impl FilesystemSource {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_path(&self, spec: &ChunkSourceSpec, request: &FetchRequest) -> PathBuf {
        self.root.join(chunk_name(spec, &request.position))
    }
}

fn classify_io(path: &Path, err: std::io::Error) -> FetchError {
    let message = format!("{}: {err}", path.display());
    match err.kind() {
        ErrorKind::NotFound => FetchError::not_found(message),
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            FetchError::transient(message)
        }
        _ => FetchError::permanent(message),
    }
}

impl DataSource for FilesystemSource {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<Vec<u8>, FetchError>> {
        let path = self.chunk_path(&request.descriptor.spec, &request);
        Box::pin(async move {
            debug!(path = %path.display(), attempt = request.attempt, "reading chunk");
            tokio::fs::read(&path).await.map_err(|e| classify_io(&path, e))
        })
    }
}

/// Opens `file:///abs/path` urls.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilesystemProvider;

impl DataSourceProvider for FilesystemProvider {
    fn scheme(&self) -> &str {
        "file"
    }

    fn open(
        &self,
        url: &str,
        _spec: &ChunkSourceSpec,
    ) -> Result<Arc<dyn DataSource>, RegistryError> {
        let root = url
            .split_once("://")
            .map(|(_, rest)| rest)
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| RegistryError::Open {
                url: url.to_string(),
                reason: "missing directory".to_string(),
            })?;
        Ok(Arc::new(FilesystemSource::new(root)))
    }
}
