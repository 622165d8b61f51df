//! Chunks served over HTTP at `{base}/{chunk_name}`.

use std::sync::Arc;

use streaming::{
    BoxFuture, ChunkSourceSpec, DataSource, DataSourceProvider, FetchError, FetchRequest,
    RegistryError,
};
use tracing::debug;

use crate::chunk_name;

#[derive(Debug, Clone)]
pub struct HttpSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    pub fn chunk_url(&self, spec: &ChunkSourceSpec, request: &FetchRequest) -> String {
        format!("{}/{}", self.base_url, chunk_name(spec, &request.position))
    }
}

impl DataSource for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<Vec<u8>, FetchError>> {
        let url = self.chunk_url(&request.descriptor.spec, &request);
        let client = self.client.clone();
        Box::pin(async move {
            debug!(%url, attempt = request.attempt, "requesting chunk");
            // Connection and transport failures are worth another try.
            let resp = client
                .get(&url)
                .send()
                .await
                .map_err(|e| FetchError::transient(format!("{url}: {e}")))?;

            let status = resp.status();
            if let Some(error) =
                FetchError::from_status(status.as_u16(), format!("{url}: {status}"))
            {
                return Err(error);
            }

            let bytes = resp
                .bytes()
                .await
                .map_err(|e| FetchError::transient(format!("{url}: {e}")))?;
            Ok(bytes.to_vec())
        })
    }
}

/// Opens urls of one scheme (`http` or `https`) with a shared client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    scheme: &'static str,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(scheme: &'static str, client: reqwest::Client) -> Self {
        Self { scheme, client }
    }
}

impl DataSourceProvider for HttpProvider {
    fn scheme(&self) -> &str {
        self.scheme
    }

    fn open(
        &self,
        url: &str,
        _spec: &ChunkSourceSpec,
    ) -> Result<Arc<dyn DataSource>, RegistryError> {
        let host = url.split_once("://").map_or("", |(_, rest)| rest);
        if host.is_empty() || host.starts_with('/') {
            return Err(RegistryError::Open {
                url: url.to_string(),
                reason: "missing host".to_string(),
            });
        }
        Ok(Arc::new(HttpSource::new(url, self.client.clone())))
    }
}
