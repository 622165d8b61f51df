use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::fetch::DataSource;
use crate::payload::{ChunkFormat, RawFormat};
use crate::source::ChunkSourceSpec;

/// Opens data sources for one URL scheme.
pub trait DataSourceProvider: Send + Sync {
    fn scheme(&self) -> &str;

    fn open(
        &self,
        url: &str,
        spec: &ChunkSourceSpec,
    ) -> Result<Arc<dyn DataSource>, RegistryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("url {0:?} has no scheme")]
    MissingScheme(String),
    #[error("no data source provider for scheme {0:?}")]
    UnknownScheme(String),
    #[error("no chunk format named {0:?}")]
    UnknownFormat(String),
    #[error("cannot open {url}: {reason}")]
    Open { url: String, reason: String },
}

/// Data source providers by URL scheme and chunk formats by name.
///
/// Built once at startup and shared behind an `Arc`; lookups never mutate.
#[derive(Clone, Default)]
pub struct Registry {
    providers: BTreeMap<String, Arc<dyn DataSourceProvider>>,
    formats: BTreeMap<String, Arc<dyn ChunkFormat>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("schemes", &self.providers.keys().collect::<Vec<_>>())
            .field("formats", &self.formats.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// A registry with the built-in `raw` format and no providers.
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register_format(Arc::new(RawFormat));
        registry
    }

    pub fn register_provider(&mut self, provider: Arc<dyn DataSourceProvider>) -> &mut Self {
        self.providers
            .insert(provider.scheme().to_ascii_lowercase(), provider);
        self
    }

    pub fn register_format(&mut self, format: Arc<dyn ChunkFormat>) -> &mut Self {
        self.formats.insert(format.name().to_string(), format);
        self
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn open(
        &self,
        url: &str,
        spec: &ChunkSourceSpec,
    ) -> Result<Arc<dyn DataSource>, RegistryError> {
        let scheme = url_scheme(url).ok_or_else(|| RegistryError::MissingScheme(url.to_string()))?;
        let provider = self
            .providers
            .get(&scheme)
            .ok_or(RegistryError::UnknownScheme(scheme))?;
        provider.open(url, spec)
    }

    pub fn format(&self, name: &str) -> Result<Arc<dyn ChunkFormat>, RegistryError> {
        self.formats
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownFormat(name.to_string()))
    }
}

/// Lower-cased scheme of `scheme://rest`.
pub fn url_scheme(url: &str) -> Option<String> {
    let (scheme, _) = url.split_once("://")?;
    (!scheme.is_empty()).then(|| scheme.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{DataSourceProvider, Registry, RegistryError, url_scheme};
    use crate::fetch::{BoxFuture, DataSource, FetchError, FetchRequest};
    use crate::payload::DataType;
    use crate::source::ChunkSourceSpec;

    struct Empty;

    impl DataSource for Empty {
        fn name(&self) -> &str {
            "empty"
        }

        fn fetch(&self, _request: FetchRequest) -> BoxFuture<'static, Result<Vec<u8>, FetchError>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    struct EmptyProvider;

    impl DataSourceProvider for EmptyProvider {
        fn scheme(&self) -> &str {
            "MEM"
        }

        fn open(
            &self,
            _url: &str,
            _spec: &ChunkSourceSpec,
        ) -> Result<Arc<dyn DataSource>, RegistryError> {
            Ok(Arc::new(Empty))
        }
    }

    fn spec() -> ChunkSourceSpec {
        ChunkSourceSpec::new(DataType::Uint8, &[4], &[4])
    }

    #[test]
    fn schemes_are_case_insensitive() {
        assert_eq!(url_scheme("HTTPS://host/x").as_deref(), Some("https"));
        assert_eq!(url_scheme("no-scheme"), None);
        assert_eq!(url_scheme("://x"), None);

        let mut registry = Registry::new();
        registry.register_provider(Arc::new(EmptyProvider));
        assert_eq!(registry.schemes().collect::<Vec<_>>(), vec!["mem"]);
        assert_eq!(registry.open("mem://a", &spec()).unwrap().name(), "empty");
    }

    #[test]
    fn unknown_names_are_errors() {
        let registry = Registry::new();
        assert!(registry.format("raw").is_ok());
        assert_eq!(
            registry.format("zarr").unwrap_err(),
            RegistryError::UnknownFormat("zarr".into())
        );
        assert!(matches!(
            registry.open("gs://bucket", &spec()),
            Err(RegistryError::UnknownScheme(s)) if s == "gs"
        ));
        assert!(matches!(
            registry.open("bucket", &spec()),
            Err(RegistryError::MissingScheme(_))
        ));
    }
}
