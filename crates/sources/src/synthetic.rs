//! Procedural chunk data for exercising the pipeline without storage.
//!
//! Content depends only on the seed and the cell, so refetching a chunk
//! always yields the same bytes. Latency and transient failures can be
//! injected; failures are also a function of the cell and attempt.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::{ParseFloatError, ParseIntError};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use streaming::{
    BoxFuture, ChunkSourceSpec, DataSource, DataSourceProvider, FetchError, FetchRequest,
    GridPosition, RegistryError,
};
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticSource {
    pub seed: u64,
    /// Base delay before each fetch resolves.
    pub latency: Duration,
    /// Extra random delay, up to this much.
    pub jitter: Duration,
    /// Probability in `[0, 1]` that an attempt fails transiently.
    pub failure_rate: f64,
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self {
            seed: 0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            failure_rate: 0.0,
        }
    }
}

impl SyntheticSource {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration, jitter: Duration) -> Self {
        self.latency = latency;
        self.jitter = jitter;
        self
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    fn rng(&self, position: &GridPosition, salt: u32) -> StdRng {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        position.hash(&mut hasher);
        salt.hash(&mut hasher);
        StdRng::seed_from_u64(hasher.finish())
    }

    /// The bytes every fetch of `position` returns.
    pub fn chunk_bytes(&self, spec: &ChunkSourceSpec, position: &GridPosition) -> Vec<u8> {
        let target = spec.decode_target(position);
        let mut bytes = vec![0u8; target.num_elements() * target.data_type.bytes_per_element()];
        self.rng(position, 0).fill(&mut bytes[..]);
        bytes
    }

    fn fails(&self, position: &GridPosition, attempt: u32) -> bool {
        self.failure_rate > 0.0 && self.rng(position, attempt).gen_bool(self.failure_rate)
    }

    fn delay(&self, position: &GridPosition, attempt: u32) -> Duration {
        if self.jitter.is_zero() {
            return self.latency;
        }
        let extra = self
            .rng(position, attempt.wrapping_add(1 << 16))
            .gen_range(0..=self.jitter.as_micros() as u64);
        self.latency + Duration::from_micros(extra)
    }
}

impl DataSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<Vec<u8>, FetchError>> {
        let source = self.clone();
        Box::pin(async move {
            let delay = source.delay(&request.position, request.attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if source.fails(&request.position, request.attempt) {
                trace!(position = ?request.position, attempt = request.attempt, "injected failure");
                return Err(FetchError::transient(format!(
                    "synthetic failure at {:?}",
                    request.position
                )));
            }
            Ok(source.chunk_bytes(&request.descriptor.spec, &request.position))
        })
    }
}

/// Opens `synthetic://name?seed=1&latency_ms=20&jitter_ms=5&failure_rate=0.1`.
/// Every parameter is optional; the name part is only there to tell volumes
/// apart.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticProvider;

fn parse_query(url: &str) -> Result<SyntheticSource, String> {
    let mut source = SyntheticSource::default();
    let Some((_, query)) = url.split_once('?') else {
        return Ok(source);
    };
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("parameter {pair:?} has no value"))?;
        let bad = |e: String| format!("{key}={value}: {e}");
        match key {
            "seed" => source.seed = value.parse().map_err(|e: ParseIntError| bad(e.to_string()))?,
            "latency_ms" | "jitter_ms" => {
                let ms: u64 = value.parse().map_err(|e: ParseIntError| bad(e.to_string()))?;
                if key == "latency_ms" {
                    source.latency = Duration::from_millis(ms);
                } else {
                    source.jitter = Duration::from_millis(ms);
                }
            }
            "failure_rate" => {
                let rate: f64 = value.parse().map_err(|e: ParseFloatError| bad(e.to_string()))?;
                if !(0.0..=1.0).contains(&rate) {
                    return Err(format!("failure_rate {rate} is outside [0, 1]"));
                }
                source.failure_rate = rate;
            }
            _ => return Err(format!("unknown parameter {key:?}")),
        }
    }
    Ok(source)
}

impl DataSourceProvider for SyntheticProvider {
    fn scheme(&self) -> &str {
        "synthetic"
    }

    fn open(
        &self,
        url: &str,
        _spec: &ChunkSourceSpec,
    ) -> Result<Arc<dyn DataSource>, RegistryError> {
        let source = parse_query(url).map_err(|reason| RegistryError::Open {
            url: url.to_string(),
            reason,
        })?;
        Ok(Arc::new(source))
    }
}
