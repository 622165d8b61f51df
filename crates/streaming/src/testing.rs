//! A scriptable in-memory `DataSource` for exercising the pipeline.
//!
//! Replies are queued per grid position and consumed one per attempt; a
//! position with nothing queued gets a well-formed chunk of ones. A gated
//! source holds every fetch open until [`ScriptedSource::release`] hands out
//! permits, which makes in-flight counts observable.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::fetch::{BoxFuture, DataSource, FetchError, FetchRequest};
use crate::payload::DataType;
use crate::registry::{DataSourceProvider, Registry, RegistryError};
use crate::request::{GridPosition, SourceId};
use crate::source::{ChunkSourceSpec, SourceDescriptor};

pub const SCRIPTED_SCHEME: &str = "scripted";

#[derive(Debug, Clone)]
pub enum Reply {
    Bytes(Vec<u8>),
    Fail(FetchError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRecord {
    pub source: SourceId,
    pub position: GridPosition,
    pub attempt: u32,
}

#[derive(Debug, Default)]
struct Script {
    replies: HashMap<GridPosition, VecDeque<Reply>>,
    fetches: Vec<FetchRecord>,
    in_flight: usize,
    peak: usize,
}

#[derive(Debug)]
struct Shared {
    script: Mutex<Script>,
    gate: Option<Semaphore>,
}

#[derive(Debug, Clone)]
pub struct ScriptedSource {
    shared: Arc<Shared>,
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSource {
    /// Fetches complete as soon as they are polled.
    pub fn new() -> Self {
        Self::with_gate(None)
    }

    /// Fetches wait for a permit from [`ScriptedSource::release`].
    pub fn gated() -> Self {
        Self::with_gate(Some(Semaphore::new(0)))
    }

    fn with_gate(gate: Option<Semaphore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                script: Mutex::new(Script::default()),
                gate,
            }),
        }
    }

    /// Queues the reply for the next unanswered attempt at `position`.
    pub fn reply(&self, position: impl Into<GridPosition>, reply: Reply) -> &Self {
        self.shared
            .script
            .lock()
            .replies
            .entry(position.into())
            .or_default()
            .push_back(reply);
        self
    }

    /// Lets `permits` more gated fetches finish.
    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.shared.gate {
            gate.add_permits(permits);
        }
    }

    /// Every fetch started so far, in start order.
    pub fn fetches(&self) -> Vec<FetchRecord> {
        self.shared.script.lock().fetches.clone()
    }

    pub fn positions(&self) -> Vec<GridPosition> {
        self.fetches().into_iter().map(|f| f.position).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.script.lock().in_flight
    }

    pub fn peak_in_flight(&self) -> usize {
        self.shared.script.lock().peak
    }

    /// A registry that opens this source for every `scripted://` url.
    pub fn registry(&self) -> Arc<Registry> {
        let mut registry = Registry::new();
        registry.register_provider(Arc::new(ScriptedProvider {
            source: self.clone(),
        }));
        Arc::new(registry)
    }
}

/// Decrements the in-flight count when the fetch future goes away,
/// including when it is dropped by cancellation.
struct InFlightGuard(Arc<Shared>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut script = self.0.script.lock();
        script.in_flight = script.in_flight.saturating_sub(1);
    }
}

fn default_bytes(request: &FetchRequest) -> Vec<u8> {
    let target = request.descriptor.spec.decode_target(&request.position);
    vec![1; target.num_elements() * target.data_type.bytes_per_element()]
}

impl DataSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<Vec<u8>, FetchError>> {
        let shared = self.shared.clone();
        Box::pin(async move {
            let reply = {
                let mut script = shared.script.lock();
                script.fetches.push(FetchRecord {
                    source: request.source,
                    position: request.position.clone(),
                    attempt: request.attempt,
                });
                script.in_flight += 1;
                script.peak = script.peak.max(script.in_flight);
                script
                    .replies
                    .get_mut(&request.position)
                    .and_then(VecDeque::pop_front)
            };
            let _guard = InFlightGuard(shared.clone());

            if let Some(gate) = &shared.gate {
                gate.acquire()
                    .await
                    .map_err(|e| FetchError::transient(e.to_string()))?
                    .forget();
            }
            match reply {
                Some(Reply::Bytes(bytes)) => Ok(bytes),
                Some(Reply::Fail(error)) => Err(error),
                None => Ok(default_bytes(&request)),
            }
        })
    }
}

#[derive(Debug)]
pub struct ScriptedProvider {
    source: ScriptedSource,
}

impl DataSourceProvider for ScriptedProvider {
    fn scheme(&self) -> &str {
        SCRIPTED_SCHEME
    }

    fn open(
        &self,
        _url: &str,
        _spec: &ChunkSourceSpec,
    ) -> Result<Arc<dyn DataSource>, RegistryError> {
        Ok(Arc::new(self.source.clone()))
    }
}

/// A `raw`-format descriptor for `url`.
pub fn descriptor(url: &str, spec: ChunkSourceSpec) -> SourceDescriptor {
    SourceDescriptor {
        url: url.to_string(),
        format: "raw".to_string(),
        spec,
    }
}

/// A 3-d `uint8` volume of `shape`³ voxels in cubic chunks of `chunk`.
pub fn cube_spec(chunk: u32, shape: i64) -> ChunkSourceSpec {
    ChunkSourceSpec::new(DataType::Uint8, &[chunk; 3], &[shape; 3])
}
