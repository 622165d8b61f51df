//! Chunk management and streaming for multiresolution volumes.
//!
//! [`ChunkManager`] owns every source, chunk and fetch. Consumers talk to it
//! through [`ChunkManagerHandle`] and watch it through a [`Mirror`].

pub mod actor;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod fetch;
pub mod manager;
pub mod mirror;
pub mod multiscale;
pub mod payload;
pub mod protocol;
pub mod queue;
pub mod registration;
pub mod registry;
pub mod request;
pub mod residency;
pub mod selection;
pub mod source;
pub mod testing;
pub mod transform;

pub use actor::{ChunkManagerActor, ChunkManagerHandle, RemoteSource, spawn};
pub use cache::{CacheError, MemoryBudget, ResidencyCache};
pub use chunk::{ChunkRequest, ChunkResult};
pub use config::{ConfigError, StreamingConfig};
pub use fetch::*;
pub use manager::{ChunkManager, FetchOutcome, ManagerError};
pub use mirror::{Mirror, MirrorState, MirroredChunk};
pub use multiscale::{MultiscaleSource, SingleResolutionSource};
pub use payload::*;
pub use protocol::*;
pub use queue::{ChunkQueueManager, InFlight};
pub use registration::{LayerUpdate, SourceRefs, VisibleLayerRegistry};
pub use registry::{DataSourceProvider, Registry, RegistryError, url_scheme};
pub use request::*;
pub use residency::*;
pub use selection::{ViewSpec, VisibleChunk, VisibleSource, visible_chunks};
pub use source::{ChunkSourceSpec, SourceDescriptor, SpecError};
pub use transform::{LayerTransform, SourceTransform, TransformError, compute_source_transform};
