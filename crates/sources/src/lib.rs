//! Data sources for the chunk streaming pipeline.
//!
//! Every source names chunks the same way (see [`chunk_name`]) so a volume
//! written to disk can be served over HTTP unchanged.

pub mod filesystem;
pub mod http;
pub mod synthetic;

use std::sync::Arc;

use streaming::{ChunkSourceSpec, GridPosition, Registry};

pub use filesystem::{FilesystemProvider, FilesystemSource};
pub use http::{HttpProvider, HttpSource};
pub use synthetic::{SyntheticProvider, SyntheticSource};

/// `x0-x1_y0-y1_z0-z1`: the clipped voxel range of a cell, one
/// `lower-upper` pair per dimension.
pub fn chunk_name(spec: &ChunkSourceSpec, position: &GridPosition) -> String {
    let (lower, upper) = spec.chunk_voxel_range(position);
    lower
        .iter()
        .zip(&upper)
        .map(|(lo, hi)| format!("{lo}-{hi}"))
        .collect::<Vec<_>>()
        .join("_")
}

/// Registers `file`, `http`, `https` and `synthetic` providers.
pub fn register_defaults(registry: &mut Registry) -> &mut Registry {
    let client = reqwest::Client::new();
    registry
        .register_provider(Arc::new(FilesystemProvider))
        .register_provider(Arc::new(HttpProvider::new("http", client.clone())))
        .register_provider(Arc::new(HttpProvider::new("https", client)))
        .register_provider(Arc::new(SyntheticProvider))
}

/// A registry with the built-in formats and every provider in this crate.
pub fn default_registry() -> Registry {
    let mut registry = Registry::new();
    register_defaults(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use streaming::{ChunkSourceSpec, DataType, GridPosition};

    use super::{chunk_name, default_registry};

    #[test]
    fn names_use_clipped_voxel_ranges() {
        let spec = ChunkSourceSpec::new(DataType::Uint8, &[64, 64, 32], &[100, 64, 40]);
        assert_eq!(chunk_name(&spec, &GridPosition::new(vec![0, 0, 0])), "0-64_0-64_0-32");
        assert_eq!(chunk_name(&spec, &GridPosition::new(vec![1, 0, 1])), "64-100_0-64_32-40");
    }

    #[test]
    fn default_registry_knows_every_scheme() {
        let registry = default_registry();
        let schemes: Vec<&str> = registry.schemes().collect();
        assert_eq!(schemes, vec!["file", "http", "https", "synthetic"]);
    }
}
