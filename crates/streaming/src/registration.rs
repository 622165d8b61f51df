//! Consumer-side bookkeeping of which sources each render layer shows.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::multiscale::MultiscaleSource;
use crate::request::{LayerId, SourceId, ViewId};
use crate::selection::{ViewSpec, VisibleSource};
use crate::transform::{LayerTransform, SourceTransform, TransformError};

/// Where source references are taken and dropped. Implemented by the
/// consumer's handle to the owner and by the owner itself.
pub trait SourceRefs {
    fn retain_source(&mut self, source: SourceId);
    fn release_source(&mut self, source: SourceId);
}

#[derive(Debug, Clone, PartialEq)]
struct CachedTransforms {
    revision: u64,
    display_dimensions: Vec<usize>,
    transforms: Result<Vec<Vec<SourceTransform>>, TransformError>,
}

#[derive(Debug, Default)]
struct LayerRegistration {
    /// Number of views currently showing each source.
    ref_counts: BTreeMap<SourceId, u32>,
    views: BTreeMap<ViewId, BTreeMap<SourceId, VisibleSource>>,
    cache: Option<CachedTransforms>,
    diagnostic: Option<String>,
}

/// What changed for one layer after an update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerUpdate {
    pub added: Vec<SourceId>,
    pub removed: Vec<SourceId>,
    pub diagnostic: Option<String>,
    /// The layer's visible-source set must be re-sent to the owner.
    pub changed: bool,
}

/// Per-layer reference counts of visible sources across views.
///
/// A source gains a reference from `SourceRefs` when the first view starts
/// showing it and loses it in the same call that drops the last view.
#[derive(Debug, Default)]
pub struct VisibleLayerRegistry {
    layers: BTreeMap<LayerId, LayerRegistration>,
}

impl VisibleLayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes which sources `view_id` shows for `layer`.
    ///
    /// A transform failure is not an error here: the view shows nothing for
    /// the layer and the message lands in [`LayerUpdate::diagnostic`].
    pub fn update_view(
        &mut self,
        layer: LayerId,
        view_id: ViewId,
        multiscale: &MultiscaleSource,
        transform: &LayerTransform,
        view: &ViewSpec,
        refs: &mut dyn SourceRefs,
    ) -> LayerUpdate {
        let reg = self.layers.entry(layer).or_default();

        let stale = reg.cache.as_ref().is_none_or(|c| {
            c.revision != transform.revision || c.display_dimensions != view.display_dimensions
        });
        if stale {
            debug!(%layer, revision = transform.revision, "recomputing source transforms");
            reg.cache = Some(CachedTransforms {
                revision: transform.revision,
                display_dimensions: view.display_dimensions.clone(),
                transforms: multiscale.transforms(transform),
            });
        }

        let selection = match reg.cache.as_ref().map(|c| &c.transforms) {
            Some(Ok(transforms)) => multiscale.select(transforms, view),
            Some(Err(e)) => Err(e.clone()),
            None => Err(TransformError::NoSources),
        };
        let (selected, diagnostic) = match selection {
            Ok(sources) => (
                sources
                    .into_iter()
                    .map(|s| (s.source(), s))
                    .collect::<BTreeMap<_, _>>(),
                None,
            ),
            Err(e) => {
                warn!(%layer, error = %e, "layer shows no sources");
                (BTreeMap::new(), Some(e.to_string()))
            }
        };

        let previous = reg.views.insert(view_id, selected.clone()).unwrap_or_default();
        let mut update = apply_diff(reg, &previous, &selected, refs);
        update.changed |= reg.diagnostic != diagnostic;
        reg.diagnostic = diagnostic.clone();
        update.diagnostic = diagnostic;
        update
    }

    /// Forgets one view of `layer`, releasing sources only it showed.
    pub fn remove_view(
        &mut self,
        layer: LayerId,
        view_id: ViewId,
        refs: &mut dyn SourceRefs,
    ) -> LayerUpdate {
        let Some(reg) = self.layers.get_mut(&layer) else {
            return LayerUpdate::default();
        };
        let previous = reg.views.remove(&view_id).unwrap_or_default();
        let mut update = apply_diff(reg, &previous, &BTreeMap::new(), refs);
        update.diagnostic = reg.diagnostic.clone();
        update
    }

    /// Drops `layer` entirely; returns the sources released.
    pub fn remove_layer(&mut self, layer: LayerId, refs: &mut dyn SourceRefs) -> Vec<SourceId> {
        let Some(reg) = self.layers.remove(&layer) else {
            return Vec::new();
        };
        let released: Vec<SourceId> = reg.ref_counts.into_keys().collect();
        for &source in &released {
            refs.release_source(source);
        }
        released
    }

    pub fn ref_count(&self, layer: LayerId, source: SourceId) -> u32 {
        self.layers
            .get(&layer)
            .and_then(|r| r.ref_counts.get(&source).copied())
            .unwrap_or(0)
    }

    pub fn diagnostic(&self, layer: LayerId) -> Option<&str> {
        self.layers.get(&layer)?.diagnostic.as_deref()
    }

    /// Every (view, source) pair currently shown for `layer`.
    pub fn visible_sources(&self, layer: LayerId) -> Vec<(ViewId, VisibleSource)> {
        let Some(reg) = self.layers.get(&layer) else {
            return Vec::new();
        };
        reg.views
            .iter()
            .flat_map(|(&view, sources)| sources.values().map(move |s| (view, s.clone())))
            .collect()
    }
}

/// Takes references for `next` before dropping those of `previous`, so a
/// source kept across the update never touches zero.
fn apply_diff(
    reg: &mut LayerRegistration,
    previous: &BTreeMap<SourceId, VisibleSource>,
    next: &BTreeMap<SourceId, VisibleSource>,
    refs: &mut dyn SourceRefs,
) -> LayerUpdate {
    let mut update = LayerUpdate::default();
    for (&source, visible) in next {
        let count = reg.ref_counts.entry(source).or_insert(0);
        *count += 1;
        if *count == 1 {
            refs.retain_source(source);
            update.added.push(source);
        }
        if previous.get(&source) != Some(visible) {
            update.changed = true;
        }
    }
    for &source in previous.keys() {
        let Some(count) = reg.ref_counts.get_mut(&source) else {
            continue;
        };
        *count -= 1;
        if *count == 0 {
            reg.ref_counts.remove(&source);
            refs.release_source(source);
            update.removed.push(source);
        }
        if !next.contains_key(&source) {
            update.changed = true;
        }
    }
    update
}
