use std::collections::HashMap;
use std::time::Duration;

use foundation::math::Affine;
use streaming::testing::{ScriptedSource, cube_spec, descriptor};
use streaming::{
    ChunkManagerHandle, ChunkState, ConsumerMessage, GridPosition, LayerId, LayerTransform, Mirror,
    MirrorState, MultiscaleSource, OwnerMessage, SingleResolutionSource, SourceId, StreamingConfig,
    ViewId, ViewSpec, VisibleLayerRegistry, WireVisibleSource, spawn,
};

const LAYER: LayerId = LayerId(1);
const VIEW: ViewId = ViewId(1);

/// Receives owner messages until `done` holds, returning everything seen.
async fn collect_until(
    mirror: &mut Mirror,
    done: impl Fn(&MirrorState) -> bool,
) -> Vec<OwnerMessage> {
    let mut seen = Vec::new();
    let wait = async {
        while !done(mirror.state()) {
            match mirror.recv().await {
                Some(message) => seen.push(message),
                None => break,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("owner stalled");
    seen
}

/// Every chunk object starts Queued and only moves along legal edges.
fn assert_legal_transitions(messages: &[OwnerMessage]) {
    let mut last: HashMap<(SourceId, GridPosition), ChunkState> = HashMap::new();
    for message in messages {
        let OwnerMessage::ChunkStateChanged {
            source_id,
            grid_position,
            new_state,
            ..
        } = message
        else {
            continue;
        };
        let key = (*source_id, grid_position.clone());
        match last.get(&key) {
            None => assert_eq!(*new_state, ChunkState::Queued, "{key:?} did not start queued"),
            Some(prev) => assert!(
                prev.can_transition_to(*new_state),
                "{key:?}: {prev:?} -> {new_state:?}"
            ),
        }
        if *new_state == ChunkState::Disposed {
            last.remove(&key);
        } else {
            last.insert(key, *new_state);
        }
    }
}

fn whole_volume_view() -> ViewSpec {
    ViewSpec::centered(vec![0, 1, 2], vec![8.0; 3], [8.0; 3], 1.0)
}

/// Registers the layer's sources for `view` and forwards them to the owner.
fn show_layer(
    handle: &ChunkManagerHandle,
    registry: &mut VisibleLayerRegistry,
    multiscale: &MultiscaleSource,
    view: &ViewSpec,
) {
    let mut refs = handle.clone();
    let update = registry.update_view(
        LAYER,
        VIEW,
        multiscale,
        &LayerTransform::identity(3),
        view,
        &mut refs,
    );
    assert!(update.diagnostic.is_none());
    let sources = registry
        .visible_sources(LAYER)
        .iter()
        .map(|(view_id, source)| WireVisibleSource::new(*view_id, source))
        .collect();
    handle
        .send(ConsumerMessage::AddVisibleLayer {
            layer_id: LAYER,
            sources,
            diagnostic: update.diagnostic,
        })
        .unwrap();
    handle
        .send(ConsumerMessage::UpdateView {
            view_id: VIEW,
            view: view.clone(),
        })
        .unwrap();
}

#[tokio::test]
async fn visible_layer_streams_into_the_mirror_and_disposes_on_release() {
    let scripted = ScriptedSource::new();
    let (handle, mut mirror, join) =
        spawn(StreamingConfig::default(), scripted.registry()).unwrap();
    let spec = cube_spec(8, 16);
    let remote = handle
        .acquire_source(descriptor("scripted://volume", spec.clone()))
        .await
        .unwrap();
    let id = remote.id();
    let multiscale = MultiscaleSource::from_scales(
        3,
        vec![SingleResolutionSource {
            source: id,
            spec,
            voxel_to_layer: Affine::identity(3),
        }],
    )
    .unwrap();

    let mut registry = VisibleLayerRegistry::new();
    show_layer(&handle, &mut registry, &multiscale, &whole_volume_view());
    let mut log = collect_until(&mut mirror, |s| s.usable_chunks(id).len() == 8).await;
    assert_eq!(scripted.fetches().len(), 8);

    // Hiding the layer keeps the source alive through the remote handle.
    let mut refs = handle.clone();
    assert_eq!(registry.remove_layer(LAYER, &mut refs), vec![id]);
    handle
        .send(ConsumerMessage::RemoveVisibleLayer { layer_id: LAYER })
        .unwrap();
    drop(remote);
    log.extend(collect_until(&mut mirror, |s| s.is_disposed(id)).await);

    assert_legal_transitions(&log);
    let disposals = log
        .iter()
        .filter(|m| matches!(m, OwnerMessage::SourceDisposed { .. }))
        .count();
    assert_eq!(disposals, 1);
    assert_eq!(mirror.state().chunk_count(id), 0);

    handle.shutdown().unwrap();
    let manager = join.await.unwrap();
    assert!(manager.source_ids().is_empty());
    assert_eq!(manager.metrics().counter("sources.disposed"), 1);
}

#[tokio::test]
async fn snapshot_rebuilds_the_same_mirror() {
    let scripted = ScriptedSource::new();
    let (handle, mut mirror, join) =
        spawn(StreamingConfig::default(), scripted.registry()).unwrap();
    let spec = cube_spec(8, 16);
    let remote = handle
        .acquire_source(descriptor("scripted://volume", spec.clone()))
        .await
        .unwrap();
    let id = remote.id();
    let multiscale = MultiscaleSource::from_scales(
        3,
        vec![SingleResolutionSource {
            source: id,
            spec,
            voxel_to_layer: Affine::identity(3),
        }],
    )
    .unwrap();

    let mut registry = VisibleLayerRegistry::new();
    let view = ViewSpec::centered(vec![0, 1, 2], vec![4.0; 3], [3.0; 3], 1.0);
    show_layer(&handle, &mut registry, &multiscale, &view);
    collect_until(&mut mirror, |s| s.usable_chunks(id).len() == 1).await;

    let incremental = mirror.state().clone();

    handle.send(ConsumerMessage::RequestSnapshot).unwrap();
    let wait = async {
        loop {
            match mirror.recv().await {
                Some(message @ OwnerMessage::Snapshot(_)) => break message,
                Some(_) => continue,
                None => panic!("owner went away"),
            }
        }
    };
    let snapshot = tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("no snapshot");
    let mut rebuilt = MirrorState::new();
    assert!(rebuilt.apply(&snapshot));
    assert_eq!(rebuilt.usable_chunks(id), incremental.usable_chunks(id));
    assert_eq!(rebuilt.source_seq(id), incremental.source_seq(id));

    drop(remote);
    handle.shutdown().unwrap();
    join.await.unwrap();
}
