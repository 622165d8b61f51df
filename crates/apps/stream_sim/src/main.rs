use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use foundation::math::Affine;
use streaming::manager::{IN_FLIGHT, QUEUE_LEN};
use streaming::{
    ChunkManagerHandle, ChunkSourceSpec, ConsumerMessage, DataType, LayerId, LayerTransform,
    Mirror, MultiscaleSource, RemoteSource, SingleResolutionSource, SourceDescriptor,
    StreamingConfig, ViewId, ViewSpec, VisibleLayerRegistry, WireVisibleSource,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const LAYER: LayerId = LayerId(1);
const VIEW: ViewId = ViewId(1);

#[derive(Parser, Debug)]
#[command(author, version, about = "Pans a viewport across a synthetic multiscale volume")]
struct Args {
    /// Voxels per axis at the finest scale
    #[arg(long, default_value_t = 512)]
    size: i64,

    /// Chunk edge length in voxels
    #[arg(long, default_value_t = 64)]
    chunk: u32,

    /// Number of scales, each half the resolution of the previous one
    #[arg(long, default_value_t = 3)]
    scales: u32,

    /// Frames to simulate
    #[arg(long, default_value_t = 24)]
    frames: u32,

    /// Viewport pan per frame, in model units
    #[arg(long, default_value_t = 24.0)]
    step: f64,

    /// Half the viewport width, in model units
    #[arg(long, default_value_t = 96.0)]
    half_extent: f64,

    /// Model units per screen pixel
    #[arg(long, default_value_t = 1.0)]
    pixel_size: f64,

    /// Wall-clock time between frames
    #[arg(long, default_value_t = 30)]
    frame_ms: u64,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    #[arg(long, default_value_t = 5)]
    latency_ms: u64,

    #[arg(long, default_value_t = 10)]
    jitter_ms: u64,

    /// Probability that a single fetch attempt fails transiently
    #[arg(long, default_value_t = 0.05)]
    failure_rate: f64,

    /// JSON pipeline config; defaults plus `CHUNK_*` env overrides if unset
    #[arg(long)]
    config: Option<PathBuf>,

    /// Give up waiting for outstanding fetches after this long
    #[arg(long, default_value_t = 5000)]
    settle_ms: u64,
}

type SimResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = real_main(Args::parse()).await {
        error!("stream_sim failed: {e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn real_main(args: Args) -> SimResult<()> {
    let config = match &args.config {
        Some(path) => StreamingConfig::from_json_file(path)?,
        None => StreamingConfig::from_env()?,
    };
    info!(?config, "starting simulation");

    let registry = Arc::new(sources::default_registry());
    let (handle, mut mirror, join) = streaming::spawn(config, registry)?;

    let (remotes, multiscale) = open_volume(&handle, &args).await?;
    let transform = LayerTransform::identity(3);
    let mut layers = VisibleLayerRegistry::new();
    let mut refs = handle.clone();

    let center = args.size as f64 / 2.0;
    for frame in 0..args.frames {
        let x = (args.half_extent + f64::from(frame) * args.step).rem_euclid(args.size as f64);
        let mut view = ViewSpec::centered(
            vec![0, 1, 2],
            vec![x, center, center],
            [args.half_extent; 3],
            args.pixel_size,
        );
        view.prefetch_margin = f64::from(args.chunk);

        let update = layers.update_view(LAYER, VIEW, &multiscale, &transform, &view, &mut refs);
        if let Some(diagnostic) = &update.diagnostic {
            warn!(frame, %diagnostic, "layer has no visible sources");
        }
        if update.changed || frame == 0 {
            let sources = layers
                .visible_sources(LAYER)
                .iter()
                .map(|(view_id, source)| WireVisibleSource::new(*view_id, source))
                .collect();
            handle.send(ConsumerMessage::AddVisibleLayer {
                layer_id: LAYER,
                sources,
                diagnostic: update.diagnostic.clone(),
            })?;
        }
        handle.send(ConsumerMessage::UpdateView { view_id: VIEW, view })?;

        tokio::time::sleep(Duration::from_millis(args.frame_ms)).await;
        let received = mirror.pump();
        info!(
            frame,
            x,
            received,
            usable = usable_chunks(&mirror, &remotes),
            "frame"
        );
    }

    settle(&handle, Duration::from_millis(args.settle_ms)).await?;
    mirror.pump();
    info!(usable = usable_chunks(&mirror, &remotes), "viewport settled");
    log_metrics(&handle).await?;

    layers.remove_layer(LAYER, &mut refs);
    handle.send(ConsumerMessage::RemoveVisibleLayer { layer_id: LAYER })?;
    let ids: Vec<_> = remotes.iter().map(RemoteSource::id).collect();
    drop(remotes);
    handle.shutdown()?;
    let manager = join.await?;
    mirror.pump();

    let disposed = ids.iter().filter(|id| mirror.state().is_disposed(**id)).count();
    info!(
        disposed,
        sources = ids.len(),
        remaining = manager.source_ids().len(),
        applied = mirror.state().applied(),
        ignored = mirror.state().ignored(),
        "simulation finished"
    );
    Ok(())
}

/// Opens one synthetic source per scale, fine to coarse.
async fn open_volume(
    handle: &ChunkManagerHandle,
    args: &Args,
) -> SimResult<(Vec<RemoteSource>, MultiscaleSource)> {
    let mut remotes = Vec::new();
    let mut levels = Vec::new();
    for scale in 0..args.scales {
        let factor = 1i64 << scale;
        let shape = (args.size + factor - 1) / factor;
        let spec = ChunkSourceSpec::new(DataType::Uint8, &[args.chunk; 3], &[shape; 3]);
        let url = format!(
            "synthetic://sim/s{scale}?seed={}&latency_ms={}&jitter_ms={}&failure_rate={}",
            args.seed, args.latency_ms, args.jitter_ms, args.failure_rate
        );
        let remote = handle
            .acquire_source(SourceDescriptor {
                url,
                format: "raw".to_string(),
                spec: spec.clone(),
            })
            .await?;
        levels.push(SingleResolutionSource {
            source: remote.id(),
            spec,
            voxel_to_layer: Affine::scale_translate(&[factor as f64; 3], &[0.0; 3]),
        });
        remotes.push(remote);
    }
    let multiscale = MultiscaleSource::from_scales(3, levels)?;
    Ok((remotes, multiscale))
}

fn usable_chunks(mirror: &Mirror, remotes: &[RemoteSource]) -> usize {
    remotes
        .iter()
        .map(|r| mirror.state().usable_chunks(r.id()).len())
        .sum()
}

/// Polls metrics until nothing is queued or in flight.
async fn settle(handle: &ChunkManagerHandle, limit: Duration) -> SimResult<()> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let metrics = handle.metrics().await?;
        let gauge = |name: &str| {
            metrics
                .gauges
                .iter()
                .find(|(n, _)| *n == name)
                .map_or(0, |(_, g)| g.value)
        };
        if gauge(QUEUE_LEN) == 0 && gauge(IN_FLIGHT) == 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(
                queued = gauge(QUEUE_LEN),
                in_flight = gauge(IN_FLIGHT),
                "fetches still outstanding"
            );
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn log_metrics(handle: &ChunkManagerHandle) -> SimResult<()> {
    let metrics = handle.metrics().await?;
    for (name, value) in &metrics.counters {
        info!(metric = name, value, "counter");
    }
    for (name, gauge) in &metrics.gauges {
        info!(metric = name, value = gauge.value, peak = gauge.peak, "gauge");
    }
    Ok(())
}
