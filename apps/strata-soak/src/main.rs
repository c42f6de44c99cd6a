//! Strata soak test.
//!
//! Runs the frame loop headless while rayon workers record and submit command
//! buffers and a background loader streams uploads through the transient
//! arena, retrying whenever the arena is full.
//!
//! Usage: `strata-soak [FRAMES] [WORKERS]`

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use rayon::prelude::*;
use strata_gpu::{
    AsyncLoader, AsyncLoaderTask, Buffer, BufferInitInfo, BufferMapAccess, BufferUsage,
    CommandBufferInitInfo, GrConfig, GrManager, SubmitInfo, TaskOutcome, TransientMemoryConfig,
    TransientUsage,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
#[cfg(feature = "profiling-tracy")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const UPLOAD_SIZE: u64 = 256 * 1024;
/// More than fit in one frame of transient memory.
const UPLOADS_PER_FRAME: usize = 2;

/// Copies a block of generated bytes into a GPU-only buffer.
struct UploadTask {
    name: String,
    target: Arc<Buffer>,
    seed: u8,
}

impl AsyncLoaderTask for UploadTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, gr: &GrManager) -> strata_gpu::Result<TaskOutcome> {
        let mut memory =
            match gr.allocate_frame_transient_memory(self.target.size(), TransientUsage::Transfer) {
                Ok(allocation) => allocation,
                Err(e) if e.is_retryable() => return Ok(TaskOutcome::Retry),
                Err(e) => return Err(e),
            };
        for (i, byte) in memory.iter_mut().enumerate() {
            *byte = self.seed.wrapping_add(i as u8);
        }
        let token = memory.token();
        drop(memory);

        let mut cmdb = gr.new_command_buffer(&CommandBufferInitInfo::Primary)?;
        cmdb.copy_transient_to_buffer(&token, &self.target, 0);
        cmdb.set_buffer_barrier(
            &self.target,
            BufferUsage::TRANSFER_DESTINATION,
            BufferUsage::STORAGE_COMPUTE_READ,
            0,
            self.target.size(),
        )?;
        cmdb.end()?;
        gr.submit(cmdb, &SubmitInfo::default())?;
        Ok(TaskOutcome::Done)
    }
}

fn init_logging() {
    #[cfg(feature = "profiling-tracy")]
    {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,strata_gpu=trace,strata_soak=trace"));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }
}

fn parse_arg(index: usize, default: usize) -> anyhow::Result<usize> {
    std::env::args().nth(index).map_or(Ok(default), |arg| {
        arg.parse()
            .with_context(|| format!("argument {index} is not a number: {arg}"))
    })
}

/// One worker's share of a frame: fill a scratch buffer and submit.
fn record_worker(gr: &GrManager, scratch: &Arc<Buffer>) -> strata_gpu::Result<()> {
    let mut cmdb = gr.new_command_buffer(&CommandBufferInitInfo::Primary)?;
    cmdb.fill_buffer(scratch, 0, scratch.size(), gr.frame() as u32);
    cmdb.end()?;
    gr.submit(cmdb, &SubmitInfo::default())?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let frames = parse_arg(1, 600)?;
    let workers = parse_arg(2, 4)?;

    let config = GrConfig::new()
        .with_app_name("strata-soak")
        .with_transient(TransientMemoryConfig {
            transfer_per_frame: UPLOAD_SIZE * 3 / 2,
            ..TransientMemoryConfig::default()
        });
    let gr = Arc::new(GrManager::new(config).context("GPU initialization failed")?);
    let loader = AsyncLoader::new(gr.clone())?;

    let scratch: Vec<Arc<Buffer>> = (0..workers)
        .map(|i| {
            gr.new_buffer(
                &BufferInitInfo::new(64 * 1024, BufferUsage::TRANSFER_DESTINATION, BufferMapAccess::empty())
                    .with_name(format!("scratch {i}")),
            )
        })
        .collect::<strata_gpu::Result<_>>()?;

    info!("Soaking {frames} frames with {workers} recording workers");
    let start = Instant::now();
    let mut report = Instant::now();

    for frame in 0..frames {
        gr.begin_frame()?;

        for i in 0..UPLOADS_PER_FRAME {
            let target = gr.new_buffer(
                &BufferInitInfo::new(
                    UPLOAD_SIZE,
                    BufferUsage::TRANSFER_DESTINATION | BufferUsage::STORAGE_COMPUTE_READ,
                    BufferMapAccess::empty(),
                )
                .with_name("upload target"),
            )?;
            loader.submit(UploadTask {
                name: format!("upload {frame}.{i}"),
                target,
                seed: frame as u8,
            });
        }

        scratch
            .par_iter()
            .try_for_each(|buffer| record_worker(&gr, buffer))?;

        gr.end_frame()?;

        if report.elapsed().as_secs() >= 1 {
            info!(
                "frame {frame}: {:.1} fps, loader {} done / {} pending / {} retries, {} objects awaiting destruction",
                frame as f64 / start.elapsed().as_secs_f64(),
                loader.completed(),
                loader.pending(),
                loader.retries(),
                gr.context().pending_garbage()
            );
            report = Instant::now();
        }
    }

    // Keep frames going until the loader drains.
    while loader.pending() > 0 {
        gr.begin_frame()?;
        gr.end_frame()?;
    }
    gr.finish()?;

    info!(
        "Soak finished: {frames} frames in {:.2}s, {} uploads, {} failed, {} retries",
        start.elapsed().as_secs_f64(),
        loader.completed(),
        loader.failed(),
        loader.retries()
    );
    Ok(())
}
