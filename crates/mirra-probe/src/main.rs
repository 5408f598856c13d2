//! Headless round trip through a real adapter: edit a mirrored buffer, flush
//! it once, and compare the device copy against the host image.

use anyhow::{Context, Result, bail};
use mirra_engine::buffer::{BufferDesc, Field, FlushScheduler, MirroredBuffer};
use mirra_engine::device::{Gpu, GpuInit};
use mirra_engine::logging::{LoggingConfig, init_logging};

const SIZE: u64 = 64;
const INTENSITY: Field<f32> = Field::at(0);
const RADIUS: Field<f32> = Field::at(32);

fn main() -> Result<()> {
    let verbose = std::env::args().any(|arg| arg == "--trace");
    init_logging(if verbose {
        LoggingConfig::trace_transfers()
    } else {
        LoggingConfig::default()
    });

    let gpu = pollster::block_on(Gpu::new(GpuInit::default()))
        .context("no usable GPU adapter")?;
    let info = gpu.adapter_info();
    log::info!("adapter: {} ({:?})", info.name, info.backend);

    pollster::block_on(probe(&gpu))
}

async fn probe(gpu: &Gpu) -> Result<()> {
    let scheduler = FlushScheduler::new();
    let usage = wgpu::BufferUsages::STORAGE
        | wgpu::BufferUsages::COPY_DST
        | wgpu::BufferUsages::COPY_SRC;
    let mirror = MirroredBuffer::new(
        gpu.buffer_device(),
        &scheduler,
        &BufferDesc::blank("probe", usage, SIZE),
    )?;

    mirror.set(&INTENSITY, 1.0)?;
    mirror.set(&RADIUS, 2.0)?;
    log::info!(
        "pending flushes: {}, dirty bytes: {:?}",
        scheduler.pending(),
        mirror.dirty_range()
    );

    let flushed = scheduler.run().await?;
    log::info!("flushed {flushed} mirror(s)");

    let device = mirror.read_device().await?;
    let intensity = mirror.get(&INTENSITY)?;
    let radius = mirror.get(&RADIUS)?;
    let expected = [intensity.to_ne_bytes(), radius.to_ne_bytes()];
    if device[0..4] != expected[0] || device[32..36] != expected[1] {
        bail!("device copy diverged from host mirror: {device:?}");
    }

    log::info!("device copy matches host mirror (intensity={intensity}, radius={radius})");
    Ok(())
}
