//! Device-backed tests. Each returns early when no Vulkan device is present.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strata_gpu::barrier::compute_layout;
use strata_gpu::{
    AsyncLoader, BufferInitInfo, BufferMapAccess, BufferUsage, CommandBufferInitInfo,
    ComponentFormat, ComputePipelineInfo, GpuError, GrManager, PipelineKind, PixelFormat,
    RenderPassKey, SubmitInfo, TaskOutcome,
    TextureInitInfo, TextureSurfaceInfo, TextureType, TextureUsage, TransformFormat,
    TransientUsage, MAX_FRAMES_IN_FLIGHT,
};
use strata_test::harness::{expect_bytes, wait};
use strata_test::HeadlessGpu;

use ash::vk;

const RGBA8: PixelFormat = PixelFormat::new(ComponentFormat::R8G8B8A8, TransformFormat::Unorm);

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

#[test]
fn mapped_buffer_copies_into_gpu_only_buffer() {
    let Some(gpu) = HeadlessGpu::try_new("mapped_buffer_copies_into_gpu_only_buffer") else {
        return;
    };
    let gr = gpu.gr();
    let data = pattern(256);

    let staging = gr
        .new_buffer(
            &BufferInitInfo::new(
                256,
                BufferUsage::VERTEX | BufferUsage::TRANSFER_SOURCE | BufferUsage::TRANSFER_DESTINATION,
                BufferMapAccess::WRITE,
            )
            .with_name("staging"),
        )
        .unwrap();
    let mut mapping = staging.map(0, 256, BufferMapAccess::WRITE).unwrap();
    mapping.write(&data);
    mapping.unmap().unwrap();

    let device_local = gr
        .new_buffer(
            &BufferInitInfo::new(
                256,
                BufferUsage::VERTEX | BufferUsage::TRANSFER_DESTINATION | BufferUsage::TRANSFER_SOURCE,
                BufferMapAccess::empty(),
            )
            .with_name("device local"),
        )
        .unwrap();

    let mut cmdb = gr.new_command_buffer(&CommandBufferInitInfo::Primary).unwrap();
    cmdb.copy_buffer_to_buffer(&staging, 0, &device_local, 0, 256);
    cmdb.set_buffer_barrier(
        &device_local,
        BufferUsage::TRANSFER_DESTINATION,
        BufferUsage::TRANSFER_SOURCE,
        0,
        256,
    )
    .unwrap();
    cmdb.end().unwrap();
    let fence = gr.submit(cmdb, &SubmitInfo::default()).unwrap();
    wait(&fence).unwrap();

    let read = gpu.read_buffer(&device_local, 256).unwrap();
    expect_bytes(&read, &data).unwrap();
}

#[test]
fn transient_upload_reaches_buffer() {
    let Some(gpu) = HeadlessGpu::try_new("transient_upload_reaches_buffer") else {
        return;
    };
    let gr = gpu.gr();
    let data = pattern(1000);

    let mut memory = gr
        .allocate_frame_transient_memory(data.len() as u64, TransientUsage::Transfer)
        .unwrap();
    memory.copy_from_slice(&data);
    let token = memory.token();
    drop(memory);

    let dst = gr
        .new_buffer(&BufferInitInfo::new(
            1000,
            BufferUsage::STORAGE_COMPUTE_READ
                | BufferUsage::TRANSFER_DESTINATION
                | BufferUsage::TRANSFER_SOURCE,
            BufferMapAccess::empty(),
        ))
        .unwrap();

    let mut cmdb = gr.new_command_buffer(&CommandBufferInitInfo::Primary).unwrap();
    cmdb.copy_transient_to_buffer(&token, &dst, 0);
    cmdb.set_buffer_barrier(
        &dst,
        BufferUsage::TRANSFER_DESTINATION,
        BufferUsage::TRANSFER_SOURCE,
        0,
        1000,
    )
    .unwrap();
    cmdb.end().unwrap();
    let fence = gr.submit(cmdb, &SubmitInfo::default()).unwrap();
    wait(&fence).unwrap();

    expect_bytes(&gpu.read_buffer(&dst, 1000).unwrap(), &data).unwrap();
}

#[test]
fn render_pass_cache_creates_once_under_race() {
    let Some(gpu) = HeadlessGpu::try_new("render_pass_cache_creates_once_under_race") else {
        return;
    };
    let gr = gpu.gr();
    let depth = PixelFormat::new(ComponentFormat::D32, TransformFormat::Float);
    let key = RenderPassKey::new(&[RGBA8, RGBA8], depth).unwrap();
    let before = gr.render_pass_cache().len();

    let handles: Vec<vk::RenderPass> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..2)
            .map(|_| scope.spawn(|| gr.render_pass_cache().get_or_create_compatible(&key).unwrap()))
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(handles[0], handles[1]);
    assert_ne!(handles[0], vk::RenderPass::null());
    assert_eq!(gr.render_pass_cache().len(), before + 1);
}

#[test]
fn frame_past_the_limit_waits_for_oldest_frame() {
    let Some(gpu) = HeadlessGpu::try_new("frame_past_the_limit_waits_for_oldest_frame") else {
        return;
    };
    let gr = gpu.gr();
    let mut fences = Vec::new();

    for frame in 0..=MAX_FRAMES_IN_FLIGHT as u64 + 2 {
        assert_eq!(gr.frame(), frame);
        gr.begin_frame().unwrap();

        let mut cmdb = gr.new_command_buffer(&CommandBufferInitInfo::Primary).unwrap();
        cmdb.end().unwrap();
        fences.push(gr.submit(cmdb, &SubmitInfo::default()).unwrap());
        assert!(gr.frames_in_flight() <= MAX_FRAMES_IN_FLIGHT);

        gr.end_frame().unwrap();

        // The slot the next frame reuses must have retired.
        if let Some(oldest) = (frame + 1).checked_sub(MAX_FRAMES_IN_FLIGHT as u64) {
            assert!(fences[oldest as usize].is_done().unwrap());
        }
    }
}

#[test]
fn mip_generation_layouts_alternate() {
    assert_eq!(
        compute_layout(TextureUsage::GENERATE_MIPMAPS, false, 0, 4).unwrap(),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL
    );
    assert_eq!(
        compute_layout(TextureUsage::GENERATE_MIPMAPS, false, 3, 4).unwrap(),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL
    );
}

#[test]
fn texture_upload_and_mip_generation() {
    let Some(gpu) = HeadlessGpu::try_new("texture_upload_and_mip_generation") else {
        return;
    };
    let gr = gpu.gr();

    let texture = gr
        .new_texture(&TextureInitInfo {
            name: "mipmapped".to_string(),
            texture_type: TextureType::Texture2D,
            width: 16,
            height: 16,
            mipmap_count: 5,
            format: RGBA8,
            usage: TextureUsage::UPLOAD
                | TextureUsage::GENERATE_MIPMAPS
                | TextureUsage::FRAGMENT_SHADER_SAMPLED,
            initial_usage: TextureUsage::UPLOAD,
            ..TextureInitInfo::default()
        })
        .unwrap();

    let size = RGBA8.surface_size(16, 16);
    let mut memory = gr
        .allocate_frame_transient_memory(size, TransientUsage::Transfer)
        .unwrap();
    memory.fill(0x80);
    let token = memory.token();
    drop(memory);

    let mut cmdb = gr.new_command_buffer(&CommandBufferInitInfo::Primary).unwrap();
    cmdb.copy_buffer_to_texture_surface(&token, &texture, &TextureSurfaceInfo::default())
        .unwrap();
    cmdb.set_texture_barrier(&texture, TextureUsage::UPLOAD, TextureUsage::GENERATE_MIPMAPS)
        .unwrap();
    cmdb.generate_mipmaps(&texture, 0, 0).unwrap();
    cmdb.set_texture_barrier(
        &texture,
        TextureUsage::GENERATE_MIPMAPS,
        TextureUsage::FRAGMENT_SHADER_SAMPLED,
    )
    .unwrap();
    cmdb.end().unwrap();
    let fence = gr.submit(cmdb, &SubmitInfo::default()).unwrap();
    wait(&fence).unwrap();

    assert_eq!(texture.level_extent(4), (1, 1));
}

#[test]
fn transient_exhaustion_is_retryable_until_a_frame_retires() {
    let Some(gpu) = HeadlessGpu::try_new("transient_exhaustion_is_retryable_until_a_frame_retires")
    else {
        return;
    };
    let gr = gpu.gr();
    let budget = HeadlessGpu::config().transient.transfer_per_frame;

    let first = gr
        .allocate_frame_transient_memory(budget / 2, TransientUsage::Transfer)
        .unwrap()
        .token();
    let err = gr
        .allocate_frame_transient_memory(budget, TransientUsage::Transfer)
        .unwrap_err();
    assert!(err.is_retryable(), "{err}");
    assert!(matches!(err, GpuError::OutOfTransientMemory { .. }));

    // Allocations of one frame never overlap.
    let second = gr
        .allocate_frame_transient_memory(budget / 4, TransientUsage::Transfer)
        .unwrap()
        .token();
    assert!(second.offset >= first.offset + first.range);

    gpu.run_frames(1).unwrap();
    assert!(gr
        .allocate_frame_transient_memory(budget, TransientUsage::Transfer)
        .is_ok());
}

#[test]
fn transient_requests_that_never_fit_are_not_retryable() {
    let Some(gpu) = HeadlessGpu::try_new("transient_requests_that_never_fit_are_not_retryable")
    else {
        return;
    };
    let gr = gpu.gr();
    let per_frame = HeadlessGpu::config().transient.transfer_per_frame;

    let empty = gr
        .allocate_frame_transient_memory(0, TransientUsage::Transfer)
        .unwrap_err();
    assert!(matches!(empty, GpuError::InvalidState(_)), "{empty}");
    assert!(!empty.is_retryable());

    let huge = gr
        .allocate_frame_transient_memory(u64::MAX, TransientUsage::Transfer)
        .unwrap_err();
    assert!(!huge.is_retryable(), "{huge}");

    let oversized = gr
        .allocate_frame_transient_memory(per_frame * 4, TransientUsage::Transfer)
        .unwrap_err();
    assert!(!oversized.is_retryable(), "{oversized}");
}

#[test]
fn transient_allocation_holds_the_frame_open() {
    let Some(gpu) = HeadlessGpu::try_new("transient_allocation_holds_the_frame_open") else {
        return;
    };
    let gr = gpu.gr();
    let mut memory = gr
        .allocate_frame_transient_memory(64, TransientUsage::Transfer)
        .unwrap();
    assert_eq!(memory.token().generation, 0);

    std::thread::scope(|s| {
        let ender = s.spawn(|| gr.end_frame());
        std::thread::sleep(std::time::Duration::from_millis(50));
        // The frame cannot end while its memory is still writable.
        assert_eq!(gr.frame(), 0);
        memory.fill(1);
        drop(memory);
        ender.join().unwrap().unwrap();
    });
    assert_eq!(gr.frame(), 1);
}

#[test]
fn mapping_past_the_end_fails() {
    let Some(gpu) = HeadlessGpu::try_new("mapping_past_the_end_fails") else {
        return;
    };
    let gr = gpu.gr();
    let buffer = gr
        .new_buffer(&BufferInitInfo::new(
            64,
            BufferUsage::TRANSFER_SOURCE,
            BufferMapAccess::WRITE,
        ))
        .unwrap();

    assert!(matches!(
        buffer.map(32, 64, BufferMapAccess::WRITE),
        Err(GpuError::InvalidState(_))
    ));
    assert!(buffer.map(u64::MAX, 2, BufferMapAccess::WRITE).is_err());

    // A rejected range leaves the buffer mappable.
    let mapping = buffer.map(0, 64, BufferMapAccess::WRITE).unwrap();
    drop(mapping);
}

/// `main` compute shader with a 1x1x1 local size and an empty body.
#[rustfmt::skip]
const EMPTY_COMPUTE_SPIRV: &[u32] = &[
    0x0723_0203, 0x0001_0000, 0, 5, 0,
    0x0002_0011, 1,
    0x0003_000E, 0, 1,
    0x0005_000F, 5, 1, 0x6E69_616D, 0,
    0x0006_0010, 1, 17, 1, 1, 1,
    0x0002_0013, 2,
    0x0003_0021, 3, 2,
    0x0005_0036, 2, 1, 0, 3,
    0x0002_00F8, 4,
    0x0001_00FD,
    0x0001_0038,
];

#[test]
fn compute_pipeline_dispatches() {
    let Some(gpu) = HeadlessGpu::try_new("compute_pipeline_dispatches") else {
        return;
    };
    let gr = gpu.gr();
    let pipeline = gr
        .new_compute_pipeline(&ComputePipelineInfo {
            name: "empty".to_string(),
            shader: EMPTY_COMPUTE_SPIRV.to_vec(),
        })
        .unwrap();
    assert_eq!(pipeline.kind(), PipelineKind::Compute);

    let mut cmdb = gr.new_command_buffer(&CommandBufferInitInfo::Primary).unwrap();
    cmdb.bind_pipeline(&pipeline);
    cmdb.dispatch(1, 1, 1);
    cmdb.end().unwrap();
    let fence = gr.submit(cmdb, &SubmitInfo::default()).unwrap();
    wait(&fence).unwrap();
}

#[test]
fn dropped_buffer_is_destroyed_after_its_frame_retires() {
    let Some(gpu) = HeadlessGpu::try_new("dropped_buffer_is_destroyed_after_its_frame_retires")
    else {
        return;
    };
    let gr = gpu.gr();
    let baseline = gr.context().pending_garbage();

    let buffer = gr
        .new_buffer(&BufferInitInfo::new(
            64,
            BufferUsage::TRANSFER_DESTINATION,
            BufferMapAccess::empty(),
        ))
        .unwrap();
    let mut cmdb = gr.new_command_buffer(&CommandBufferInitInfo::Primary).unwrap();
    cmdb.fill_buffer(&buffer, 0, 64, 0xdead_beef);
    cmdb.end().unwrap();
    gr.submit(cmdb, &SubmitInfo::default()).unwrap();

    // The submitted command buffer keeps the buffer alive.
    drop(buffer);
    assert_eq!(gr.context().pending_garbage(), baseline);

    gpu.run_frames(2 * MAX_FRAMES_IN_FLIGHT + 1).unwrap();
    assert_eq!(gr.context().pending_garbage(), 0);
}

#[test]
fn fill_buffer_repeats_the_value() {
    let Some(gpu) = HeadlessGpu::try_new("fill_buffer_repeats_the_value") else {
        return;
    };
    let gr = gpu.gr();
    let buffer = gr
        .new_buffer(&BufferInitInfo::new(
            64,
            BufferUsage::TRANSFER_DESTINATION | BufferUsage::TRANSFER_SOURCE,
            BufferMapAccess::empty(),
        ))
        .unwrap();

    let mut cmdb = gr.new_command_buffer(&CommandBufferInitInfo::Primary).unwrap();
    cmdb.fill_buffer(&buffer, 0, 64, 0xdead_beef);
    cmdb.set_buffer_barrier(
        &buffer,
        BufferUsage::TRANSFER_DESTINATION,
        BufferUsage::TRANSFER_SOURCE,
        0,
        64,
    )
    .unwrap();
    cmdb.end().unwrap();
    wait(&gr.submit(cmdb, &SubmitInfo::default()).unwrap()).unwrap();

    let values: Vec<u32> = gpu.read_pod(&buffer, 16).unwrap();
    assert!(values.iter().all(|&v| v == 0xdead_beef), "{values:x?}");
}

#[test]
fn command_buffers_record_on_many_threads() {
    let Some(gpu) = HeadlessGpu::try_new("command_buffers_record_on_many_threads") else {
        return;
    };
    let gr = gpu.gr();

    for _ in 0..MAX_FRAMES_IN_FLIGHT + 1 {
        gr.begin_frame().unwrap();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let buffer = gr
                        .new_buffer(&BufferInitInfo::new(
                            256,
                            BufferUsage::TRANSFER_DESTINATION,
                            BufferMapAccess::empty(),
                        ))
                        .unwrap();
                    let mut cmdb = gr.new_command_buffer(&CommandBufferInitInfo::Primary).unwrap();
                    cmdb.fill_buffer(&buffer, 0, 256, 7);
                    cmdb.end().unwrap();
                    gr.submit(cmdb, &SubmitInfo::default()).unwrap();
                });
            }
        });
        gr.end_frame().unwrap();
    }
    gr.finish().unwrap();
}

#[test]
fn loader_resumes_retried_task_after_next_frame() {
    let Some(gpu) = HeadlessGpu::try_new("loader_resumes_retried_task_after_next_frame") else {
        return;
    };
    let loader = AsyncLoader::new(gpu.shared()).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    {
        let runs = runs.clone();
        loader.submit(move |_: &GrManager| -> strata_gpu::Result<TaskOutcome> {
            if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(TaskOutcome::Retry)
            } else {
                Ok(TaskOutcome::Done)
            }
        });
    }
    loader.submit(|_: &GrManager| -> strata_gpu::Result<TaskOutcome> {
        Err(GpuError::InvalidState("broken asset".to_string()))
    });

    for _ in 0..1000 {
        if loader.pending() == 0 {
            break;
        }
        gpu.run_frames(1).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    loader.wait_idle();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(loader.completed(), 1);
    assert_eq!(loader.failed(), 1);
    assert!(loader.retries() >= 1);
}
