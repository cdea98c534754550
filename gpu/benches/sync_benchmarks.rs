use std::sync::Arc;
use std::time::Duration;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use redlilium_gpu::{
    BlitParams, BufferDescriptor, BufferUsage, ClearColor, DeviceParameters, DummyDriver,
    GpuDevice, QueueFamilies, Texture, TextureDescriptor, TextureFormat, TextureRegion,
    TextureUpload, TextureUsage, UploadSource,
};

fn device(families: QueueFamilies) -> (Arc<DummyDriver>, Arc<GpuDevice>) {
    let driver = Arc::new(DummyDriver::with_families(families));
    let device = GpuDevice::new(
        driver.clone(),
        Arc::new(driver.allocator()),
        DeviceParameters::new(),
    );
    (driver, device)
}

fn distinct() -> QueueFamilies {
    QueueFamilies {
        graphics: 0,
        compute: 1,
        transfer: 2,
    }
}

fn texture(device: &GpuDevice, size: u32, usage: TextureUsage) -> Arc<Texture> {
    device
        .create_texture(&TextureDescriptor::new_2d(
            size,
            size,
            TextureFormat::Rgba8Unorm,
            usage,
        ))
        .expect("Failed to create texture")
}

// ---------------------------------------------------------------------------
// Batched recording
// ---------------------------------------------------------------------------

fn bench_clear_batched(c: &mut Criterion) {
    let (_driver, device) = device(QueueFamilies::unified(0));
    let textures: Vec<_> = (0..16)
        .map(|_| texture(&device, 16, TextureUsage::COPY_DST))
        .collect();

    c.bench_function("clear_16_textures_one_command", |b| {
        b.iter(|| {
            for texture in &textures {
                device
                    .clear_texture(texture, ClearColor::TRANSPARENT)
                    .expect("Failed to clear");
            }
            device.flush().expect("Failed to flush");
            black_box(device.poll_commands(Duration::ZERO).expect("Failed to poll"));
        });
    });
}

fn bench_buffer_writes(c: &mut Criterion) {
    let (_driver, device) = device(QueueFamilies::unified(0));
    let buffer = device
        .create_buffer(&BufferDescriptor::new(4096, BufferUsage::COPY_DST))
        .expect("Failed to create buffer");
    let data = vec![7u8; 256];

    c.bench_function("write_buffer_16_updates", |b| {
        b.iter(|| {
            for i in 0..16 {
                device
                    .write_buffer(&buffer, i * 256, black_box(&data))
                    .expect("Failed to write");
            }
            device.flush().expect("Failed to flush");
            device.poll_commands(Duration::ZERO).expect("Failed to poll");
        });
    });
}

// ---------------------------------------------------------------------------
// Queue family switches
// ---------------------------------------------------------------------------

fn bench_upload_then_blit(c: &mut Criterion) {
    let (_driver, device) = device(distinct());
    let src = texture(&device, 32, TextureUsage::COPY_SRC | TextureUsage::COPY_DST);
    let dst = texture(&device, 32, TextureUsage::COPY_DST);
    let data = vec![0x5au8; 32 * 32 * 4];

    c.bench_function("upload_transfer_blit_graphics", |b| {
        b.iter(|| {
            device
                .upload_texture(
                    &src,
                    &TextureUpload {
                        region: TextureRegion::full(src.size()),
                        source: UploadSource::Host(&data),
                    },
                )
                .expect("Failed to upload");
            device
                .blit(&BlitParams::full(&src, &dst))
                .expect("Failed to blit");
            device.flush().expect("Failed to flush");
            device.poll_commands(Duration::ZERO).expect("Failed to poll");
        });
    });
}

// ---------------------------------------------------------------------------
// Export cycle
// ---------------------------------------------------------------------------

fn bench_export_cycle(c: &mut Criterion) {
    let (driver, device) = device(QueueFamilies::unified(0));
    let texture = device
        .create_texture(
            &TextureDescriptor::new_2d(16, 16, TextureFormat::Rgba8Unorm, TextureUsage::COPY_DST)
                .exportable(),
        )
        .expect("Failed to create texture");

    c.bench_function("export_import_reuse", |b| {
        b.iter(|| {
            let sync = device.export_texture(&texture).expect("Failed to export");
            driver.wait_external(sync.wait_semaphore());
            sync.mark_imported();
            driver.signal_external(sync.signal_semaphore());
            device
                .clear_texture(&texture, ClearColor::TRANSPARENT)
                .expect("Failed to clear");
            device.flush().expect("Failed to flush");
            device.poll_commands(Duration::ZERO).expect("Failed to poll");
        });
    });
}

criterion_group!(
    benches,
    bench_clear_batched,
    bench_buffer_writes,
    bench_upload_then_blit,
    bench_export_cycle,
);
criterion_main!(benches);
