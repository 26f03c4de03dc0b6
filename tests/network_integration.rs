//! Integration tests against a real Vulkan device
//!
//! These tests require a Vulkan-capable GPU plus the compiled operator
//! shaders in `shaders/` and are marked #[ignore] by default.
//! Run with: cargo test -- --ignored

use std::path::Path;
use std::sync::Arc;

use vknet::ash::vk;
use vknet::{
    ops, Buffer, BufferView, Context, DataShape, MemorySource, Network, NetworkSpec, NnError,
    OperatorModules, Residency, SequentialSource, WeightVec,
};

const SHADER_DIR: &str = "shaders";

fn test_context() -> Arc<Context> {
    Arc::new(Context::new(0, false).expect("Failed to initialize Vulkan context"))
}

fn load_modules(ctx: &Context) -> OperatorModules {
    OperatorModules::load(ctx, Path::new(SHADER_DIR)).expect("Failed to load operator shaders")
}

/// Four-class dataset where one image quadrant is lit per class.
fn quadrant_dataset(shape: &DataShape, count: u32) -> (Vec<f32>, Vec<f32>) {
    let mut images = Vec::new();
    let mut labels = Vec::new();
    for n in 0..count {
        let class = n % shape.label_width;
        for y in 0..shape.image_height {
            for x in 0..shape.image_width {
                let quadrant =
                    (y * 2 / shape.image_height) * 2 + (x * 2 / shape.image_width);
                images.push(if quadrant == class % 4 { 1.0 } else { 0.05 });
            }
        }
        for c in 0..shape.label_width {
            labels.push(if c == class { 1.0 } else { 0.0 });
        }
    }
    (images, labels)
}

fn quadrant_shape() -> DataShape {
    DataShape {
        image_width: 8,
        image_height: 8,
        image_channel: 1,
        label_width: 4,
    }
}

fn build_network(ctx: &Arc<Context>, spec: &NetworkSpec, batch_size: u32) -> Network {
    let mods = load_modules(ctx);
    let shape = quadrant_shape();
    let (images, labels) = quadrant_dataset(&shape, 256);
    let train = MemorySource::with_seed(ctx, shape, images.clone(), labels.clone(), batch_size, 11)
        .expect("Failed to create training source");
    let eval = SequentialSource::new(ctx, shape, images, labels, batch_size)
        .expect("Failed to create evaluation source");
    Network::build(
        ctx.clone(),
        &mods,
        Box::new(train),
        Box::new(eval),
        spec,
        batch_size,
        false,
    )
    .expect("Failed to build network")
}

#[test]
#[ignore] // Requires GPU
fn test_context_creation() {
    let ctx = test_context();
    assert!(!ctx.device_name().is_empty());
    let limits = ctx.limits();
    assert!(limits.subgroup_size > 0);
    assert!(limits.max_group_size[0] > 0);
    println!("GPU: {} (subgroup {})", ctx.device_name(), limits.subgroup_size);
}

#[test]
#[ignore] // Requires GPU
fn test_build_rejects_label_width_mismatch() {
    let ctx = test_context();
    let mods = load_modules(&ctx);
    let shape = quadrant_shape();
    let (images, labels) = quadrant_dataset(&shape, 32);
    let train = MemorySource::with_seed(&ctx, shape, images.clone(), labels.clone(), 8, 1).unwrap();
    let eval = SequentialSource::new(&ctx, shape, images, labels, 8).unwrap();

    // Final layer is 5 wide but labels are 4 wide
    let spec = NetworkSpec::simple(16, 5);
    let result = Network::build(
        ctx.clone(),
        &mods,
        Box::new(train),
        Box::new(eval),
        &spec,
        8,
        false,
    );
    assert!(matches!(result, Err(NnError::InvalidDataLength)));
}

#[test]
#[ignore] // Requires GPU
fn test_factory_rejects_mismatched_views() {
    let ctx = test_context();
    let mods = load_modules(&ctx);
    let batch = 4u32;
    let storage = vk::BufferUsageFlags::STORAGE_BUFFER;
    let device_buffer = |len: usize| {
        BufferView::whole(
            Buffer::<f32>::new(&ctx, len, storage, Residency::DeviceOnly)
                .expect("Failed to create buffer"),
        )
    };

    let input = device_buffer(16 * batch as usize);
    // One element short of 8 outputs per batch row
    let output = device_buffer(8 * batch as usize - 1);
    let weight = BufferView::whole(
        Buffer::<WeightVec>::new(&ctx, 16 * 8, storage, Residency::DeviceOnly)
            .expect("Failed to create weight buffer"),
    );

    let result = ops::affine::forward(&ctx, &mods.affine_forward, &input, &output, &weight, batch);
    assert!(matches!(result, Err(NnError::InvalidDataLength)));
}

#[test]
#[ignore] // Requires GPU
fn test_dump_restore_round_trip() {
    let ctx = test_context();
    let net = build_network(&ctx, &NetworkSpec::simple(32, 4), 8);
    net.init().expect("init failed");

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let first = dir.path().join("weights_a.vkn");
    let second = dir.path().join("weights_b.vkn");

    net.dump(&first).expect("dump failed");
    net.restore(&first).expect("restore failed");
    net.dump(&second).expect("second dump failed");

    let a = std::fs::read(&first).unwrap();
    let b = std::fs::read(&second).unwrap();
    assert_eq!(a, b, "weights changed across a dump/restore round trip");
}

#[test]
#[ignore] // Requires GPU
fn test_restore_missing_file() {
    let ctx = test_context();
    let net = build_network(&ctx, &NetworkSpec::simple(32, 4), 8);
    let result = net.restore(Path::new("/nonexistent/weights.vkn"));
    assert!(matches!(result, Err(NnError::UnableToLoadFile(_))));
}

#[test]
#[ignore] // Requires GPU
fn test_corrupted_restore_leaves_weights_untouched() {
    let ctx = test_context();
    let net = build_network(&ctx, &NetworkSpec::simple(32, 4), 8);
    net.init().expect("init failed");

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let good = dir.path().join("good.vkn");
    let bad = dir.path().join("bad.vkn");
    net.dump(&good).expect("dump failed");

    // Flip one payload byte so the checksum no longer matches
    let mut bytes = std::fs::read(&good).unwrap();
    bytes[0] ^= 0xFF;
    std::fs::write(&bad, &bytes).unwrap();

    let result = net.restore(&bad);
    assert!(matches!(result, Err(NnError::CorruptedFile)));

    // Device weights must still hold the original values
    let after = dir.path().join("after.vkn");
    net.dump(&after).expect("dump failed");
    assert_eq!(std::fs::read(&good).unwrap(), std::fs::read(&after).unwrap());
}

#[test]
#[ignore] // Requires GPU
fn test_truncated_restore_is_unloadable() {
    let ctx = test_context();
    let net = build_network(&ctx, &NetworkSpec::simple(32, 4), 8);
    net.init().expect("init failed");

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let full = dir.path().join("full.vkn");
    let short = dir.path().join("short.vkn");
    net.dump(&full).expect("dump failed");

    let bytes = std::fs::read(&full).unwrap();
    std::fs::write(&short, &bytes[..bytes.len() / 2]).unwrap();

    assert!(matches!(
        net.restore(&short),
        Err(NnError::UnableToLoadFile(_))
    ));
}

#[test]
#[ignore] // Requires GPU
fn test_train_slots_are_equivalent() {
    let ctx = test_context();
    let mods = load_modules(&ctx);
    let shape = quadrant_shape();
    // One example, so every batch in either slot holds the same data
    let (images, labels) = quadrant_dataset(&shape, 1);
    let train = MemorySource::with_seed(&ctx, shape, images.clone(), labels.clone(), 8, 3).unwrap();
    let eval = SequentialSource::new(&ctx, shape, images, labels, 8).unwrap();
    let mut net = Network::build(
        ctx.clone(),
        &mods,
        Box::new(train),
        Box::new(eval),
        &NetworkSpec::simple(32, 4),
        8,
        false,
    )
    .expect("Failed to build network");
    net.init().expect("init failed");

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let snapshot = dir.path().join("snapshot.vkn");
    net.dump(&snapshot).expect("dump failed");

    // First step runs the slot-0 sequence; after the weight rollback the
    // second step runs the slot-1 sequence over the same data and weights
    let loss_slot0 = net.step().expect("slot 0 step failed");
    net.restore(&snapshot).expect("restore failed");
    let loss_slot1 = net.step().expect("slot 1 step failed");

    assert!(
        (loss_slot0 - loss_slot1).abs() <= 1e-4 * loss_slot0.abs().max(1.0),
        "slot sequences disagree: {} vs {}",
        loss_slot0,
        loss_slot1
    );
}

#[test]
#[ignore] // Requires GPU
fn test_affine_training_reduces_loss() {
    let ctx = test_context();
    let mut net = build_network(&ctx, &NetworkSpec::simple(32, 4), 16);
    net.init().expect("init failed");

    let mut first = 0.0;
    let mut last = 0.0;
    for step in 0..200 {
        let loss = net.step().expect("training step failed");
        assert!(loss.is_finite(), "loss diverged at step {}", step);
        if step < 10 {
            first += loss;
        }
        if step >= 190 {
            last += loss;
        }
    }
    assert!(
        last < first,
        "mean loss did not descend: first {:.5} last {:.5}",
        first / 10.0,
        last / 10.0
    );

    let (train_acc, eval_acc) = net.evaluate().expect("evaluate failed");
    assert!((0.0..=1.0).contains(&train_acc));
    assert!((0.0..=1.0).contains(&eval_acc));
    // The quadrant task is separable; a trained net beats chance
    assert!(train_acc > 0.25, "train accuracy stuck at {:.3}", train_acc);
}

#[test]
#[ignore] // Requires GPU
fn test_conv_network_trains() {
    let ctx = test_context();
    let mut net = build_network(&ctx, &NetworkSpec::conv(4, 32, 4), 8);
    net.init().expect("init failed");

    for step in 0..50 {
        let loss = net.step().expect("training step failed");
        assert!(loss.is_finite(), "loss diverged at step {}", step);
    }
    let (train_acc, eval_acc) = net.evaluate().expect("evaluate failed");
    assert!((0.0..=1.0).contains(&train_acc));
    assert!((0.0..=1.0).contains(&eval_acc));
}

#[test]
#[ignore] // Requires GPU
fn test_debug_mode_scans_each_step() {
    // Debug mode allocates host-readable intermediates and scans them
    // for non-finite values as part of every step
    let ctx = test_context();
    let mods = load_modules(&ctx);
    let shape = quadrant_shape();
    let (images, labels) = quadrant_dataset(&shape, 64);
    let train = MemorySource::with_seed(&ctx, shape, images.clone(), labels.clone(), 8, 5).unwrap();
    let eval = SequentialSource::new(&ctx, shape, images, labels, 8).unwrap();
    let mut net = Network::build(
        ctx.clone(),
        &mods,
        Box::new(train),
        Box::new(eval),
        &NetworkSpec::simple(16, 4),
        8,
        true,
    )
    .expect("Failed to build network");
    net.init().expect("init failed");

    for step in 0..5 {
        let loss = net.step().expect("debug step failed");
        assert!(loss.is_finite(), "loss diverged at step {}", step);
    }
}
