//! Training harness for vknet networks
//!
//! Loads a dataset from raw f32 files (or generates a synthetic one),
//! builds an affine or convolutional network, and runs the alternating
//! two-slot training loop with periodic accuracy evaluation. Weights are
//! restored from the dump file when one exists and written back when
//! training ends.

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use vknet::{
    mnist, Context, DataShape, MemorySource, Network, NetworkSpec, NnError, OperatorModules,
    SequentialSource,
};

#[derive(Parser)]
#[command(name = "vknet-train")]
#[command(version)]
#[command(about = "Train a neural network on the GPU via Vulkan compute")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available Vulkan devices
    Devices,
    /// Run the training loop
    Train {
        /// Physical device index
        #[arg(long, default_value_t = 0)]
        device: usize,

        /// Enable the Khronos validation layer
        #[arg(long)]
        validation: bool,

        /// Directory holding the compiled operator shaders
        #[arg(long, default_value = "shaders")]
        shader_dir: PathBuf,

        /// Weight dump file, restored at start when present
        #[arg(long, default_value = "weights.vkn")]
        weights: PathBuf,

        /// Training images, raw little-endian f32
        #[arg(long, requires = "labels", conflicts_with = "mnist_images")]
        images: Option<PathBuf>,

        /// Training labels, raw little-endian f32, one-hot rows
        #[arg(long, requires = "images")]
        labels: Option<PathBuf>,

        /// MNIST idx3 image file; shape flags are taken from the header
        #[arg(long, requires = "mnist_labels")]
        mnist_images: Option<PathBuf>,

        /// MNIST idx1 label file
        #[arg(long, requires = "mnist_images")]
        mnist_labels: Option<PathBuf>,

        /// MNIST evaluation split
        #[arg(long, requires = "mnist_eval_labels")]
        mnist_eval_images: Option<PathBuf>,

        /// MNIST evaluation labels
        #[arg(long, requires = "mnist_eval_images")]
        mnist_eval_labels: Option<PathBuf>,

        /// Evaluation images; training data is reused when absent
        #[arg(long, requires = "eval_labels")]
        eval_images: Option<PathBuf>,

        /// Evaluation labels
        #[arg(long, requires = "eval_images")]
        eval_labels: Option<PathBuf>,

        /// Image width in pixels
        #[arg(long, default_value_t = 28)]
        width: u32,

        /// Image height in pixels
        #[arg(long, default_value_t = 28)]
        height: u32,

        /// Image channels
        #[arg(long, default_value_t = 1)]
        channels: u32,

        /// Label width (class count)
        #[arg(long, default_value_t = 10)]
        label_width: u32,

        /// Examples per batch
        #[arg(long, default_value_t = 64)]
        batch_size: u32,

        /// Hidden affine width
        #[arg(long, default_value_t = 128)]
        hidden: u32,

        /// Convolution channels; 0 selects the plain affine network
        #[arg(long, default_value_t = 0)]
        conv_channels: u32,

        /// Training steps
        #[arg(long, default_value_t = 1000)]
        steps: u32,

        /// Steps between accuracy evaluations
        #[arg(long, default_value_t = 100)]
        eval_interval: u32,

        /// Keep activations host readable and scan for non-finite values
        #[arg(long)]
        debug: bool,
    },
}

/// Read a raw little-endian f32 file.
fn read_f32_file(path: &Path) -> Result<Vec<f32>, NnError> {
    let bytes = std::fs::read(path).map_err(|_| NnError::UnableToLoadFile(path.to_path_buf()))?;
    if bytes.len() % 4 != 0 {
        return Err(NnError::UnableToLoadFile(path.to_path_buf()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Four-class synthetic dataset: one image quadrant lit per class, plus
/// noise. Enough signal for a smoke-test run without any files.
fn synthetic_dataset(shape: &DataShape, count: u32, seed: u64) -> (Vec<f32>, Vec<f32>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let image_len =
        (shape.image_width * shape.image_height * shape.image_channel) as usize;
    let mut images = Vec::with_capacity(count as usize * image_len);
    let mut labels = Vec::with_capacity(count as usize * shape.label_width as usize);

    for _ in 0..count {
        let class = rng.gen_range(0..shape.label_width);
        let half_w = shape.image_width / 2;
        let half_h = shape.image_height / 2;
        for y in 0..shape.image_height {
            for x in 0..shape.image_width {
                for _ in 0..shape.image_channel {
                    let quadrant = (y / half_h.max(1)).min(1) * 2 + (x / half_w.max(1)).min(1);
                    let signal = if quadrant == class % 4 { 0.8 } else { 0.0 };
                    images.push(signal + rng.gen_range(0.0..0.2));
                }
            }
        }
        for c in 0..shape.label_width {
            labels.push(if c == class { 1.0 } else { 0.0 });
        }
    }
    (images, labels)
}

fn load_split(
    images: &Option<PathBuf>,
    labels: &Option<PathBuf>,
) -> Result<Option<(Vec<f32>, Vec<f32>)>, NnError> {
    match (images, labels) {
        (Some(images), Some(labels)) => {
            Ok(Some((read_f32_file(images)?, read_f32_file(labels)?)))
        }
        _ => Ok(None),
    }
}

#[allow(clippy::too_many_arguments)]
fn train(
    device: usize,
    validation: bool,
    shader_dir: &Path,
    weights_path: &Path,
    shape: DataShape,
    train_data: Option<(Vec<f32>, Vec<f32>)>,
    eval_data: Option<(Vec<f32>, Vec<f32>)>,
    batch_size: u32,
    hidden: u32,
    conv_channels: u32,
    steps: u32,
    eval_interval: u32,
    debug: bool,
) -> Result<(), NnError> {
    let ctx = Arc::new(Context::new(device, validation)?);
    println!("Using GPU: {}", ctx.device_name());

    let mods = OperatorModules::load(&ctx, shader_dir)?;

    let (train_images, train_labels) = train_data.unwrap_or_else(|| {
        log::info!("No dataset given, generating a synthetic one");
        synthetic_dataset(&shape, 4096, 7)
    });
    let (eval_images, eval_labels) = eval_data
        .unwrap_or_else(|| (train_images.clone(), train_labels.clone()));

    let train_source = MemorySource::new(&ctx, shape, train_images, train_labels, batch_size)?;
    let eval_source = SequentialSource::new(&ctx, shape, eval_images, eval_labels, batch_size)?;

    let spec = if conv_channels > 0 {
        NetworkSpec::conv(conv_channels, hidden, shape.label_width)
    } else {
        NetworkSpec::simple(hidden, shape.label_width)
    };
    let mut net = Network::build(
        ctx,
        &mods,
        Box::new(train_source),
        Box::new(eval_source),
        &spec,
        batch_size,
        debug,
    )?;

    match net.restore(weights_path) {
        Ok(()) => println!("Restored weights from {}", weights_path.display()),
        Err(NnError::UnableToLoadFile(_)) => {
            log::warn!(
                "No usable weight file at {}, initializing",
                weights_path.display()
            );
            net.init()?;
        }
        Err(e) => return Err(e),
    }

    for step in 1..=steps {
        let loss = net.step()?;
        if step % eval_interval == 0 || step == steps {
            let (train_acc, eval_acc) = net.evaluate()?;
            println!(
                "step {:>6}  loss {:.5}  train acc {:.3}  eval acc {:.3}",
                step, loss, train_acc, eval_acc
            );
        }
    }

    net.dump(weights_path)?;
    println!("Weights written to {}", weights_path.display());
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Devices => Context::list_devices().map(|names| {
            for (i, name) in names.iter().enumerate() {
                println!("{}: {}", i, name);
            }
        }),
        Commands::Train {
            device,
            validation,
            shader_dir,
            weights,
            images,
            labels,
            mnist_images,
            mnist_labels,
            mnist_eval_images,
            mnist_eval_labels,
            eval_images,
            eval_labels,
            width,
            height,
            channels,
            label_width,
            batch_size,
            hidden,
            conv_channels,
            steps,
            eval_interval,
            debug,
        } => {
            let run = || -> Result<(), NnError> {
                let mut shape = DataShape {
                    image_width: width,
                    image_height: height,
                    image_channel: channels,
                    label_width,
                };
                let mut train_data = load_split(&images, &labels)?;
                let mut eval_data = load_split(&eval_images, &eval_labels)?;
                if let (Some(mi), Some(ml)) = (&mnist_images, &mnist_labels) {
                    let (i, l, s) = mnist::load(mi, ml)?;
                    shape = s;
                    train_data = Some((i, l));
                }
                if let (Some(mi), Some(ml)) = (&mnist_eval_images, &mnist_eval_labels) {
                    let (i, l, _) = mnist::load(mi, ml)?;
                    eval_data = Some((i, l));
                }
                train(
                    device,
                    validation,
                    &shader_dir,
                    &weights,
                    shape,
                    train_data,
                    eval_data,
                    batch_size,
                    hidden,
                    conv_channels,
                    steps,
                    eval_interval,
                    debug,
                )
            };
            run()
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_dataset_dimensions() {
        let shape = DataShape {
            image_width: 8,
            image_height: 8,
            image_channel: 1,
            label_width: 4,
        };
        let (images, labels) = synthetic_dataset(&shape, 16, 1);
        assert_eq!(images.len(), 16 * 64);
        assert_eq!(labels.len(), 16 * 4);
        // Every label row is one-hot
        for row in labels.chunks(4) {
            assert_eq!(row.iter().filter(|&&v| v == 1.0).count(), 1);
            assert_eq!(row.iter().filter(|&&v| v == 0.0).count(), 3);
        }
    }

    #[test]
    fn test_synthetic_dataset_deterministic() {
        let shape = DataShape {
            image_width: 8,
            image_height: 8,
            image_channel: 1,
            label_width: 4,
        };
        assert_eq!(synthetic_dataset(&shape, 4, 9), synthetic_dataset(&shape, 4, 9));
    }
}
