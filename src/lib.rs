//! GPU neural network training over raw Vulkan compute
//!
//! Builds fully hand-scheduled training pipelines: every layer is a
//! compute dispatch recorded once into a reusable command buffer, with
//! all buffer bindings fixed at construction time.
//!
//! # Architecture
//!
//! 1. [`Context`] owns the Vulkan instance, device, queue, and the shared
//!    descriptor and pipeline caches
//! 2. [`NetworkSpec`] declares the layer stack; [`Network::build`] infers
//!    shapes, allocates buffers, compiles pipelines, and records the
//!    training and evaluation sequences
//! 3. `Network::step` alternates two batch slots so transfer of the next
//!    batch overlaps compute on the current one
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use vknet::{Context, MemorySource, Network, NetworkSpec, OperatorModules};
//!
//! # fn run(train: vknet::MemorySource, eval: vknet::MemorySource) -> Result<(), vknet::NnError> {
//! let ctx = Arc::new(Context::new(0, false)?);
//! let mods = OperatorModules::load(&ctx, Path::new("shaders"))?;
//! let spec = NetworkSpec::simple(128, 10);
//! let mut net = Network::build(ctx, &mods, Box::new(train), Box::new(eval), &spec, 64, false)?;
//! net.init()?;
//! for _ in 0..1000 {
//!     net.step()?;
//! }
//! let (train_acc, eval_acc) = net.evaluate()?;
//! println!("train {train_acc:.3} eval {eval_acc:.3}");
//! # Ok(())
//! # }
//! ```

mod buffer;
mod context;
mod data;
mod dispatch;
mod error;
mod graph;
mod invocation;
pub mod ops;
mod persist;
mod scheduler;
mod shader;

// Buffer and context signatures take raw `vk` types
pub use ash;

pub use buffer::{Buffer, BufferView, Residency, WeightVec};
pub use context::{Context, DeviceLimits};
pub use data::{mnist, DataShape, DataSource, MemorySource, SequentialSource};
pub use error::NnError;
pub use graph::{infer_shapes, LayerSpec, Network, NetworkSpec, Shape};
pub use invocation::Invocation;
pub use scheduler::accuracy;
pub use shader::{OperatorModules, ShaderModule};
