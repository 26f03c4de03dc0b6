//! Declarative network construction
//!
//! A `NetworkSpec` is an ordered list of typed layer specs; shape inference
//! walks it from the data source's image shape and every buffer and
//! pipeline is derived from the result. Construction validates everything
//! up front: a spec that cannot work raises before any pipeline is
//! compiled.
//!
//! The forward, loss, and backward passes for both training slots and the
//! evaluation pass are recorded once into three command buffers at build
//! time. Descriptor sets never change afterwards, so any invocation that
//! reads a slot buffer directly is constructed once per slot it appears
//! with; everything downstream is built once and shared by all three
//! sequences.

use ash::vk;
use std::sync::Arc;

use crate::buffer::{Buffer, BufferView, Residency, WeightVec};
use crate::context::Context;
use crate::data::DataSource;
use crate::error::NnError;
use crate::invocation::Invocation;
use crate::ops;
use crate::ops::conv::ConvShape;
use crate::ops::pool::PoolShape;
use crate::shader::OperatorModules;

/// Activation extent after a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl Shape {
    pub fn len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }
}

/// One layer of the network trunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerSpec {
    /// Fully connected projection to `width` units
    Affine { width: u32 },
    Relu,
    Tanh,
    /// Convolution to `channels` output channels
    Conv {
        channels: u32,
        filter: u32,
        stride: u32,
        margin: u32,
    },
    /// Channel-preserving convolution, one filter slice per channel
    ConvStraight { filter: u32, stride: u32, margin: u32 },
    MaxPool { filter: u32, stride: u32 },
}

/// Ordered layer list; the softmax loss head is implicit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub layers: Vec<LayerSpec>,
}

impl NetworkSpec {
    /// One hidden affine layer, the classic baseline.
    pub fn simple(hidden_width: u32, output_width: u32) -> Self {
        Self {
            layers: vec![
                LayerSpec::Affine { width: hidden_width },
                LayerSpec::Relu,
                LayerSpec::Affine { width: output_width },
                LayerSpec::Tanh,
            ],
        }
    }

    /// Three stacked 3x3 convolutions, 2x2 pooling, one hidden affine.
    pub fn conv(channels: u32, hidden_width: u32, output_width: u32) -> Self {
        Self {
            layers: vec![
                LayerSpec::Conv {
                    channels,
                    filter: 3,
                    stride: 1,
                    margin: 1,
                },
                LayerSpec::Relu,
                LayerSpec::ConvStraight {
                    filter: 3,
                    stride: 1,
                    margin: 1,
                },
                LayerSpec::Relu,
                LayerSpec::ConvStraight {
                    filter: 3,
                    stride: 1,
                    margin: 1,
                },
                LayerSpec::Relu,
                LayerSpec::MaxPool { filter: 2, stride: 2 },
                LayerSpec::Affine { width: hidden_width },
                LayerSpec::Relu,
                LayerSpec::Affine { width: output_width },
                LayerSpec::Tanh,
            ],
        }
    }
}

/// Output extent of one convolution axis, exact cover required.
fn conv_output_extent(input: u32, filter: u32, stride: u32, margin: u32) -> Result<u32, NnError> {
    let padded = input + 2 * margin;
    if padded < filter || (padded - filter) % stride != 0 {
        return Err(NnError::InvalidDataLength);
    }
    Ok((padded - filter) / stride + 1)
}

/// Output extent of one pooling axis, exact cover required.
fn pool_output_extent(input: u32, filter: u32, stride: u32) -> Result<u32, NnError> {
    if input < filter || (input - filter) % stride != 0 {
        return Err(NnError::InvalidDataLength);
    }
    Ok((input - filter) / stride + 1)
}

/// Activation shape after each layer, starting from `input`.
pub fn infer_shapes(spec: &NetworkSpec, input: Shape) -> Result<Vec<Shape>, NnError> {
    if spec.layers.is_empty() || input.len() == 0 {
        return Err(NnError::InvalidDataLength);
    }
    let mut shapes = Vec::with_capacity(spec.layers.len());
    let mut current = input;
    for layer in &spec.layers {
        current = match *layer {
            LayerSpec::Affine { width } => {
                if width == 0 {
                    return Err(NnError::InvalidDataLength);
                }
                Shape {
                    width,
                    height: 1,
                    channels: 1,
                }
            }
            LayerSpec::Relu | LayerSpec::Tanh => current,
            LayerSpec::Conv {
                channels,
                filter,
                stride,
                margin,
            } => {
                if channels == 0 || filter == 0 || stride == 0 {
                    return Err(NnError::InvalidDataLength);
                }
                Shape {
                    width: conv_output_extent(current.width, filter, stride, margin)?,
                    height: conv_output_extent(current.height, filter, stride, margin)?,
                    channels,
                }
            }
            LayerSpec::ConvStraight {
                filter,
                stride,
                margin,
            } => {
                if filter == 0 || stride == 0 {
                    return Err(NnError::InvalidDataLength);
                }
                Shape {
                    width: conv_output_extent(current.width, filter, stride, margin)?,
                    height: conv_output_extent(current.height, filter, stride, margin)?,
                    channels: current.channels,
                }
            }
            LayerSpec::MaxPool { filter, stride } => {
                if filter == 0 || stride == 0 {
                    return Err(NnError::InvalidDataLength);
                }
                Shape {
                    width: pool_output_extent(current.width, filter, stride)?,
                    height: pool_output_extent(current.height, filter, stride)?,
                    channels: current.channels,
                }
            }
        };
        shapes.push(current);
    }
    Ok(shapes)
}

/// Training slot count: two alternating train slots plus the eval slot.
const SLOT_COUNT: usize = 3;
pub(crate) const EVAL_SLOT: usize = 2;

/// A constructed network: buffers, pipelines, and the three recorded
/// command sequences.
pub struct Network {
    ctx: Arc<Context>,
    train_source: Box<dyn DataSource>,
    eval_source: Box<dyn DataSource>,
    batch_size: u32,
    label_width: u32,
    swap_index: usize,
    image_slots: Vec<BufferView<f32>>,
    label_slots: Vec<BufferView<f32>>,
    weights: Vec<(Arc<Buffer<WeightVec>>, u32)>,
    init_invocations: Vec<Invocation>,
    // Pipelines, descriptor sets, and intermediate buffers referenced by
    // the recorded command buffers; dropped only after the command buffers
    // go unused
    _train_seqs: [Vec<Arc<Invocation>>; 2],
    _eval_seq: Vec<Arc<Invocation>>,
    _intermediates: Vec<Arc<Buffer<f32>>>,
    train_cmds: [vk::CommandBuffer; 2],
    eval_cmd: vk::CommandBuffer,
    fill_cmd: vk::CommandBuffer,
    loss_output: Arc<Buffer<f32>>,
    eval_output: Arc<Buffer<f32>>,
    debug: bool,
    named_buffers: Vec<(String, Arc<Buffer<f32>>)>,
}

impl Network {
    /// Build a network for `spec` over the two sources.
    ///
    /// Sources must agree on image and label shape. The final layer's
    /// element count must equal the label width.
    pub fn build(
        ctx: Arc<Context>,
        mods: &OperatorModules,
        train_source: Box<dyn DataSource>,
        eval_source: Box<dyn DataSource>,
        spec: &NetworkSpec,
        batch_size: u32,
        debug: bool,
    ) -> Result<Self, NnError> {
        if batch_size == 0 {
            return Err(NnError::InvalidDataLength);
        }
        if train_source.image_width() != eval_source.image_width()
            || train_source.image_height() != eval_source.image_height()
            || train_source.image_channel() != eval_source.image_channel()
            || train_source.label_width() != eval_source.label_width()
        {
            return Err(NnError::InvalidDataLength);
        }

        let input_shape = Shape {
            width: train_source.image_width(),
            height: train_source.image_height(),
            channels: train_source.image_channel(),
        };
        let label_width = train_source.label_width();
        let shapes = infer_shapes(spec, input_shape)?;
        let output_shape = *shapes.last().ok_or(NnError::InvalidDataLength)?;
        if output_shape.len() != label_width as usize {
            return Err(NnError::InvalidDataLength);
        }
        log::info!(
            "Building network: {} layers, input {}x{}x{}, output width {}, batch {}",
            spec.layers.len(),
            input_shape.width,
            input_shape.height,
            input_shape.channels,
            label_width,
            batch_size
        );

        let batch = batch_size as usize;
        let act_residency = if debug {
            Residency::Readback
        } else {
            Residency::DeviceOnly
        };
        let storage = vk::BufferUsageFlags::STORAGE_BUFFER;
        let slot_usage = storage | vk::BufferUsageFlags::TRANSFER_DST;
        let weight_usage =
            storage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;

        // Slot buffers: two alternating train slots plus the eval slot
        let mut image_slots = Vec::with_capacity(SLOT_COUNT);
        let mut label_slots = Vec::with_capacity(SLOT_COUNT);
        for slot in 0..SLOT_COUNT {
            image_slots.push(BufferView::whole(Buffer::<f32>::new(
                &ctx,
                input_shape.len() * batch,
                slot_usage,
                Residency::DeviceOnly,
            )?));
            // The eval label slot is read back for the accuracy metric
            let label_residency = if slot == EVAL_SLOT {
                Residency::Readback
            } else {
                Residency::DeviceOnly
            };
            label_slots.push(BufferView::whole(Buffer::<f32>::new(
                &ctx,
                label_width as usize * batch,
                slot_usage,
                label_residency,
            )?));
        }

        let mut named_buffers: Vec<(String, Arc<Buffer<f32>>)> = Vec::new();
        // Invocations record raw handles only, so the network must own
        // every buffer its command sequences touch
        let mut intermediates: Vec<Arc<Buffer<f32>>> = Vec::new();
        let mut track = |name: String, buffer: &Arc<Buffer<f32>>| {
            intermediates.push(buffer.clone());
            if debug {
                named_buffers.push((name, buffer.clone()));
            }
        };

        // One activation buffer per layer output, one gradient buffer per
        // layer input.
        let layer_count = spec.layers.len();
        let mut activations = Vec::with_capacity(layer_count);
        let mut gradients = Vec::with_capacity(layer_count);
        for (i, shape) in shapes.iter().enumerate() {
            let in_len = if i == 0 {
                input_shape.len()
            } else {
                shapes[i - 1].len()
            };
            let act = Buffer::<f32>::new(&ctx, shape.len() * batch, storage, act_residency)?;
            track(format!("layer{}_output", i), &act);
            activations.push(BufferView::whole(act));

            let grad = Buffer::<f32>::new(
                &ctx,
                in_len * batch,
                storage | vk::BufferUsageFlags::TRANSFER_DST,
                act_residency,
            )?;
            track(format!("layer{}_input_grad", i), &grad);
            gradients.push(BufferView::whole(grad));
        }
        // Gradient of the loss with respect to the final activation
        let softmax_grad =
            Buffer::<f32>::new(&ctx, label_width as usize * batch, storage, act_residency)?;
        track("softmax_grad".to_string(), &softmax_grad);
        let softmax_grad = BufferView::whole(softmax_grad);

        let loss_output = Buffer::<f32>::new(&ctx, batch, storage, Residency::Readback)?;
        let eval_output = Buffer::<f32>::new(
            &ctx,
            label_width as usize * batch,
            storage,
            Residency::Readback,
        )?;

        // Weight buffers in layer order; the dump file follows this order
        let mut weights: Vec<(Arc<Buffer<WeightVec>>, u32)> = Vec::new();
        let mut weight_views: Vec<Option<BufferView<WeightVec>>> = Vec::with_capacity(layer_count);
        for (i, layer) in spec.layers.iter().enumerate() {
            let in_shape = if i == 0 { input_shape } else { shapes[i - 1] };
            let weight_len = match *layer {
                LayerSpec::Affine { width } => Some(in_shape.len() * width as usize),
                LayerSpec::Conv {
                    channels, filter, ..
                } => Some(filter as usize * filter as usize * in_shape.channels as usize
                    * channels as usize),
                LayerSpec::ConvStraight { filter, .. } => {
                    Some(filter as usize * filter as usize * in_shape.channels as usize)
                }
                _ => None,
            };
            match weight_len {
                Some(len) => {
                    let buffer =
                        Buffer::<WeightVec>::new(&ctx, len, weight_usage, Residency::DeviceOnly)?;
                    weights.push((buffer.clone(), in_shape.len() as u32));
                    weight_views.push(Some(BufferView::whole(buffer)));
                }
                None => weight_views.push(None),
            }
        }

        // Init pipelines, one per weight buffer
        let mut init_invocations = Vec::with_capacity(weights.len());
        for (buffer, fan_in) in &weights {
            init_invocations.push(ops::init::init(
                &ctx,
                &mods.init,
                &BufferView::whole(buffer.clone()),
                *fan_in,
            )?);
        }

        // Forward invocations. The first layer reads a slot buffer, so it
        // is built once per slot; the last layer gains an eval replica
        // writing the host readable output.
        let forward_input = |i: usize, slot: usize| -> BufferView<f32> {
            if i == 0 {
                image_slots[slot].clone()
            } else {
                activations[i - 1].clone()
            }
        };
        let build_forward = |input: &BufferView<f32>,
                             output: &BufferView<f32>,
                             i: usize|
         -> Result<Invocation, NnError> {
            let in_shape = if i == 0 { input_shape } else { shapes[i - 1] };
            match spec.layers[i] {
                LayerSpec::Affine { .. } => ops::affine::forward(
                    &ctx,
                    &mods.affine_forward,
                    input,
                    output,
                    weight_views[i].as_ref().ok_or(NnError::InvalidDataLength)?,
                    batch_size,
                ),
                LayerSpec::Relu => {
                    ops::activation::forward(&ctx, &mods.relu_forward, input, output)
                }
                LayerSpec::Tanh => {
                    ops::activation::forward(&ctx, &mods.tanh_forward, input, output)
                }
                LayerSpec::Conv {
                    channels,
                    filter,
                    stride,
                    margin,
                } => ops::conv::forward(
                    &ctx,
                    &mods.conv_forward,
                    input,
                    output,
                    weight_views[i].as_ref().ok_or(NnError::InvalidDataLength)?,
                    &ConvShape {
                        output_width: shapes[i].width,
                        output_height: shapes[i].height,
                        in_channels: in_shape.channels,
                        out_channels: channels,
                        filter_width: filter,
                        filter_height: filter,
                        xstride: stride,
                        ystride: stride,
                        xmargin: margin,
                        ymargin: margin,
                        straight: false,
                    },
                    batch_size,
                ),
                LayerSpec::ConvStraight {
                    filter,
                    stride,
                    margin,
                } => ops::conv::forward(
                    &ctx,
                    &mods.conv_straight_forward,
                    input,
                    output,
                    weight_views[i].as_ref().ok_or(NnError::InvalidDataLength)?,
                    &ConvShape {
                        output_width: shapes[i].width,
                        output_height: shapes[i].height,
                        in_channels: in_shape.channels,
                        out_channels: in_shape.channels,
                        filter_width: filter,
                        filter_height: filter,
                        xstride: stride,
                        ystride: stride,
                        xmargin: margin,
                        ymargin: margin,
                        straight: true,
                    },
                    batch_size,
                ),
                LayerSpec::MaxPool { filter, stride } => ops::pool::forward(
                    &ctx,
                    &mods.maxpool_forward,
                    input,
                    output,
                    &PoolShape {
                        output_width: shapes[i].width,
                        output_height: shapes[i].height,
                        channels: shapes[i].channels,
                        filter_width: filter,
                        filter_height: filter,
                        xstride: stride,
                        ystride: stride,
                    },
                    batch_size,
                ),
            }
        };

        // Shared middle forwards; per-slot replicas where a slot buffer or
        // the eval output is bound.
        let mut forward_shared: Vec<Option<Arc<Invocation>>> = vec![None; layer_count];
        for i in 1..layer_count.saturating_sub(1) {
            forward_shared[i] = Some(Arc::new(build_forward(
                &forward_input(i, 0),
                &activations[i],
                i,
            )?));
        }
        let last = layer_count - 1;
        let mut first_forward: Vec<Arc<Invocation>> = Vec::with_capacity(SLOT_COUNT);
        if layer_count == 1 {
            // Single-layer trunk: the replicas read the slot and write the
            // training or eval output directly
            for slot in 0..SLOT_COUNT {
                let output = if slot == EVAL_SLOT {
                    BufferView::whole(eval_output.clone())
                } else {
                    activations[0].clone()
                };
                first_forward.push(Arc::new(build_forward(&image_slots[slot], &output, 0)?));
            }
        } else {
            for slot in 0..SLOT_COUNT {
                first_forward.push(Arc::new(build_forward(
                    &image_slots[slot],
                    &activations[0],
                    0,
                )?));
            }
            forward_shared[last] = Some(Arc::new(build_forward(
                &forward_input(last, 0),
                &activations[last],
                last,
            )?));
        }
        let eval_head = if layer_count > 1 {
            Some(Arc::new(build_forward(
                &forward_input(last, 0),
                &BufferView::whole(eval_output.clone()),
                last,
            )?))
        } else {
            None
        };

        // Loss head, one per training label slot
        let loss_view = BufferView::whole(loss_output.clone());
        let mut loss_heads: Vec<Arc<Invocation>> = Vec::with_capacity(2);
        for slot in 0..2 {
            loss_heads.push(Arc::new(ops::softmax::combined(
                &ctx,
                &mods.softmax_combined,
                &activations[last],
                &loss_view,
                &softmax_grad,
                &label_slots[slot],
            )?));
        }

        // Backward invocations, deepest layer first. The output gradient of
        // layer i is the input gradient of layer i + 1, or the loss
        // gradient at the top. Layers reading a train slot replicate per
        // slot.
        let output_grad = |i: usize| -> BufferView<f32> {
            if i == last {
                softmax_grad.clone()
            } else {
                gradients[i + 1].clone()
            }
        };
        let build_backward = |input: &BufferView<f32>, i: usize| -> Result<Vec<Invocation>, NnError> {
            let in_shape = if i == 0 { input_shape } else { shapes[i - 1] };
            let out_grad = output_grad(i);
            match spec.layers[i] {
                LayerSpec::Affine { .. } => Ok(vec![ops::affine::backward(
                    &ctx,
                    &mods.affine_backward,
                    input,
                    &activations[i],
                    weight_views[i].as_ref().ok_or(NnError::InvalidDataLength)?,
                    &gradients[i],
                    &out_grad,
                    batch_size,
                )?]),
                LayerSpec::Relu => Ok(vec![ops::activation::backward(
                    &ctx,
                    &mods.relu_backward,
                    input,
                    &activations[i],
                    &gradients[i],
                    &out_grad,
                )?]),
                LayerSpec::Tanh => Ok(vec![ops::activation::backward(
                    &ctx,
                    &mods.tanh_backward,
                    input,
                    &activations[i],
                    &gradients[i],
                    &out_grad,
                )?]),
                LayerSpec::Conv {
                    channels,
                    filter,
                    stride,
                    margin,
                } => {
                    let shape = ConvShape {
                        output_width: shapes[i].width,
                        output_height: shapes[i].height,
                        in_channels: in_shape.channels,
                        out_channels: channels,
                        filter_width: filter,
                        filter_height: filter,
                        xstride: stride,
                        ystride: stride,
                        xmargin: margin,
                        ymargin: margin,
                        straight: false,
                    };
                    Ok(vec![
                        ops::conv::backward_input(
                            &ctx,
                            &mods.conv_backward_input,
                            input,
                            &activations[i],
                            weight_views[i].as_ref().ok_or(NnError::InvalidDataLength)?,
                            &gradients[i],
                            &out_grad,
                            &shape,
                            batch_size,
                        )?,
                        ops::conv::backward_weight(
                            &ctx,
                            &mods.conv_backward_weight,
                            input,
                            &activations[i],
                            weight_views[i].as_ref().ok_or(NnError::InvalidDataLength)?,
                            &out_grad,
                            &shape,
                            batch_size,
                        )?,
                    ])
                }
                LayerSpec::ConvStraight {
                    filter,
                    stride,
                    margin,
                } => {
                    let shape = ConvShape {
                        output_width: shapes[i].width,
                        output_height: shapes[i].height,
                        in_channels: in_shape.channels,
                        out_channels: in_shape.channels,
                        filter_width: filter,
                        filter_height: filter,
                        xstride: stride,
                        ystride: stride,
                        xmargin: margin,
                        ymargin: margin,
                        straight: true,
                    };
                    Ok(vec![
                        ops::conv::backward_input(
                            &ctx,
                            &mods.conv_straight_backward_input,
                            input,
                            &activations[i],
                            weight_views[i].as_ref().ok_or(NnError::InvalidDataLength)?,
                            &gradients[i],
                            &out_grad,
                            &shape,
                            batch_size,
                        )?,
                        ops::conv::backward_weight(
                            &ctx,
                            &mods.conv_straight_backward_weight,
                            input,
                            &activations[i],
                            weight_views[i].as_ref().ok_or(NnError::InvalidDataLength)?,
                            &out_grad,
                            &shape,
                            batch_size,
                        )?,
                    ])
                }
                LayerSpec::MaxPool { filter, stride } => Ok(vec![ops::pool::backward(
                    &ctx,
                    &mods.maxpool_backward,
                    input,
                    &activations[i],
                    &gradients[i],
                    &out_grad,
                    &PoolShape {
                        output_width: shapes[i].width,
                        output_height: shapes[i].height,
                        channels: shapes[i].channels,
                        filter_width: filter,
                        filter_height: filter,
                        xstride: stride,
                        ystride: stride,
                    },
                    batch_size,
                )?]),
            }
        };

        let mut backward_shared: Vec<Vec<Arc<Invocation>>> = Vec::with_capacity(layer_count);
        for i in 0..layer_count {
            if i == 0 {
                backward_shared.push(Vec::new());
            } else {
                backward_shared.push(
                    build_backward(&forward_input(i, 0), i)?
                        .into_iter()
                        .map(Arc::new)
                        .collect(),
                );
            }
        }
        // First layer backward reads the image slot, so one replica set per
        // training slot
        let mut first_backward: Vec<Vec<Arc<Invocation>>> = Vec::with_capacity(2);
        for slot in 0..2 {
            first_backward.push(
                build_backward(&image_slots[slot], 0)?
                    .into_iter()
                    .map(Arc::new)
                    .collect(),
            );
        }

        // Assemble the three sequences
        let mut train_seqs: [Vec<Arc<Invocation>>; 2] = [Vec::new(), Vec::new()];
        for (slot, seq) in train_seqs.iter_mut().enumerate() {
            seq.push(first_forward[slot].clone());
            for i in 1..layer_count {
                if let Some(fwd) = &forward_shared[i] {
                    seq.push(fwd.clone());
                }
            }
            seq.push(loss_heads[slot].clone());
            for i in (1..layer_count).rev() {
                seq.extend(backward_shared[i].iter().cloned());
            }
            seq.extend(first_backward[slot].iter().cloned());
        }
        let mut eval_seq: Vec<Arc<Invocation>> = Vec::new();
        eval_seq.push(first_forward[EVAL_SLOT].clone());
        for i in 1..layer_count.saturating_sub(1) {
            if let Some(fwd) = &forward_shared[i] {
                eval_seq.push(fwd.clone());
            }
        }
        if let Some(head) = &eval_head {
            eval_seq.push(head.clone());
        }

        // Record each sequence once; steps resubmit the same buffers
        let cmds = ctx.allocate_command_buffers(4)?;
        let train_cmds = [cmds[0], cmds[1]];
        let eval_cmd = cmds[2];
        let fill_cmd = cmds[3];
        for (cmd, seq) in train_cmds
            .iter()
            .zip(&train_seqs)
            .chain(std::iter::once((&eval_cmd, &eval_seq)))
        {
            ctx.begin_recording(*cmd)?;
            for invocation in seq {
                invocation.record(*cmd)?;
            }
            ctx.end_recording(*cmd)?;
        }
        log::info!(
            "Recorded sequences: train {} invocations, eval {}",
            train_seqs[0].len(),
            eval_seq.len()
        );

        let mut network = Self {
            ctx,
            train_source,
            eval_source,
            batch_size,
            label_width,
            // First step trains slot 0, primed below
            swap_index: 1,
            image_slots,
            label_slots,
            weights,
            init_invocations,
            _train_seqs: train_seqs,
            _eval_seq: eval_seq,
            _intermediates: intermediates,
            train_cmds,
            eval_cmd,
            fill_cmd,
            loss_output,
            eval_output,
            debug,
            named_buffers,
        };
        network.fill_slot(0, false)?;
        Ok(network)
    }

    /// Randomize every weight buffer through the init pipelines.
    pub fn init(&self) -> Result<(), NnError> {
        self.ctx.one_shot(|cmd| {
            for invocation in &self.init_invocations {
                invocation.record(cmd)?;
            }
            Ok(())
        })?;
        log::info!("Initialized {} weight buffers", self.weights.len());
        Ok(())
    }

    /// Record and submit a batch upload into `slot` without waiting.
    ///
    /// The upload contents change every batch, so the fill command buffer
    /// is re-recorded each time; the pinned training sequences never are.
    pub(crate) fn submit_fill(&mut self, slot: usize, from_eval: bool) -> Result<(), NnError> {
        unsafe {
            self.ctx
                .device()
                .reset_command_buffer(self.fill_cmd, vk::CommandBufferResetFlags::empty())
        }?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.ctx.device().begin_command_buffer(self.fill_cmd, &begin_info) }?;
        let source = if from_eval {
            &mut self.eval_source
        } else {
            &mut self.train_source
        };
        source.fill(
            &self.ctx,
            self.fill_cmd,
            &self.image_slots[slot],
            &self.label_slots[slot],
        )?;
        unsafe { self.ctx.device().end_command_buffer(self.fill_cmd) }?;
        self.ctx.submit(self.fill_cmd)
    }

    /// Upload a batch into `slot` and wait for it to land.
    pub(crate) fn fill_slot(&mut self, slot: usize, from_eval: bool) -> Result<(), NnError> {
        self.submit_fill(slot, from_eval)?;
        self.ctx.wait_idle()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn label_width(&self) -> u32 {
        self.label_width
    }

    /// Weight buffers with their fan-in, in declaration order.
    pub fn weights(&self) -> &[(Arc<Buffer<WeightVec>>, u32)] {
        &self.weights
    }

    pub(crate) fn flip_swap_index(&mut self) -> usize {
        self.swap_index = (self.swap_index + 1) % 2;
        self.swap_index
    }

    pub(crate) fn train_cmd(&self, slot: usize) -> vk::CommandBuffer {
        self.train_cmds[slot]
    }

    pub(crate) fn eval_cmd(&self) -> vk::CommandBuffer {
        self.eval_cmd
    }

    pub(crate) fn loss_output(&self) -> &Arc<Buffer<f32>> {
        &self.loss_output
    }

    pub(crate) fn eval_output(&self) -> &Arc<Buffer<f32>> {
        &self.eval_output
    }

    pub(crate) fn eval_labels(&self) -> &BufferView<f32> {
        &self.label_slots[EVAL_SLOT]
    }

    /// Scan every tracked buffer for non-finite values; debug mode only.
    pub fn check_finite(&self) -> Result<(), NnError> {
        if !self.debug {
            return Ok(());
        }
        for (name, buffer) in &self.named_buffers {
            let mut host = vec![0f32; buffer.len()];
            buffer.read_to(0, &mut host)?;
            if let Some(pos) = host.iter().position(|v| !v.is_finite()) {
                log::warn!("Non-finite value in {} at element {}", name, pos);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mnist_input() -> Shape {
        Shape {
            width: 28,
            height: 28,
            channels: 1,
        }
    }

    #[test]
    fn test_simple_shape_inference() {
        let spec = NetworkSpec::simple(128, 10);
        let shapes = infer_shapes(&spec, mnist_input()).unwrap();
        assert_eq!(shapes.len(), 4);
        assert_eq!(shapes[0].len(), 128);
        assert_eq!(shapes[1].len(), 128);
        assert_eq!(shapes[2].len(), 10);
        assert_eq!(shapes[3].len(), 10);
    }

    #[test]
    fn test_conv_shape_inference() {
        let spec = NetworkSpec::conv(8, 128, 10);
        let shapes = infer_shapes(&spec, mnist_input()).unwrap();
        // 3x3 stride 1 margin 1 keeps the extent
        assert_eq!(
            shapes[0],
            Shape {
                width: 28,
                height: 28,
                channels: 8
            }
        );
        assert_eq!(shapes[2], shapes[0]);
        // 2x2 stride 2 pooling halves it
        assert_eq!(
            shapes[6],
            Shape {
                width: 14,
                height: 14,
                channels: 8
            }
        );
        assert_eq!(shapes.last().unwrap().len(), 10);
    }

    #[test]
    fn test_inference_rejects_empty_spec() {
        let spec = NetworkSpec { layers: vec![] };
        assert!(matches!(
            infer_shapes(&spec, mnist_input()),
            Err(NnError::InvalidDataLength)
        ));
    }

    #[test]
    fn test_inference_rejects_uncovered_pool() {
        // 28 does not split into 3x3 windows at stride 2
        let spec = NetworkSpec {
            layers: vec![LayerSpec::MaxPool {
                filter: 3,
                stride: 2,
            }],
        };
        assert!(matches!(
            infer_shapes(&spec, mnist_input()),
            Err(NnError::InvalidDataLength)
        ));
    }

    #[test]
    fn test_inference_rejects_zero_affine() {
        let spec = NetworkSpec {
            layers: vec![LayerSpec::Affine { width: 0 }],
        };
        assert!(matches!(
            infer_shapes(&spec, mnist_input()),
            Err(NnError::InvalidDataLength)
        ));
    }

    #[test]
    fn test_pool_output_extent() {
        assert_eq!(pool_output_extent(28, 2, 2).unwrap(), 14);
        assert_eq!(pool_output_extent(27, 3, 2).unwrap(), 13);
        assert!(pool_output_extent(2, 3, 1).is_err());
    }

    #[test]
    fn test_conv_output_extent() {
        // margin 1 filter 3 stride 1 keeps the extent
        assert_eq!(conv_output_extent(28, 3, 1, 1).unwrap(), 28);
        // no margin shrinks by filter - 1
        assert_eq!(conv_output_extent(28, 3, 1, 0).unwrap(), 26);
        // (28 - 3) is not a multiple of stride 2
        assert!(conv_output_extent(28, 3, 2, 0).is_err());
    }
}
