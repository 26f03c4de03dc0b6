//! Batch data sources
//!
//! A `DataSource` owns decoded examples in host memory and fills a slot
//! buffer pair (images and one-hot labels) by recording staging copies into
//! the caller's command buffer. The copies land behind transfer barriers so
//! the compute sequence submitted after the fill observes the new batch.

use ash::vk;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use crate::buffer::{Buffer, BufferView, Residency};
use crate::context::Context;
use crate::error::NnError;

/// Produces batches for one dataset split.
pub trait DataSource {
    fn image_count(&self) -> u32;
    fn image_width(&self) -> u32;
    fn image_height(&self) -> u32;
    fn image_channel(&self) -> u32;
    fn label_width(&self) -> u32;

    /// Record a batch upload into `cmd` targeting the given slot views.
    fn fill(
        &mut self,
        ctx: &Context,
        cmd: vk::CommandBuffer,
        images: &BufferView<f32>,
        labels: &BufferView<f32>,
    ) -> Result<(), NnError>;

    /// Elements of one image.
    fn image_len(&self) -> usize {
        self.image_width() as usize * self.image_height() as usize * self.image_channel() as usize
    }
}

/// Dataset dimensions shared by the in-memory sources.
#[derive(Debug, Clone, Copy)]
pub struct DataShape {
    pub image_width: u32,
    pub image_height: u32,
    pub image_channel: u32,
    pub label_width: u32,
}

struct HostData {
    shape: DataShape,
    images: Vec<f32>,
    labels: Vec<f32>,
    count: u32,
    image_staging: Arc<Buffer<f32>>,
    label_staging: Arc<Buffer<f32>>,
    batch_size: u32,
    image_scratch: Vec<f32>,
    label_scratch: Vec<f32>,
}

impl HostData {
    fn new(
        ctx: &Context,
        shape: DataShape,
        images: Vec<f32>,
        labels: Vec<f32>,
        batch_size: u32,
    ) -> Result<Self, NnError> {
        let image_len = shape.image_width as usize
            * shape.image_height as usize
            * shape.image_channel as usize;
        let label_len = shape.label_width as usize;
        if image_len == 0 || label_len == 0 || batch_size == 0 {
            return Err(NnError::InvalidDataLength);
        }
        if images.len() % image_len != 0 || labels.len() % label_len != 0 {
            return Err(NnError::InvalidDataLength);
        }
        let count = images.len() / image_len;
        if count == 0 || labels.len() / label_len != count {
            return Err(NnError::InvalidDataLength);
        }

        let image_staging = Buffer::<f32>::new(
            ctx,
            image_len * batch_size as usize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            Residency::Upload,
        )?;
        let label_staging = Buffer::<f32>::new(
            ctx,
            label_len * batch_size as usize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            Residency::Upload,
        )?;

        Ok(Self {
            shape,
            images,
            labels,
            count: count as u32,
            image_staging,
            label_staging,
            batch_size,
            image_scratch: vec![0.0; image_len * batch_size as usize],
            label_scratch: vec![0.0; label_len * batch_size as usize],
        })
    }

    fn image_len(&self) -> usize {
        self.shape.image_width as usize
            * self.shape.image_height as usize
            * self.shape.image_channel as usize
    }

    /// Gather the examples at `indices` into staging, then record the
    /// staging to slot copies with their publishing barriers.
    fn upload(
        &mut self,
        ctx: &Context,
        cmd: vk::CommandBuffer,
        indices: &[u32],
        images: &BufferView<f32>,
        labels: &BufferView<f32>,
    ) -> Result<(), NnError> {
        let image_len = self.image_len();
        let label_len = self.shape.label_width as usize;
        if images.len() != image_len * self.batch_size as usize
            || labels.len() != label_len * self.batch_size as usize
        {
            return Err(NnError::InvalidDataLength);
        }

        for (slot, index) in indices.iter().enumerate() {
            let index = *index as usize;
            self.image_scratch[slot * image_len..(slot + 1) * image_len]
                .copy_from_slice(&self.images[index * image_len..(index + 1) * image_len]);
            self.label_scratch[slot * label_len..(slot + 1) * label_len]
                .copy_from_slice(&self.labels[index * label_len..(index + 1) * label_len]);
        }
        self.image_staging.write_from(0, &self.image_scratch)?;
        self.label_staging.write_from(0, &self.label_scratch)?;

        let copies = [
            (self.image_staging.handle(), images),
            (self.label_staging.handle(), labels),
        ];
        for (staging, view) in copies {
            let region = vk::BufferCopy::default()
                .src_offset(0)
                .dst_offset(view.byte_offset())
                .size(view.byte_len());
            let barrier = vk::BufferMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(view.raw())
                .offset(view.byte_offset())
                .size(view.byte_len());
            unsafe {
                ctx.device()
                    .cmd_copy_buffer(cmd, staging, view.raw(), &[region]);
                ctx.device().cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[barrier],
                    &[],
                );
            }
        }
        Ok(())
    }
}

/// Uniform sampling with replacement; the training source.
pub struct MemorySource {
    data: HostData,
    rng: StdRng,
}

impl MemorySource {
    pub fn new(
        ctx: &Context,
        shape: DataShape,
        images: Vec<f32>,
        labels: Vec<f32>,
        batch_size: u32,
    ) -> Result<Self, NnError> {
        Ok(Self {
            data: HostData::new(ctx, shape, images, labels, batch_size)?,
            rng: StdRng::from_entropy(),
        })
    }

    /// Deterministic variant for tests.
    pub fn with_seed(
        ctx: &Context,
        shape: DataShape,
        images: Vec<f32>,
        labels: Vec<f32>,
        batch_size: u32,
        seed: u64,
    ) -> Result<Self, NnError> {
        Ok(Self {
            data: HostData::new(ctx, shape, images, labels, batch_size)?,
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

impl DataSource for MemorySource {
    fn image_count(&self) -> u32 {
        self.data.count
    }
    fn image_width(&self) -> u32 {
        self.data.shape.image_width
    }
    fn image_height(&self) -> u32 {
        self.data.shape.image_height
    }
    fn image_channel(&self) -> u32 {
        self.data.shape.image_channel
    }
    fn label_width(&self) -> u32 {
        self.data.shape.label_width
    }

    fn fill(
        &mut self,
        ctx: &Context,
        cmd: vk::CommandBuffer,
        images: &BufferView<f32>,
        labels: &BufferView<f32>,
    ) -> Result<(), NnError> {
        let count = self.data.count;
        let indices: Vec<u32> = (0..self.data.batch_size)
            .map(|_| self.rng.gen_range(0..count))
            .collect();
        self.data.upload(ctx, cmd, &indices, images, labels)
    }
}

/// Ordered walk with wrap-around; deterministic evaluation batches.
pub struct SequentialSource {
    data: HostData,
    cursor: u32,
}

impl SequentialSource {
    pub fn new(
        ctx: &Context,
        shape: DataShape,
        images: Vec<f32>,
        labels: Vec<f32>,
        batch_size: u32,
    ) -> Result<Self, NnError> {
        Ok(Self {
            data: HostData::new(ctx, shape, images, labels, batch_size)?,
            cursor: 0,
        })
    }
}

impl DataSource for SequentialSource {
    fn image_count(&self) -> u32 {
        self.data.count
    }
    fn image_width(&self) -> u32 {
        self.data.shape.image_width
    }
    fn image_height(&self) -> u32 {
        self.data.shape.image_height
    }
    fn image_channel(&self) -> u32 {
        self.data.shape.image_channel
    }
    fn label_width(&self) -> u32 {
        self.data.shape.label_width
    }

    fn fill(
        &mut self,
        ctx: &Context,
        cmd: vk::CommandBuffer,
        images: &BufferView<f32>,
        labels: &BufferView<f32>,
    ) -> Result<(), NnError> {
        let count = self.data.count;
        let indices: Vec<u32> = (0..self.data.batch_size)
            .map(|i| (self.cursor + i) % count)
            .collect();
        self.cursor = (self.cursor + self.data.batch_size) % count;
        self.data.upload(ctx, cmd, &indices, images, labels)
    }
}

/// MNIST idx file decoding.
///
/// The idx container stores big-endian header words followed by raw
/// bytes: magic `0x803` with count, width, and height for images, magic
/// `0x801` with count for labels. Pixels normalize to `[0, 1]` and label
/// digits expand to one-hot rows of width 10.
pub mod mnist {
    use super::DataShape;
    use crate::error::NnError;
    use std::path::Path;

    const IMAGE_MAGIC: u32 = 0x803;
    const LABEL_MAGIC: u32 = 0x801;
    pub const LABEL_WIDTH: u32 = 10;

    fn be_u32(bytes: &[u8], offset: usize) -> Result<u32, NnError> {
        let word = bytes
            .get(offset..offset + 4)
            .ok_or(NnError::CorruptedFile)?;
        Ok(u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
    }

    /// Decode an idx3 image file into normalized floats.
    ///
    /// Returns the pixel data with `(count, width, height)`.
    pub fn parse_images(bytes: &[u8]) -> Result<(Vec<f32>, u32, u32, u32), NnError> {
        if be_u32(bytes, 0)? != IMAGE_MAGIC {
            return Err(NnError::CorruptedFile);
        }
        let count = be_u32(bytes, 4)?;
        let height = be_u32(bytes, 8)?;
        let width = be_u32(bytes, 12)?;
        let len = count as usize * width as usize * height as usize;
        let data = bytes.get(16..16 + len).ok_or(NnError::CorruptedFile)?;
        Ok((
            data.iter().map(|&v| v as f32 / 255.0).collect(),
            count,
            width,
            height,
        ))
    }

    /// Decode an idx1 label file into one-hot rows.
    pub fn parse_labels(bytes: &[u8]) -> Result<(Vec<f32>, u32), NnError> {
        if be_u32(bytes, 0)? != LABEL_MAGIC {
            return Err(NnError::CorruptedFile);
        }
        let count = be_u32(bytes, 4)?;
        let data = bytes
            .get(8..8 + count as usize)
            .ok_or(NnError::CorruptedFile)?;
        let mut rows = vec![0f32; count as usize * LABEL_WIDTH as usize];
        for (i, &digit) in data.iter().enumerate() {
            if digit as u32 >= LABEL_WIDTH {
                return Err(NnError::CorruptedFile);
            }
            rows[i * LABEL_WIDTH as usize + digit as usize] = 1.0;
        }
        Ok((rows, count))
    }

    /// Load an image/label file pair.
    pub fn load(
        image_path: &Path,
        label_path: &Path,
    ) -> Result<(Vec<f32>, Vec<f32>, DataShape), NnError> {
        let image_bytes = std::fs::read(image_path)
            .map_err(|_| NnError::UnableToLoadFile(image_path.to_path_buf()))?;
        let label_bytes = std::fs::read(label_path)
            .map_err(|_| NnError::UnableToLoadFile(label_path.to_path_buf()))?;
        let (images, image_count, width, height) = parse_images(&image_bytes)?;
        let (labels, label_count) = parse_labels(&label_bytes)?;
        if image_count != label_count {
            return Err(NnError::InvalidDataLength);
        }
        log::info!(
            "Loaded {} MNIST examples ({}x{})",
            image_count,
            width,
            height
        );
        Ok((
            images,
            labels,
            DataShape {
                image_width: width,
                image_height: height,
                image_channel: 1,
                label_width: LABEL_WIDTH,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx_images(count: u32, width: u32, height: u32, pixels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x803u32.to_be_bytes());
        bytes.extend_from_slice(&count.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(pixels);
        bytes
    }

    fn idx_labels(digits: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x801u32.to_be_bytes());
        bytes.extend_from_slice(&(digits.len() as u32).to_be_bytes());
        bytes.extend_from_slice(digits);
        bytes
    }

    #[test]
    fn test_mnist_image_parsing() {
        let bytes = idx_images(2, 2, 1, &[0, 255, 51, 102]);
        let (pixels, count, width, height) = mnist::parse_images(&bytes).unwrap();
        assert_eq!((count, width, height), (2, 2, 1));
        assert_eq!(pixels, vec![0.0, 1.0, 0.2, 0.4]);
    }

    #[test]
    fn test_mnist_label_parsing() {
        let (rows, count) = mnist::parse_labels(&idx_labels(&[3, 0])).unwrap();
        assert_eq!(count, 2);
        assert_eq!(rows.len(), 20);
        assert_eq!(rows[3], 1.0);
        assert_eq!(rows.iter().filter(|&&v| v == 1.0).count(), 2);
        assert_eq!(rows[10], 1.0);
    }

    #[test]
    fn test_mnist_rejects_bad_magic() {
        let mut bytes = idx_images(1, 1, 1, &[0]);
        bytes[3] = 0x01;
        assert!(matches!(
            mnist::parse_images(&bytes),
            Err(NnError::CorruptedFile)
        ));
    }

    #[test]
    fn test_mnist_rejects_truncated_pixels() {
        let bytes = idx_images(2, 2, 2, &[0; 7]);
        assert!(matches!(
            mnist::parse_images(&bytes),
            Err(NnError::CorruptedFile)
        ));
    }

    #[test]
    fn test_mnist_rejects_out_of_range_label() {
        assert!(matches!(
            mnist::parse_labels(&idx_labels(&[10])),
            Err(NnError::CorruptedFile)
        ));
    }

    #[test]
    fn test_sequential_indices_wrap() {
        // Index arithmetic mirrored from SequentialSource::fill
        let count = 5u32;
        let batch = 3u32;
        let mut cursor = 0u32;
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.extend((0..batch).map(|i| (cursor + i) % count));
            cursor = (cursor + batch) % count;
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 0, 1, 2, 3]);
    }
}
