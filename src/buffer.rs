//! GPU buffer management
//!
//! Typed wrappers over VkBuffer plus backing memory. Every buffer of a
//! network is created at construction time and lives until the network is
//! dropped; descriptor sets recorded into fixed command sequences keep
//! pointing at the same buffers for the whole run.
//!
//! `BufferView` is the unit the pipeline factories consume: a shared buffer,
//! an element offset, and an element length. A default-constructed view is
//! unbound and stands for "this operator does not use that binding".

use ash::{vk, Device};
use bytemuck::Pod;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::context::Context;
use crate::error::NnError;

/// Weight element type. Weight buffers pack four lanes per element so the
/// kernels can load them with a single vec4 fetch.
pub type WeightVec = [f32; 4];

/// Where the buffer memory lives and who touches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// DEVICE_LOCAL; never mapped by the host
    DeviceOnly,
    /// Host-visible, host writes / device reads (batch staging)
    Upload,
    /// Host-visible, device writes / host reads (eval output, weight dumps)
    Readback,
}

impl Residency {
    /// Property flag preference order, strongest first.
    fn candidates(self) -> &'static [vk::MemoryPropertyFlags] {
        const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
            vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
                | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
        );
        const HOST_CACHED: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
            HOST.as_raw() | vk::MemoryPropertyFlags::HOST_CACHED.as_raw(),
        );
        match self {
            Residency::DeviceOnly => &[vk::MemoryPropertyFlags::DEVICE_LOCAL],
            Residency::Upload => &[HOST],
            Residency::Readback => &[HOST_CACHED, HOST],
        }
    }
}

/// Wrapper around VkBuffer and VkDeviceMemory with a typed element length.
pub struct Buffer<T: Pod> {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    len: usize,
    device: Arc<Device>,
    _marker: PhantomData<T>,
}

impl<T: Pod> Buffer<T> {
    /// Create a buffer of `len` elements.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Owning context
    /// * `len` - Element count (must be non-zero)
    /// * `usage` - STORAGE_BUFFER and/or transfer flags
    /// * `residency` - Memory class, see [`Residency`]
    pub fn new(
        ctx: &Context,
        len: usize,
        usage: vk::BufferUsageFlags,
        residency: Residency,
    ) -> Result<Arc<Self>, NnError> {
        if len == 0 {
            return Err(NnError::InvalidDataLength);
        }
        let device = ctx.device().clone();
        let byte_len = (len * std::mem::size_of::<T>()) as vk::DeviceSize;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(byte_len)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None) }?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let mut memory_type = None;
        for properties in residency.candidates() {
            memory_type = find_memory_type(
                ctx.memory_properties(),
                requirements.memory_type_bits,
                *properties,
            );
            if memory_type.is_some() {
                break;
            }
        }
        let memory_type_index = match memory_type {
            Some(idx) => idx,
            None => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(NnError::Api(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        unsafe { device.bind_buffer_memory(buffer, memory, 0) }?;

        log::debug!(
            "Created buffer: {} elements, {} bytes, {:?}",
            len,
            byte_len,
            residency
        );

        Ok(Arc::new(Self {
            buffer,
            memory,
            len,
            device,
            _marker: PhantomData,
        }))
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_len(&self) -> vk::DeviceSize {
        (self.len * std::mem::size_of::<T>()) as vk::DeviceSize
    }

    /// Write `data` at element `offset`. Host-visible memory only.
    pub fn write_from(&self, offset: usize, data: &[T]) -> Result<(), NnError> {
        check_range(self.len, offset, data.len())?;
        let byte_offset = (offset * std::mem::size_of::<T>()) as vk::DeviceSize;
        let byte_len = std::mem::size_of_val(data);

        let mapped = unsafe {
            self.device.map_memory(
                self.memory,
                byte_offset,
                byte_len as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )
        }?;
        unsafe {
            let dst = std::slice::from_raw_parts_mut(mapped as *mut u8, byte_len);
            dst.copy_from_slice(bytemuck::cast_slice(data));
            self.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Read into `data` from element `offset`. Host-visible memory only.
    pub fn read_to(&self, offset: usize, data: &mut [T]) -> Result<(), NnError> {
        check_range(self.len, offset, data.len())?;
        let byte_offset = (offset * std::mem::size_of::<T>()) as vk::DeviceSize;
        let byte_len = std::mem::size_of_val(data);

        let mapped = unsafe {
            self.device.map_memory(
                self.memory,
                byte_offset,
                byte_len as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )
        }?;
        unsafe {
            let src = std::slice::from_raw_parts(mapped as *const u8, byte_len);
            bytemuck::cast_slice_mut(data).copy_from_slice(src);
            self.device.unmap_memory(self.memory);
        }
        Ok(())
    }
}

impl<T: Pod> Drop for Buffer<T> {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// A shared buffer with an element offset and length, or nothing.
///
/// Operators receive one view per binding slot; unbound views mark slots an
/// operator does not use. Factories reject unbound views for slots they
/// require, so a dispatch never sees one.
pub struct BufferView<T: Pod> {
    buffer: Option<Arc<Buffer<T>>>,
    offset: usize,
    len: usize,
}

impl<T: Pod> Clone for BufferView<T> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            offset: self.offset,
            len: self.len,
        }
    }
}

impl<T: Pod> Default for BufferView<T> {
    fn default() -> Self {
        Self {
            buffer: None,
            offset: 0,
            len: 0,
        }
    }
}

impl<T: Pod> BufferView<T> {
    /// View `len` elements of `buffer` starting at element `offset`.
    pub fn new(buffer: Arc<Buffer<T>>, offset: usize, len: usize) -> Result<Self, NnError> {
        check_range(buffer.len(), offset, len)?;
        Ok(Self {
            buffer: Some(buffer),
            offset,
            len,
        })
    }

    /// View the whole buffer.
    pub fn whole(buffer: Arc<Buffer<T>>) -> Self {
        let len = buffer.len();
        Self {
            buffer: Some(buffer),
            offset: 0,
            len,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.buffer.is_some()
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn byte_offset(&self) -> vk::DeviceSize {
        (self.offset * std::mem::size_of::<T>()) as vk::DeviceSize
    }

    pub fn byte_len(&self) -> vk::DeviceSize {
        (self.len * std::mem::size_of::<T>()) as vk::DeviceSize
    }

    pub fn buffer(&self) -> Option<&Arc<Buffer<T>>> {
        self.buffer.as_ref()
    }

    /// Underlying VkBuffer handle.
    ///
    /// # Panics
    ///
    /// Panics on an unbound view. Factories validate `is_bound` for every
    /// slot they record, so this is unreachable after construction succeeds.
    pub fn raw(&self) -> vk::Buffer {
        self.buffer
            .as_ref()
            .map(|b| b.handle())
            .unwrap_or_else(|| panic!("raw() called on unbound buffer view"))
    }

    /// Write through to the underlying buffer at this view's offset.
    pub fn write_from(&self, data: &[T]) -> Result<(), NnError> {
        check_range(self.len, 0, data.len())?;
        match &self.buffer {
            Some(buffer) => buffer.write_from(self.offset, data),
            None => Err(NnError::InvalidDataLength),
        }
    }

    /// Read through from the underlying buffer at this view's offset.
    pub fn read_to(&self, data: &mut [T]) -> Result<(), NnError> {
        check_range(self.len, 0, data.len())?;
        match &self.buffer {
            Some(buffer) => buffer.read_to(self.offset, data),
            None => Err(NnError::InvalidDataLength),
        }
    }
}

/// Validate that `offset..offset + len` fits in `buffer_len` elements.
pub fn check_range(buffer_len: usize, offset: usize, len: usize) -> Result<(), NnError> {
    if offset > buffer_len || len > buffer_len - offset {
        return Err(NnError::InvalidDataLength);
    }
    Ok(())
}

/// Find a memory type supported by `type_filter` carrying all `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    for i in 0..memory_properties.memory_type_count {
        if (type_filter & (1 << i)) != 0
            && (memory_properties.memory_types[i as usize].property_flags & properties)
                == properties
        {
            return Some(i);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_memory_type() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 2;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        let result = find_memory_type(
            &props,
            0b11,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        assert_eq!(result, Some(1));
    }

    #[test]
    fn test_find_memory_type_no_match() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 1;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let result = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert_eq!(result, None);
    }

    #[test]
    fn test_check_range_accepts_exact_fit() {
        assert!(check_range(10, 0, 10).is_ok());
        assert!(check_range(10, 4, 6).is_ok());
        assert!(check_range(10, 10, 0).is_ok());
    }

    #[test]
    fn test_check_range_rejects_overrun() {
        assert!(matches!(
            check_range(10, 4, 7),
            Err(NnError::InvalidDataLength)
        ));
        assert!(matches!(
            check_range(10, 11, 0),
            Err(NnError::InvalidDataLength)
        ));
        // offset + len overflowing usize must not wrap into acceptance
        assert!(matches!(
            check_range(10, usize::MAX, 2),
            Err(NnError::InvalidDataLength)
        ));
    }

    #[test]
    fn test_unbound_view_defaults() {
        let view: BufferView<f32> = BufferView::default();
        assert!(!view.is_bound());
        assert_eq!(view.len(), 0);
        assert_eq!(view.offset(), 0);
    }
}
