//! Device-resident state owned by one operator instance.
//!
//! The filter is repacked only when its element count or packing changes; content changes at an
//! unchanged size are not detected. Everything is dropped when the problem shape changes.

use crate::backend::spec::{BackendError, BackendResult, DeviceContext};
use crate::layout::{pack_filter, FilterPacking};
use crate::profiling;
use crate::tensor::{HostTensor, Real};

use super::ConvResult;

pub(crate) struct DeviceFilter<D: DeviceContext> {
    pub packing: FilterPacking,
    pub len: usize,
    pub buffer: D::Buffer,
    pub image: Option<D::Image>,
}

struct SizedBuffer<D: DeviceContext> {
    elements: usize,
    buffer: D::Buffer,
}

pub(crate) struct ConvResources<D: DeviceContext> {
    filter: Option<DeviceFilter<D>>,
    lowering: Option<SizedBuffer<D>>,
    bias: Option<SizedBuffer<D>>,
    filter_rebuilds: u64,
}

impl<D: DeviceContext> Default for ConvResources<D> {
    fn default() -> Self {
        Self {
            filter: None,
            lowering: None,
            bias: None,
            filter_rebuilds: 0,
        }
    }
}

fn upload<D: DeviceContext, T: Real>(device: &D, values: &[f32]) -> BackendResult<D::Buffer> {
    let bytes = T::DTYPE.encode(values);
    let buffer = device.alloc_buffer(bytes.len())?;
    device.write_buffer(&buffer, &bytes)?;
    Ok(buffer)
}

fn build_filter<D: DeviceContext, T: Real>(
    device: &D,
    filter: &HostTensor,
    packing: FilterPacking,
    rows: usize,
    cols: usize,
) -> ConvResult<DeviceFilter<D>> {
    let packed = pack_filter(filter.data(), packing, rows, cols)?;
    log::debug!(
        "packing {}-element filter as {packing:?} (image {:?})",
        packed.len(),
        packed.image
    );
    let _scope = profiling::backend_scope("clconv.filter_upload");
    let buffer = upload::<D, T>(device, &packed.data)?;
    let image = match packed.image {
        Some(extent) => {
            let image = device.create_image_2d(T::image_format(), extent)?;
            let event = device.enqueue_copy_buffer_to_image(&buffer, &image, 0, extent)?;
            device.wait(&event)?;
            Some(image)
        }
        None => None,
    };
    Ok(DeviceFilter {
        packing,
        len: filter.len(),
        buffer,
        image,
    })
}

impl<D: DeviceContext> ConvResources<D> {
    pub fn filter_rebuilds(&self) -> u64 {
        self.filter_rebuilds
    }

    /// Returns the device filter in `packing`, repacking when the element count or the packing
    /// differs from the cached copy. `rows`/`cols` describe the filter as a row-major matrix.
    pub fn ensure_filter<T: Real>(
        &mut self,
        device: &D,
        filter: &HostTensor,
        packing: FilterPacking,
        rows: usize,
        cols: usize,
    ) -> ConvResult<&DeviceFilter<D>> {
        let hit = matches!(
            &self.filter,
            Some(cached) if cached.len == filter.len() && cached.packing == packing
        );
        if hit {
            profiling::cache_event("clconv.filter_hit");
        } else {
            profiling::cache_event("clconv.filter_rebuild");
            let rebuilt = build_filter::<D, T>(device, filter, packing, rows, cols)?;
            self.filter = Some(rebuilt);
            self.filter_rebuilds += 1;
        }
        self.filter
            .as_ref()
            .ok_or_else(|| BackendError::execution("device filter missing after upload").into())
    }

    /// Drops the filter, lowering scratch and bias so the next call rebuilds them for a new
    /// problem shape.
    pub fn invalidate(&mut self) {
        self.filter = None;
        self.lowering = None;
        self.bias = None;
    }

    /// Scratch buffer for the lowered input. Contents are rewritten by every launch.
    pub fn ensure_lowering<T: Real>(
        &mut self,
        device: &D,
        elements: usize,
    ) -> BackendResult<D::Buffer> {
        if let Some(cached) = &self.lowering {
            if cached.elements == elements {
                profiling::cache_event("clconv.lowering_hit");
                return Ok(cached.buffer.clone());
            }
        }
        profiling::cache_event("clconv.lowering_rebuild");
        log::debug!("allocating lowering buffer of {elements} elements");
        let buffer = device.alloc_buffer(elements.max(1) * T::size_in_bytes())?;
        self.lowering = Some(SizedBuffer {
            elements,
            buffer: buffer.clone(),
        });
        Ok(buffer)
    }

    /// Device copy of `bias`, or zeros when the call has none. The values are written on every
    /// call; only the allocation is reused.
    pub fn ensure_bias<T: Real>(
        &mut self,
        device: &D,
        bias: Option<&HostTensor>,
        out_channels: usize,
    ) -> BackendResult<D::Buffer> {
        let values = match bias {
            Some(bias) => bias.data().to_vec(),
            None => vec![0.0; out_channels],
        };
        if let Some(cached) = &self.bias {
            if cached.elements == out_channels {
                profiling::cache_event("clconv.bias_hit");
                device.write_buffer(&cached.buffer, &T::DTYPE.encode(&values))?;
                return Ok(cached.buffer.clone());
            }
        }
        profiling::cache_event("clconv.bias_rebuild");
        let buffer = upload::<D, T>(device, &values)?;
        self.bias = Some(SizedBuffer {
            elements: out_channels,
            buffer: buffer.clone(),
        });
        Ok(buffer)
    }
}
