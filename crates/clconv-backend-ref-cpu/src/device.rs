use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use clconv::backend::spec::{
    BackendError, BackendResult, ChannelType, DeviceContext, ImageExtent, ImageFormat, KernelArg,
    NdRange,
};
use clconv::kernels::{parse_build_options, KernelKind, REAL};
use clconv::tensor::DType;

use crate::kernels;

/// Shared byte storage. Clones alias the same allocation.
#[derive(Clone)]
pub struct CpuBuffer {
    id: usize,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CpuBuffer {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().map(|bytes| bytes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn load(&self, dtype: DType) -> BackendResult<Vec<f32>> {
        let bytes = self
            .bytes
            .lock()
            .map_err(|_| BackendError::execution("cpu buffer lock poisoned"))?;
        Ok(dtype.decode(&bytes))
    }

    pub(crate) fn store(&self, dtype: DType, values: &[f32]) -> BackendResult<()> {
        let encoded = dtype.encode(values);
        let mut bytes = self
            .bytes
            .lock()
            .map_err(|_| BackendError::execution("cpu buffer lock poisoned"))?;
        if encoded.len() > bytes.len() {
            return Err(BackendError::execution(format!(
                "store of {} bytes overruns buffer #{} ({} bytes)",
                encoded.len(),
                self.id,
                bytes.len()
            )));
        }
        bytes[..encoded.len()].copy_from_slice(&encoded);
        Ok(())
    }
}

impl fmt::Debug for CpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuBuffer")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}

/// 2-D RGBA image holding decoded texel components.
pub struct CpuImage {
    format: ImageFormat,
    extent: ImageExtent,
    components: RwLock<Vec<f32>>,
}

impl CpuImage {
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn extent(&self) -> ImageExtent {
        self.extent
    }

    /// Snapshot of all texel components in row-major texel order.
    pub(crate) fn snapshot(&self) -> BackendResult<Vec<f32>> {
        self.components
            .read()
            .map(|components| components.clone())
            .map_err(|_| BackendError::execution("cpu image lock poisoned"))
    }
}

impl fmt::Debug for CpuImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuImage")
            .field("format", &self.format)
            .field("extent", &self.extent)
            .finish()
    }
}

#[derive(Debug)]
pub struct CpuProgram {
    pub(crate) kind: KernelKind,
    pub(crate) dtype: DType,
    pub(crate) defines: HashMap<String, String>,
}

impl CpuProgram {
    pub fn kind(&self) -> KernelKind {
        self.kind
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn define(&self, name: &str) -> Option<&str> {
        self.defines.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuEvent {
    sequence: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub program_builds: u64,
    pub kernel_launches: u64,
    pub buffer_allocs: u64,
    pub image_creates: u64,
    pub image_copies: u64,
}

/// Host-emulated device. Every enqueue executes immediately, which trivially preserves the
/// in-order queue contract.
#[derive(Default)]
pub struct CpuDevice {
    next_id: AtomicUsize,
    sequence: AtomicU64,
    program_builds: AtomicU64,
    kernel_launches: AtomicU64,
    buffer_allocs: AtomicU64,
    image_creates: AtomicU64,
    image_copies: AtomicU64,
}

impl CpuDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            program_builds: self.program_builds.load(Ordering::Relaxed),
            kernel_launches: self.kernel_launches.load(Ordering::Relaxed),
            buffer_allocs: self.buffer_allocs.load(Ordering::Relaxed),
            image_creates: self.image_creates.load(Ordering::Relaxed),
            image_copies: self.image_copies.load(Ordering::Relaxed),
        }
    }

    fn next_event(&self) -> CpuEvent {
        CpuEvent {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }
}

fn channel_dtype(channel_type: ChannelType) -> DType {
    match channel_type {
        ChannelType::Float => DType::F32,
        ChannelType::HalfFloat => DType::F16,
    }
}

impl DeviceContext for CpuDevice {
    type Buffer = CpuBuffer;
    type Image = CpuImage;
    type Program = CpuProgram;
    type Event = CpuEvent;

    fn device_name(&self) -> &str {
        "cpu-reference"
    }

    fn build_program(&self, template: &str, build_options: &str) -> BackendResult<CpuProgram> {
        let kind = KernelKind::from_template(template).ok_or_else(|| {
            BackendError::unimplemented("build_program", format!("unknown template '{template}'"))
        })?;
        let defines = parse_build_options(build_options)?;
        if let Some(missing) = kind
            .required_defines()
            .iter()
            .find(|name| !defines.contains_key(**name))
        {
            return Err(BackendError::execution(format!(
                "{template}: build options '{build_options}' lack -D {missing}"
            )));
        }
        let real = defines.get(REAL).map(String::as_str).unwrap_or_default();
        let dtype = DType::from_kernel_name(real).ok_or_else(|| {
            BackendError::unimplemented("build_program", format!("element type '{real}'"))
        })?;
        self.program_builds.fetch_add(1, Ordering::Relaxed);
        log::debug!("cpu device built {template} for {dtype}");
        Ok(CpuProgram {
            kind,
            dtype,
            defines,
        })
    }

    fn alloc_buffer(&self, bytes: usize) -> BackendResult<CpuBuffer> {
        self.buffer_allocs.fetch_add(1, Ordering::Relaxed);
        Ok(CpuBuffer {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            bytes: Arc::new(Mutex::new(vec![0u8; bytes])),
        })
    }

    fn write_buffer(&self, buffer: &CpuBuffer, bytes: &[u8]) -> BackendResult<()> {
        let mut dst = buffer
            .bytes
            .lock()
            .map_err(|_| BackendError::execution("cpu buffer lock poisoned"))?;
        if bytes.len() > dst.len() {
            return Err(BackendError::execution(format!(
                "write of {} bytes overruns buffer #{} ({} bytes)",
                bytes.len(),
                buffer.id,
                dst.len()
            )));
        }
        dst[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read_buffer(&self, buffer: &CpuBuffer) -> BackendResult<Vec<u8>> {
        buffer
            .bytes
            .lock()
            .map(|bytes| bytes.clone())
            .map_err(|_| BackendError::execution("cpu buffer lock poisoned"))
    }

    fn create_image_2d(&self, format: ImageFormat, extent: ImageExtent) -> BackendResult<CpuImage> {
        if extent.width == 0 || extent.height == 0 {
            return Err(BackendError::execution(format!(
                "image extent {extent:?} must be non-empty"
            )));
        }
        self.image_creates.fetch_add(1, Ordering::Relaxed);
        Ok(CpuImage {
            format,
            extent,
            components: RwLock::new(vec![0.0; extent.texel_count() * format.order.components()]),
        })
    }

    fn enqueue_copy_buffer_to_image(
        &self,
        src: &CpuBuffer,
        dst: &CpuImage,
        src_offset: usize,
        region: ImageExtent,
    ) -> BackendResult<CpuEvent> {
        if region.width > dst.extent.width || region.height > dst.extent.height {
            return Err(BackendError::execution(format!(
                "copy region {region:?} exceeds image extent {:?}",
                dst.extent
            )));
        }
        let components = dst.format.order.components();
        let texel_bytes = dst.format.texel_bytes();
        let len = region.texel_count() * texel_bytes;
        let bytes = self.read_buffer(src)?;
        let end = src_offset
            .checked_add(len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                BackendError::execution(format!(
                    "copy of {len} bytes at offset {src_offset} overruns buffer #{} ({} bytes)",
                    src.id,
                    bytes.len()
                ))
            })?;
        let values = channel_dtype(dst.format.channel_type).decode(&bytes[src_offset..end]);

        let mut image = dst
            .components
            .write()
            .map_err(|_| BackendError::execution("cpu image lock poisoned"))?;
        let row_len = region.width * components;
        for row in 0..region.height {
            let start = row * dst.extent.width * components;
            image[start..start + row_len]
                .copy_from_slice(&values[row * row_len..(row + 1) * row_len]);
        }
        self.image_copies.fetch_add(1, Ordering::Relaxed);
        Ok(self.next_event())
    }

    fn enqueue_nd_range(
        &self,
        program: &CpuProgram,
        global: NdRange,
        args: &[KernelArg<'_, Self>],
    ) -> BackendResult<CpuEvent> {
        kernels::check_signature(program.kind, args)?;
        log::trace!("cpu device launching {} over {:?}", program.kind, global.dims());
        kernels::launch(program, global, args)?;
        self.kernel_launches.fetch_add(1, Ordering::Relaxed);
        Ok(self.next_event())
    }

    fn wait(&self, event: &CpuEvent) -> BackendResult<()> {
        if event.sequence > self.sequence.load(Ordering::Relaxed) {
            return Err(BackendError::execution(format!(
                "event {} was never enqueued on this device",
                event.sequence
            )));
        }
        Ok(())
    }

    fn finish(&self) -> BackendResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clconv::kernels::mec_lowering_kernel_spec;

    fn f32_image(device: &CpuDevice, width: usize, height: usize) -> CpuImage {
        device
            .create_image_2d(
                ImageFormat::rgba(ChannelType::Float),
                ImageExtent::new(width, height),
            )
            .expect("image")
    }

    #[test]
    fn unknown_templates_are_unimplemented() {
        let device = CpuDevice::new();
        let err = device
            .build_program("conv.winograd", "-D REAL=float")
            .expect_err("unknown template");
        assert!(matches!(err, BackendError::Unimplemented { .. }), "{err}");
        assert_eq!(device.stats().program_builds, 0);
    }

    #[test]
    fn copy_fills_the_leading_texels_of_each_row() {
        let device = CpuDevice::new();
        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let buffer = device.alloc_buffer(values.len() * 4).expect("buffer");
        device
            .write_buffer(&buffer, &DType::F32.encode(&values))
            .expect("write");
        let image = f32_image(&device, 3, 2);

        let event = device
            .enqueue_copy_buffer_to_image(&buffer, &image, 0, ImageExtent::new(2, 2))
            .expect("copy");
        device.wait(&event).expect("wait");

        let snapshot = image.snapshot().expect("snapshot");
        assert_eq!(&snapshot[..8], &values[..8]);
        assert_eq!(&snapshot[8..12], &[0.0; 4]);
        assert_eq!(&snapshot[12..20], &values[8..16]);
    }

    #[test]
    fn copy_rejects_oversized_regions_and_short_sources() {
        let device = CpuDevice::new();
        let buffer = device.alloc_buffer(16).expect("buffer");
        let image = f32_image(&device, 2, 2);

        assert!(device
            .enqueue_copy_buffer_to_image(&buffer, &image, 0, ImageExtent::new(3, 1))
            .is_err());
        assert!(device
            .enqueue_copy_buffer_to_image(&buffer, &image, 0, ImageExtent::new(2, 1))
            .is_err());
        assert!(device
            .enqueue_copy_buffer_to_image(&buffer, &image, 4, ImageExtent::new(1, 1))
            .is_err());
        assert_eq!(device.stats().image_copies, 0);
    }

    #[test]
    fn launches_check_the_argument_signature() {
        let device = CpuDevice::new();
        let spec = mec_lowering_kernel_spec::<f32>(4, 4, 3);
        let program = device
            .build_program(spec.template(), &spec.build_options())
            .expect("build");
        let buffer = device.alloc_buffer(64).expect("buffer");

        let too_few: [KernelArg<'_, CpuDevice>; 2] =
            [KernelArg::Buffer(&buffer), KernelArg::Int(1)];
        let err = device
            .enqueue_nd_range(&program, NdRange::new(1, 1, 1), &too_few)
            .expect_err("arity");
        assert!(err.to_string().contains("takes 8 arguments"), "{err}");

        let wrong_kind: Vec<KernelArg<'_, CpuDevice>> = (0..8)
            .map(|index| {
                if index == 5 {
                    KernelArg::Buffer(&buffer)
                } else {
                    KernelArg::Int(0)
                }
            })
            .collect();
        let err = device
            .enqueue_nd_range(&program, NdRange::new(1, 1, 1), &wrong_kind)
            .expect_err("first argument must be a buffer");
        assert!(err.to_string().contains("argument 0"), "{err}");
        assert_eq!(device.stats().kernel_launches, 0);
    }

    #[test]
    fn foreign_events_fail_to_wait() {
        let device = CpuDevice::new();
        assert!(device.wait(&CpuEvent { sequence: 3 }).is_err());
    }
}
