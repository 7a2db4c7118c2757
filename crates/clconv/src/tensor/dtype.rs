//! Element types the device programs can be specialized for.

use std::fmt;

use half::f16;
use serde::{Deserialize, Serialize};

use crate::backend::spec::{ChannelType, ImageFormat};

/// Logical dtype identifier shared between host tensors and device handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 16-bit floating point (fp16).
    F16,
}

impl DType {
    /// Returns the number of bytes required per scalar element.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
        }
    }

    /// Scalar type name as spelled in program sources (`REAL`).
    pub const fn kernel_name(self) -> &'static str {
        match self {
            DType::F32 => "float",
            DType::F16 => "half",
        }
    }

    /// Resolves the `REAL` define of a built program back to a dtype.
    pub fn from_kernel_name(name: &str) -> Option<Self> {
        match name {
            "float" => Some(DType::F32),
            "half" => Some(DType::F16),
            _ => None,
        }
    }

    pub const fn channel_type(self) -> ChannelType {
        match self {
            DType::F32 => ChannelType::Float,
            DType::F16 => ChannelType::HalfFloat,
        }
    }

    /// Encodes `values` in this dtype as little-endian bytes.
    pub fn encode(self, values: &[f32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() * self.size_in_bytes());
        match self {
            DType::F32 => {
                for value in values {
                    out.extend_from_slice(&value.to_le_bytes());
                }
            }
            DType::F16 => {
                for value in values {
                    out.extend_from_slice(&f16::from_f32(*value).to_le_bytes());
                }
            }
        }
        out
    }

    /// Decodes little-endian bytes of this dtype into `f32` values. Trailing partial elements
    /// are ignored.
    pub fn decode(self, bytes: &[u8]) -> Vec<f32> {
        match self {
            DType::F32 => bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
            DType::F16 => bytes
                .chunks_exact(2)
                .map(|chunk| f16::from_le_bytes([chunk[0], chunk[1]]).to_f32())
                .collect(),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kernel_name())
    }
}

/// Closed set of element types an operator instance can be specialized for.
///
/// The associated constants are exactly the pieces of a program specialization that depend on
/// the element type: the scalar and 4-wide vector type names, the image read primitive, and the
/// texel channel format of packed filter images.
pub trait Real: Copy + fmt::Debug + Send + Sync + 'static {
    const DTYPE: DType;
    const REAL_NAME: &'static str;
    const VECTOR_NAME: &'static str;
    const READ_IMAGE: &'static str;

    fn image_format() -> ImageFormat {
        ImageFormat::rgba(Self::DTYPE.channel_type())
    }

    fn size_in_bytes() -> usize {
        Self::DTYPE.size_in_bytes()
    }
}

impl Real for f32 {
    const DTYPE: DType = DType::F32;
    const REAL_NAME: &'static str = "float";
    const VECTOR_NAME: &'static str = "float4";
    const READ_IMAGE: &'static str = "read_imagef";
}

impl Real for f16 {
    const DTYPE: DType = DType::F16;
    const REAL_NAME: &'static str = "half";
    const VECTOR_NAME: &'static str = "half4";
    const READ_IMAGE: &'static str = "read_imageh";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_roundtrip_is_lossy_but_close() {
        let values = [0.1f32, -2.5, 1024.0, 3.0e-3];
        let decoded = DType::F16.decode(&DType::F16.encode(&values));
        for (expected, actual) in values.iter().zip(decoded.iter()) {
            assert!((expected - actual).abs() <= expected.abs() * 1e-3);
        }
    }

    #[test]
    fn kernel_names_resolve_back() {
        for dtype in [DType::F32, DType::F16] {
            assert_eq!(DType::from_kernel_name(dtype.kernel_name()), Some(dtype));
        }
        assert_eq!(DType::from_kernel_name("double"), None);
    }

    #[test]
    fn real_traits_agree_with_dtype() {
        assert_eq!(<f32 as Real>::REAL_NAME, DType::F32.kernel_name());
        assert_eq!(<f16 as Real>::REAL_NAME, DType::F16.kernel_name());
        assert_eq!(<f16 as Real>::image_format().texel_bytes(), 8);
        assert_eq!(<f32 as Real>::image_format().texel_bytes(), 16);
    }
}
