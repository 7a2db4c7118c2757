//! Strategy selection from storage order and problem size.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::StorageOrder;

/// Input-channel count from which lowering + GEMM beats the direct kernel.
pub const DEFAULT_LOWERING_CHANNEL_THRESHOLD: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    /// Grouped 1x1 convolution as `G` independent GEMMs over channel-major data.
    GroupedGemm1x1,
    /// Lowers the input into `[W_out, H_in, K, C_in]` and multiplies by the imaged filter.
    LoweringGemm,
    /// Sliding-window reduction straight from the input.
    Direct,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::GroupedGemm1x1 => "grouped_gemm1x1",
            Strategy::LoweringGemm => "lowering_gemm",
            Strategy::Direct => "direct",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Run(Strategy),
    Unsupported { reason: String },
}

pub fn select_strategy(
    order: StorageOrder,
    kernel: usize,
    stride: usize,
    in_channels: usize,
    prefer_lowering: bool,
    lowering_threshold: usize,
) -> Selection {
    match order {
        StorageOrder::Nchw => {
            if kernel != 1 || stride != 1 {
                return Selection::Unsupported {
                    reason: format!(
                        "channel-major convolution only runs 1x1 kernels at stride 1 \
                         (kernel={kernel}, stride={stride})"
                    ),
                };
            }
            Selection::Run(Strategy::GroupedGemm1x1)
        }
        StorageOrder::Nhwc => {
            if prefer_lowering || in_channels >= lowering_threshold {
                Selection::Run(Strategy::LoweringGemm)
            } else {
                Selection::Run(Strategy::Direct)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: usize = DEFAULT_LOWERING_CHANNEL_THRESHOLD;

    #[test]
    fn channel_major_pointwise_runs_gemm() {
        assert_eq!(
            select_strategy(StorageOrder::Nchw, 1, 1, 3, false, T),
            Selection::Run(Strategy::GroupedGemm1x1)
        );
        // The lowering preference does not apply to channel-major data.
        assert_eq!(
            select_strategy(StorageOrder::Nchw, 1, 1, 512, true, T),
            Selection::Run(Strategy::GroupedGemm1x1)
        );
    }

    #[test]
    fn channel_major_rejects_spatial_kernels_and_strides() {
        assert!(matches!(
            select_strategy(StorageOrder::Nchw, 3, 1, 4, false, T),
            Selection::Unsupported { .. }
        ));
        assert!(matches!(
            select_strategy(StorageOrder::Nchw, 1, 2, 4, false, T),
            Selection::Unsupported { .. }
        ));
    }

    #[test]
    fn channel_minor_switches_on_threshold() {
        assert_eq!(
            select_strategy(StorageOrder::Nhwc, 3, 1, T - 1, false, T),
            Selection::Run(Strategy::Direct)
        );
        assert_eq!(
            select_strategy(StorageOrder::Nhwc, 3, 1, T, false, T),
            Selection::Run(Strategy::LoweringGemm)
        );
        assert_eq!(
            select_strategy(StorageOrder::Nhwc, 3, 1, 4, true, T),
            Selection::Run(Strategy::LoweringGemm)
        );
    }

    #[test]
    fn custom_threshold_is_respected() {
        assert_eq!(
            select_strategy(StorageOrder::Nhwc, 3, 2, 16, false, 16),
            Selection::Run(Strategy::LoweringGemm)
        );
        assert_eq!(
            select_strategy(StorageOrder::Nhwc, 3, 2, 8, false, 16),
            Selection::Run(Strategy::Direct)
        );
    }
}
