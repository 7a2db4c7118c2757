pub mod conv_suite;
pub mod reference;

pub use anyhow;

#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $device_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::conv_suite;

            macro_rules! conv_test {
                ($name:ident) => {
                    #[test]
                    fn $name() -> $crate::anyhow::Result<()> {
                        let device = ($device_ctor)();
                        conv_suite::$name(&device)
                    }
                };
            }

            conv_test!(pointwise_matches_dense_matmul);
            conv_test!(grouped_pointwise_matches_per_group_reference);
            conv_test!(lowering_matches_reference);
            conv_test!(direct_matches_reference);
            conv_test!(strided_batched_bias_matches_reference);
            conv_test!(half_precision_matches_reference);
            conv_test!(repeated_calls_reuse_programs);
            conv_test!(filter_resize_rebuilds_once);
            conv_test!(unsupported_leaves_output_untouched);
            conv_test!(group_mismatch_fails_before_device_work);
            conv_test!(unaligned_channels_are_packing_errors);
            conv_test!(successive_calls_are_bit_identical);
            conv_test!(shape_change_respecializes);
            conv_test!(strict_shape_rejects_changes);
            conv_test!(swapped_channels_repack_the_filter);
            conv_test!(bias_changes_take_effect);
        }
    };
}
