//! Shared shape helpers used by the operator and the device backends.

/// Computes `product(dims)` with overflow checking.
pub fn checked_element_count_or_error<E, F>(dims: &[usize], mut on_overflow: F) -> Result<usize, E>
where
    F: FnMut() -> E,
{
    let mut count = 1usize;
    for dim in dims {
        count = count.checked_mul(*dim).ok_or_else(&mut on_overflow)?;
    }
    Ok(count)
}

/// Spatial output extent of a sliding window.
///
/// Returns `None` when the parameters are degenerate (zero window/stride/dilation), when the
/// effective window does not fit the padded input, or on overflow.
pub fn conv_output_extent(
    input: usize,
    window: usize,
    stride: usize,
    dilation: usize,
    pad_before: usize,
    pad_after: usize,
) -> Option<usize> {
    if window == 0 || stride == 0 || dilation == 0 {
        return None;
    }
    let effective = (window - 1).checked_mul(dilation)?.checked_add(1)?;
    let padded = input.checked_add(pad_before)?.checked_add(pad_after)?;
    if padded < effective {
        return None;
    }
    Some((padded - effective) / stride + 1)
}

/// `ceil(value / divisor)` for work-group partitioning; `divisor` must be non-zero.
pub const fn div_ceil(value: usize, divisor: usize) -> usize {
    (value + divisor - 1) / divisor
}

/// Narrows a dimension to the 32-bit integer width kernels take as scalar arguments.
pub fn to_kernel_int<E, F>(value: usize, on_overflow: F) -> Result<i32, E>
where
    F: FnOnce() -> E,
{
    i32::try_from(value).map_err(|_| on_overflow())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_extent_matches_valid_convolution() {
        assert_eq!(conv_output_extent(5, 3, 1, 1, 0, 0), Some(3));
        assert_eq!(conv_output_extent(5, 3, 2, 1, 0, 0), Some(2));
        assert_eq!(conv_output_extent(7, 1, 1, 1, 0, 0), Some(7));
    }

    #[test]
    fn output_extent_accounts_for_padding_and_dilation() {
        assert_eq!(conv_output_extent(5, 3, 1, 1, 1, 1), Some(5));
        assert_eq!(conv_output_extent(7, 3, 1, 2, 0, 0), Some(3));
    }

    #[test]
    fn output_extent_rejects_oversized_window() {
        assert_eq!(conv_output_extent(2, 3, 1, 1, 0, 0), None);
        assert_eq!(conv_output_extent(4, 0, 1, 1, 0, 0), None);
        assert_eq!(conv_output_extent(4, 1, 0, 1, 0, 0), None);
    }

    #[test]
    fn element_count_reports_overflow() {
        let err = checked_element_count_or_error(&[usize::MAX, 2], || "overflow".to_string())
            .expect_err("overflow should be reported");
        assert_eq!(err, "overflow");
    }

    #[test]
    fn div_ceil_rounds_up() {
        assert_eq!(div_ceil(0, 4), 0);
        assert_eq!(div_ceil(3, 8), 1);
        assert_eq!(div_ceil(8, 8), 1);
        assert_eq!(div_ceil(9, 8), 2);
    }
}
