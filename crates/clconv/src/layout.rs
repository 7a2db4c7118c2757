//! Host-side filter layouts for the device programs.
//!
//! The filter arrives as a row-major `[rows, cols]` matrix where `rows` is the output channel
//! count and `cols` the per-output-channel reduction extent. Strategies either consume it as is
//! or as an RGBA image whose texels hold four consecutive elements of a row.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::spec::ImageExtent;

/// Scalars packed into one image texel.
pub const TEXEL_WIDTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("{what} ({value}) is not a multiple of {TEXEL_WIDTH}")]
    NotTexelAligned { what: &'static str, value: usize },
    #[error("matrix views disagree: source {src:?}, destination {dst:?}")]
    ViewMismatch { src: MatrixView, dst: MatrixView },
    #[error("{side} view {view:?} addresses past the end of a {len}-element slice")]
    OutOfBounds {
        side: &'static str,
        view: MatrixView,
        len: usize,
    },
}

/// Strided view of a 2-D matrix inside a flat slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixView {
    pub rows: usize,
    pub cols: usize,
    pub row_stride: usize,
    pub col_stride: usize,
}

impl MatrixView {
    pub const fn row_major(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            row_stride: cols,
            col_stride: 1,
        }
    }

    pub const fn index(&self, row: usize, col: usize) -> usize {
        row * self.row_stride + col * self.col_stride
    }

    /// Minimum slice length the view touches; `None` on overflow.
    pub fn required_len(&self) -> Option<usize> {
        if self.rows == 0 || self.cols == 0 {
            return Some(0);
        }
        let last_row = (self.rows - 1).checked_mul(self.row_stride)?;
        let last_col = (self.cols - 1).checked_mul(self.col_stride)?;
        last_row.checked_add(last_col)?.checked_add(1)
    }

    fn check_fits(&self, side: &'static str, len: usize) -> Result<(), LayoutError> {
        match self.required_len() {
            Some(required) if required <= len => Ok(()),
            _ => Err(LayoutError::OutOfBounds {
                side,
                view: *self,
                len,
            }),
        }
    }
}

/// Writes the transpose of `src` into `dst`: `dst[c, r] = src[r, c]`.
pub fn transpose_2d<T: Copy>(
    src: &[T],
    src_view: MatrixView,
    dst: &mut [T],
    dst_view: MatrixView,
) -> Result<(), LayoutError> {
    if src_view.rows != dst_view.cols || src_view.cols != dst_view.rows {
        return Err(LayoutError::ViewMismatch {
            src: src_view,
            dst: dst_view,
        });
    }
    src_view.check_fits("source", src.len())?;
    dst_view.check_fits("destination", dst.len())?;

    for row in 0..src_view.rows {
        for col in 0..src_view.cols {
            dst[dst_view.index(col, row)] = src[src_view.index(row, col)];
        }
    }
    Ok(())
}

/// Device layout a strategy consumes its filter in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterPacking {
    /// Buffer holding the filter unchanged.
    Plain,
    /// `[cols, rows]` transpose, imaged as (rows / 4) x cols texels.
    TransposedImage,
    /// Original `[rows, cols]` order, imaged as (cols / 4) x rows texels.
    RowImage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackedFilter {
    pub packing: FilterPacking,
    pub data: Vec<f32>,
    pub image: Option<ImageExtent>,
}

impl PackedFilter {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn texel_columns(what: &'static str, value: usize) -> Result<usize, LayoutError> {
    if value % TEXEL_WIDTH != 0 {
        return Err(LayoutError::NotTexelAligned { what, value });
    }
    Ok(value / TEXEL_WIDTH)
}

/// Arranges a row-major `[rows, cols]` filter for `packing`.
pub fn pack_filter(
    filter: &[f32],
    packing: FilterPacking,
    rows: usize,
    cols: usize,
) -> Result<PackedFilter, LayoutError> {
    let source = MatrixView::row_major(rows, cols);
    source.check_fits("source", filter.len())?;

    match packing {
        FilterPacking::Plain => Ok(PackedFilter {
            packing,
            data: filter.to_vec(),
            image: None,
        }),
        FilterPacking::TransposedImage => {
            let width = texel_columns("output channels", rows)?;
            let mut data = vec![0.0f32; rows * cols];
            transpose_2d(filter, source, &mut data, MatrixView::row_major(cols, rows))?;
            Ok(PackedFilter {
                packing,
                data,
                image: Some(ImageExtent::new(width, cols)),
            })
        }
        FilterPacking::RowImage => {
            let width = texel_columns("filter row extent", cols)?;
            Ok(PackedFilter {
                packing,
                data: filter[..rows * cols].to_vec(),
                image: Some(ImageExtent::new(width, rows)),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transpose_swaps_axes() {
        let src = [1, 2, 3, 4, 5, 6];
        let mut dst = [0; 6];
        transpose_2d(
            &src,
            MatrixView::row_major(2, 3),
            &mut dst,
            MatrixView::row_major(3, 2),
        )
        .expect("transpose");
        assert_eq!(dst, [1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn transpose_honours_strides() {
        // 2x2 window of a 3x3 matrix, written into a column-major destination.
        let src = [1, 2, 0, 3, 4, 0, 0, 0, 0];
        let src_view = MatrixView {
            rows: 2,
            cols: 2,
            row_stride: 3,
            col_stride: 1,
        };
        let dst_view = MatrixView {
            rows: 2,
            cols: 2,
            row_stride: 1,
            col_stride: 2,
        };
        let mut dst = [0; 4];
        transpose_2d(&src, src_view, &mut dst, dst_view).expect("transpose");
        // dst[c, r] = src[r, c] at index c + r * 2, so the buffer reads back in source order.
        assert_eq!(dst, [1, 2, 3, 4]);
    }

    #[test]
    fn transpose_rejects_mismatched_views() {
        let src = [0.0f32; 6];
        let mut dst = [0.0f32; 6];
        let err = transpose_2d(
            &src,
            MatrixView::row_major(2, 3),
            &mut dst,
            MatrixView::row_major(2, 3),
        )
        .expect_err("shape mismatch");
        assert!(matches!(err, LayoutError::ViewMismatch { .. }));
    }

    #[test]
    fn transpose_rejects_short_destination() {
        let src = [0.0f32; 6];
        let mut dst = [0.0f32; 5];
        let err = transpose_2d(
            &src,
            MatrixView::row_major(2, 3),
            &mut dst,
            MatrixView::row_major(3, 2),
        )
        .expect_err("too short");
        assert!(matches!(
            err,
            LayoutError::OutOfBounds {
                side: "destination",
                ..
            }
        ));
    }

    #[test]
    fn plain_packing_copies_verbatim() {
        let filter: Vec<f32> = (0..8).map(|v| v as f32).collect();
        let packed = pack_filter(&filter, FilterPacking::Plain, 2, 4).expect("pack");
        assert_eq!(packed.data, filter);
        assert_eq!(packed.image, None);
    }

    #[test]
    fn transposed_image_is_reduction_major() {
        // 4 output channels x 2 reduction elements.
        let filter: Vec<f32> = (0..8).map(|v| v as f32).collect();
        let packed = pack_filter(&filter, FilterPacking::TransposedImage, 4, 2).expect("pack");
        assert_eq!(packed.image, Some(ImageExtent::new(1, 2)));
        assert_eq!(packed.data, vec![0.0, 2.0, 4.0, 6.0, 1.0, 3.0, 5.0, 7.0]);
    }

    #[test]
    fn row_image_keeps_order() {
        let filter: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let packed = pack_filter(&filter, FilterPacking::RowImage, 2, 8).expect("pack");
        assert_eq!(packed.image, Some(ImageExtent::new(2, 2)));
        assert_eq!(packed.data, filter);
    }

    #[test]
    fn image_packings_require_texel_alignment() {
        let filter = vec![0.0f32; 18];
        let err = pack_filter(&filter, FilterPacking::TransposedImage, 6, 3).expect_err("rows");
        assert_eq!(
            err,
            LayoutError::NotTexelAligned {
                what: "output channels",
                value: 6
            }
        );
        let err = pack_filter(&filter, FilterPacking::RowImage, 3, 6).expect_err("cols");
        assert_eq!(
            err,
            LayoutError::NotTexelAligned {
                what: "filter row extent",
                value: 6
            }
        );
    }

    #[test]
    fn packing_rejects_short_filters() {
        let err = pack_filter(&[0.0; 7], FilterPacking::Plain, 2, 4).expect_err("short");
        assert!(matches!(err, LayoutError::OutOfBounds { .. }));
    }
}
