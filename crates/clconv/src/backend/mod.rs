pub mod shape_helpers;
pub mod spec;
