//! Linear memory access: cached typed views and value marshaling.

pub mod marshal;
pub mod views;

pub use marshal::{Utf8Decoder, DEFAULT_ROTATION_BYTES};
pub use views::{BufferId, Element, TypedView, ViewCache, ViewKind};
