//! Buffer allocation and management.
//!
//! Collection of the types handed to a compositor:
//!
//! - [`BufferObject`]s, either allocated by the kernel driver or imported from
//!   externally provided storage (see [`ImportSource`])
//! - [`Surface`]s, pairs of buffer slots implementing the front/back buffer handoff
//!   of a render loop
//!
//! Helpers:
//! - [`format`] to canonicalize the different spellings of the supported formats

mod bo;
pub mod format;
mod import;
mod surface;

pub use bo::{BufferId, BufferObject, BufferUsage, Mapping, Ownership, Plane};
pub use import::{ExternalBuffer, ExternalResource, ImportSource};
pub use surface::{SlotBuffer, Surface, SLOT_COUNT};

pub use drm_fourcc::{
    DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier, UnrecognizedFourcc,
};

/// Maximum amount of planes a buffer object may consist of
pub const MAX_PLANES: usize = 3;

/// Common trait describing common properties of most types of buffers.
pub trait Buffer {
    /// Width of the two-dimensional buffer
    fn width(&self) -> u32;
    /// Height of the two-dimensional buffer
    fn height(&self) -> u32;
    /// Size (w x h) of the two-dimensional buffer
    fn size(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
    /// Pixel format of the buffer, `None` if its format code is not a known fourcc
    fn format(&self) -> Option<Format>;
}

/// Interface to create Buffers
pub trait Allocator {
    /// Buffer type produced by this allocator
    type Buffer: Buffer;
    /// Error type thrown if allocations fail
    type Error: std::error::Error;

    /// Try to create a buffer with the given dimensions and pixel format
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Self::Buffer, Self::Error>;
}

/// Returns `true` if the modifier describes the trivial layout, the only one supported.
pub fn is_trivial_modifier(modifier: Modifier) -> bool {
    modifier == Modifier::Linear || modifier == Modifier::Invalid
}
