//! Buffer allocation backend for kms compositors
//!
//! - [`Device`] binds a kernel display connection and creates buffers and surfaces
//! - [`allocator`] contains the buffer objects, the importer and the double-buffered surfaces
//! - [`drm`] describes the kernel driver interface and provides a dumb-buffer implementation

pub mod allocator;
pub mod drm;

mod device;
pub use self::device::Device;
