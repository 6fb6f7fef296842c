//! Kernel display driver interface
//!
//! Buffer objects never talk to the kernel directly. Every allocation, mapping
//! and descriptor conversion goes through an implementation of [`KmsDriver`],
//! which keeps the buffer and surface logic independent of the actual ioctls.
//!
//! The crate ships [`DrmDumbDriver`] (feature `backend_drm`), which serves these
//! requests with dumb buffers and PRIME descriptor passing on an open drm node.
//!
//! ```rust,no_run
//! # use std::fs::OpenOptions;
//! use gbm_kms::backend::drm::DrmDumbDriver;
//! use gbm_kms::backend::Device;
//!
//! let file = OpenOptions::new()
//!     .read(true)
//!     .write(true)
//!     .open("/dev/dri/card0")
//!     .unwrap();
//! let device = Device::new(file).expect("no kms capable device");
//! # let _: &Device<DrmDumbDriver<std::fs::File>> = &device;
//! ```

use std::fmt;
use std::io;
use std::os::unix::io::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;

use drm_fourcc::DrmFourcc as Fourcc;

#[cfg(feature = "backend_drm")]
mod dumb;
mod error;
#[cfg(test)]
pub(crate) mod mock;

#[cfg(feature = "backend_drm")]
pub use self::dumb::{DrmDumbDriver, DumbBo};
pub use self::error::Error;

/// Side length of the fixed cursor allocation
pub const CURSOR_SIZE: u32 = 64;

/// Raw kernel (gem) handle of a buffer
///
/// Handles are only meaningful in combination with the device they were created on.
/// The value `0` never refers to a buffer and is used for buffers that were handed
/// to us without any kernel handle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    /// Handle not referring to any buffer
    pub const NULL: Handle = Handle(0);

    /// Returns `true` if this handle does not refer to a buffer
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Handle {
    #[inline]
    fn from(raw: u32) -> Self {
        Handle(raw)
    }
}

impl From<Handle> for u32 {
    #[inline]
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

/// Shape of a kernel allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoKind {
    /// Scanout buffer of the requested size, 32 bits per pixel
    Scanout,
    /// Cursor buffer, always [`CURSOR_SIZE`]x[`CURSOR_SIZE`] at 32 bits per pixel
    Cursor64x64,
}

impl BoKind {
    /// Dimensions actually allocated for a request of the given size
    pub fn dimensions(self, width: u32, height: u32) -> (u32, u32) {
        match self {
            BoKind::Scanout => (width, height),
            BoKind::Cursor64x64 => (CURSOR_SIZE, CURSOR_SIZE),
        }
    }
}

bitflags::bitflags! {
    /// Flags applied to exported file descriptors
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExportFlags: u32 {
        /// Close the descriptor on exec (`O_CLOEXEC`)
        const CLOEXEC = 0o2000000;
        /// Allow writable mappings of the exported descriptor (`O_RDWR`)
        const RDWR = 0o2;
    }
}

/// Kernel side storage of a buffer created by a [`KmsDriver`]
pub trait KmsBo: fmt::Debug {
    /// Kernel handle of the storage
    fn handle(&self) -> Handle;
    /// Bytes per row
    fn stride(&self) -> u32;
    /// Allocated dimensions, which may differ from the requested ones
    fn size(&self) -> (u32, u32);
}

/// Interface to the kernel display driver
///
/// All operations are synchronous and fallible. Storage returned by
/// [`allocate`](KmsDriver::allocate) is owned by the caller and has to be given back
/// through [`release`](KmsDriver::release), which is the only way to free it.
pub trait KmsDriver: fmt::Debug {
    /// Storage type of allocated buffers
    type Bo: KmsBo;

    /// Allocate new kernel storage for a 32 bit per pixel format
    fn allocate(&self, kind: BoKind, width: u32, height: u32, format: Fourcc) -> io::Result<Self::Bo>;

    /// Map the storage into the address space of this process
    fn map(&self, bo: &Self::Bo) -> io::Result<NonNull<u8>>;

    /// Remove a mapping again
    ///
    /// # Safety
    ///
    /// `addr` has to be returned by a previous call to [`map`](KmsDriver::map) for the
    /// same `bo` and must not be accessed anymore after this call.
    unsafe fn unmap(&self, bo: &Self::Bo, addr: NonNull<u8>);

    /// Free the kernel storage
    fn release(&self, bo: Self::Bo) -> io::Result<()>;

    /// Convert a dma-buf descriptor into a kernel handle on this device
    fn fd_to_handle(&self, fd: BorrowedFd<'_>) -> io::Result<Handle>;

    /// Export a kernel handle as a new dma-buf descriptor
    fn handle_to_fd(&self, handle: Handle, flags: ExportFlags) -> io::Result<OwnedFd>;
}
