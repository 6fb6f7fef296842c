//! Importing buffers allocated elsewhere.
//!
//! Imported buffer objects always borrow their storage. Dropping them never
//! releases anything on the kernel side.

use std::fmt;
use std::os::unix::io::BorrowedFd;
use std::sync::Arc;

use smallvec::{smallvec, SmallVec};
use tracing::{debug, instrument, warn};

use super::{bo::Plane, format, is_trivial_modifier, BufferObject, Modifier, MAX_PLANES};
use crate::backend::drm::{Error, Handle, KmsDriver};

/// Buffer description provided by the buffer sharing layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalBuffer {
    /// Width of the buffer
    pub width: u32,
    /// Height of the buffer
    pub height: u32,
    /// Format code of the buffer, in either spelling
    pub format: u32,
    /// Stride of the first plane
    pub stride: u32,
    /// Kernel handle of the first plane
    pub handle: Handle,
    /// Plane layout of multi-planar buffers, empty otherwise
    pub planes: Vec<Plane>,
}

/// Opaque reference to a buffer shared by another process
///
/// Implemented by the buffer sharing layer for its resource type.
pub trait ExternalResource {
    /// Resolve the resource into a buffer description.
    ///
    /// Returns `None` if the resource does not refer to a kms buffer.
    fn resolve(&self) -> Option<ExternalBuffer>;
}

/// Source of an imported buffer object
#[derive(Clone, Copy)]
pub enum ImportSource<'a> {
    /// Buffer shared by another process through the buffer sharing layer
    External(&'a dyn ExternalResource),
    /// Single dma-buf descriptor with explicit metadata
    Fd {
        /// Descriptor of the buffer, only borrowed for the import
        fd: BorrowedFd<'a>,
        /// Width of the buffer
        width: u32,
        /// Height of the buffer
        height: u32,
        /// Bytes per row
        stride: u32,
        /// Format code of the buffer, in either spelling
        format: u32,
    },
    /// Set of dma-buf descriptors, one per plane
    FdModifier {
        /// Descriptors of the planes, only borrowed for the import
        fds: &'a [BorrowedFd<'a>],
        /// Strides of the planes
        strides: &'a [u32],
        /// Width of the buffer
        width: u32,
        /// Height of the buffer
        height: u32,
        /// Format code of the buffer, in either spelling
        format: u32,
        /// Requested layout, only the trivial layout is supported
        modifier: Modifier,
    },
}

impl<'a> fmt::Debug for ImportSource<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportSource::External(_) => f.write_str("External(..)"),
            ImportSource::Fd {
                fd,
                width,
                height,
                stride,
                format,
            } => f
                .debug_struct("Fd")
                .field("fd", fd)
                .field("width", width)
                .field("height", height)
                .field("stride", stride)
                .field("format", format)
                .finish(),
            ImportSource::FdModifier {
                fds,
                strides,
                width,
                height,
                format,
                modifier,
            } => f
                .debug_struct("FdModifier")
                .field("fds", fds)
                .field("strides", strides)
                .field("width", width)
                .field("height", height)
                .field("format", format)
                .field("modifier", modifier)
                .finish(),
        }
    }
}

impl<D: KmsDriver> BufferObject<D> {
    #[instrument(level = "trace", skip(driver), err)]
    #[profiling::function]
    pub(crate) fn import(driver: &Arc<D>, source: ImportSource<'_>) -> Result<Self, Error> {
        let bo = match source {
            ImportSource::External(resource) => import_external(driver, resource)?,
            ImportSource::Fd {
                fd,
                width,
                height,
                stride,
                format,
            } => {
                let handle = driver
                    .fd_to_handle(fd)
                    .map_err(Error::allocation("failed to import buffer descriptor"))?;
                BufferObject::borrowed(
                    driver,
                    (width, height),
                    format::canonicalize(format),
                    smallvec![Plane { handle, stride }],
                    None,
                    None,
                )
            }
            ImportSource::FdModifier {
                fds,
                strides,
                width,
                height,
                format,
                modifier,
            } => import_planes(driver, fds, strides, (width, height), format, modifier)?,
        };

        debug!(
            id = ?bo.id(),
            handle = ?bo.handle(),
            planes = bo.plane_count(),
            "imported buffer object"
        );
        Ok(bo)
    }
}

fn import_external<D: KmsDriver>(
    driver: &Arc<D>,
    resource: &dyn ExternalResource,
) -> Result<BufferObject<D>, Error> {
    let buffer = resource
        .resolve()
        .ok_or(Error::InvalidArgument("resource is not a kms buffer"))?;

    let planes: SmallVec<[Plane; MAX_PLANES]> = if buffer.planes.len() > 1 {
        if buffer.planes.len() > MAX_PLANES {
            return Err(Error::InvalidArgument("too many planes"));
        }
        buffer.planes.iter().copied().collect()
    } else {
        smallvec![Plane {
            handle: buffer.handle,
            stride: buffer.stride,
        }]
    };

    Ok(BufferObject::borrowed(
        driver,
        (buffer.width, buffer.height),
        format::canonicalize(buffer.format),
        planes,
        None,
        None,
    ))
}

fn import_planes<D: KmsDriver>(
    driver: &Arc<D>,
    fds: &[BorrowedFd<'_>],
    strides: &[u32],
    size: (u32, u32),
    format: u32,
    modifier: Modifier,
) -> Result<BufferObject<D>, Error> {
    if !is_trivial_modifier(modifier) {
        return Err(Error::InvalidArgument("unsupported layout modifier"));
    }
    if fds.is_empty() || fds.len() > MAX_PLANES {
        return Err(Error::InvalidArgument("plane count out of range"));
    }
    if strides.len() != fds.len() {
        return Err(Error::InvalidArgument("stride count does not match plane count"));
    }
    let mut planes = SmallVec::<[Plane; MAX_PLANES]>::new();
    for (fd, &stride) in fds.iter().zip(strides) {
        let handle = match driver.fd_to_handle(*fd) {
            Ok(handle) => handle,
            Err(source) => {
                // Handles of the earlier planes are not closed, the driver keeps
                // them until the device is closed.
                if !planes.is_empty() {
                    warn!(
                        orphaned = ?planes.iter().map(|plane| plane.handle).collect::<Vec<_>>(),
                        "multi-plane import aborted"
                    );
                }
                return Err(Error::Allocation {
                    errmsg: "failed to import plane descriptor",
                    source,
                });
            }
        };
        planes.push(Plane { handle, stride });
    }

    Ok(BufferObject::borrowed(
        driver,
        size,
        format::canonicalize(format),
        planes,
        None,
        None,
    ))
}
