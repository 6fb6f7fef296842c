//! [`KmsDriver`] for [dumb buffers](https://docs.kernel.org/gpu/drm-kms.html#dumb-buffer-objects)

use std::fmt;
use std::io;
use std::num::NonZeroU32;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::ptr::{self, NonNull};

use drm::buffer::{Buffer as DrmBuffer, Handle as DrmHandle};
use drm::control::{dumbbuffer::DumbBuffer, Device as ControlDevice};
use drm::{Device as BasicDevice, DriverCapability};
use drm_fourcc::DrmFourcc as Fourcc;
use rustix::mm::{MapFlags, ProtFlags};
use tracing::{debug, trace, warn};

use super::{BoKind, Error, ExportFlags, Handle, KmsBo, KmsDriver};

/// Both supported formats are packed 32 bit formats
const BPP: u32 = 32;

struct DrmFd<A: AsFd>(A);

impl<A: AsFd> fmt::Debug for DrmFd<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DrmFd").field(&self.0.as_fd()).finish()
    }
}

impl<A: AsFd> AsFd for DrmFd<A> {
    #[inline]
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl<A: AsFd> BasicDevice for DrmFd<A> {}
impl<A: AsFd> ControlDevice for DrmFd<A> {}

fn drm_handle(handle: Handle) -> io::Result<DrmHandle> {
    NonZeroU32::new(handle.into())
        .map(DrmHandle::from)
        .ok_or_else(|| io::ErrorKind::InvalidInput.into())
}

/// Storage of a dumb buffer
#[derive(Debug)]
pub struct DumbBo {
    buffer: DumbBuffer,
    length: usize,
}

impl KmsBo for DumbBo {
    #[inline]
    fn handle(&self) -> Handle {
        Handle::from(u32::from(self.buffer.handle()))
    }

    #[inline]
    fn stride(&self) -> u32 {
        self.buffer.pitch()
    }

    #[inline]
    fn size(&self) -> (u32, u32) {
        self.buffer.size()
    }
}

/// Driver allocating dumb buffers on an open drm node
pub struct DrmDumbDriver<A: AsFd + 'static> {
    fd: DrmFd<A>,
}

impl<A: AsFd + 'static> fmt::Debug for DrmDumbDriver<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmDumbDriver").field("fd", &self.fd).finish()
    }
}

impl<A: AsFd + 'static> DrmDumbDriver<A> {
    /// Open an allocation session on the given drm node.
    ///
    /// Fails if the node is not a drm device or does not support dumb buffers.
    pub fn new(fd: A) -> Result<Self, Error> {
        let fd = DrmFd(fd);

        let supported = fd
            .get_driver_capability(DriverCapability::DumbBuffer)
            .map_err(Error::allocation("failed to query dumb buffer capability"))?;
        if supported == 0 {
            return Err(Error::Allocation {
                errmsg: "device does not support dumb buffers",
                source: io::ErrorKind::Unsupported.into(),
            });
        }

        match fd.get_driver() {
            Ok(driver) => debug!(driver = ?driver.name(), "opened kms allocation session"),
            Err(err) => debug!(?err, "opened kms allocation session on unknown driver"),
        }

        Ok(DrmDumbDriver { fd })
    }

    /// Borrow the underlying drm node
    pub fn device_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl<A: AsFd + 'static> KmsDriver for DrmDumbDriver<A> {
    type Bo = DumbBo;

    fn allocate(&self, kind: BoKind, width: u32, height: u32, format: Fourcc) -> io::Result<DumbBo> {
        let (width, height) = kind.dimensions(width, height);
        let buffer = self.fd.create_dumb_buffer((width, height), format, BPP)?;
        trace!(handle = ?buffer.handle(), pitch = buffer.pitch(), ?kind, "created dumb buffer");

        Ok(DumbBo {
            length: buffer.pitch() as usize * height as usize,
            buffer,
        })
    }

    fn map(&self, bo: &DumbBo) -> io::Result<NonNull<u8>> {
        // `map_dumb_buffer` ties the mapping to a borrow of the buffer, while ours lives
        // until the last map reference is released, so it is set up by hand.
        let map = drm_ffi::mode::dumbbuffer::map(self.fd.as_fd(), bo.buffer.handle().into(), 0, 0)?;

        // SAFETY: the offset was just handed out by the kernel for this buffer and the
        // length does not exceed the allocation. Nothing else is mapped at the returned address.
        let addr = unsafe {
            rustix::mm::mmap(
                ptr::null_mut(),
                bo.length,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                self.fd.as_fd(),
                map.offset,
            )
        }?;

        NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::ErrorKind::InvalidData.into())
    }

    unsafe fn unmap(&self, bo: &DumbBo, addr: NonNull<u8>) {
        // SAFETY: guaranteed by the caller, `addr` is a mapping of `bo.length` bytes
        if let Err(err) = unsafe { rustix::mm::munmap(addr.as_ptr().cast(), bo.length) } {
            warn!(handle = ?bo.buffer.handle(), ?err, "failed to unmap dumb buffer");
        }
    }

    fn release(&self, bo: DumbBo) -> io::Result<()> {
        trace!(handle = ?bo.buffer.handle(), "destroying dumb buffer");
        self.fd.destroy_dumb_buffer(bo.buffer)
    }

    fn fd_to_handle(&self, fd: BorrowedFd<'_>) -> io::Result<Handle> {
        let handle = self.fd.prime_fd_to_buffer(fd)?;
        Ok(Handle::from(u32::from(handle)))
    }

    fn handle_to_fd(&self, handle: Handle, flags: ExportFlags) -> io::Result<OwnedFd> {
        self.fd.buffer_to_prime_fd(drm_handle(handle)?, flags.bits())
    }
}
