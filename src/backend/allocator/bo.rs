//! Buffer objects handed out to the compositor.
//!
//! A [`BufferObject`] either owns its kernel storage (created through
//! [`Device::create_bo`](crate::backend::Device::create_bo)) or merely references
//! storage somebody else is responsible for (imported buffers and buffers substituted
//! into a [`Surface`](super::Surface)). Only owned storage is ever mapped through or
//! released to the kernel driver.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::{smallvec, SmallVec};
use tracing::{debug, instrument, trace, warn};

use super::{format, Buffer, Format, Fourcc, Modifier, MAX_PLANES};
use crate::backend::drm::{BoKind, Error, ExportFlags, Handle, KmsBo, KmsDriver};

bitflags::bitflags! {
    /// Usage hints for buffer creation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Buffer is going to be presented on screen
        const SCANOUT = 1 << 0;
        /// Buffer is going to be used as a cursor, always allocated as 64x64
        const CURSOR = 1 << 1;
        /// Buffer is going to be rendered to
        const RENDERING = 1 << 2;
        /// Buffer is written by the cpu and gets mapped right away
        const WRITE = 1 << 3;
        /// Buffer has to use a linear layout
        const LINEAR = 1 << 4;
    }
}

/// Process-local identifier of a [`BufferObject`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> BufferId {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        BufferId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Kernel handle and stride of one plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    /// Kernel handle of the plane
    pub handle: Handle,
    /// Bytes per row of the plane
    pub stride: u32,
}

/// Who is responsible for the kernel storage of a buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The storage was allocated for this buffer object and is released with it
    Owned,
    /// The storage belongs to somebody else and is never released by us
    Borrowed,
}

#[derive(Debug, Default)]
struct MapState {
    addr: Option<NonNull<u8>>,
    refs: usize,
}

impl MapState {
    fn acquire(&mut self, addr: NonNull<u8>) -> usize {
        self.addr = Some(addr);
        self.refs += 1;
        self.refs
    }

    /// Drops one reference, returning the address once the last one is gone.
    fn release(&mut self) -> Option<NonNull<u8>> {
        let addr = self.addr?;
        self.refs -= 1;
        if self.refs == 0 {
            self.addr = None;
            Some(addr)
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct OwnedMemory<D: KmsDriver> {
    driver: Arc<D>,
    bo: ManuallyDrop<D::Bo>,
    export_fd: Option<OwnedFd>,
    map: MapState,
}

impl<D: KmsDriver> OwnedMemory<D> {
    fn new(driver: Arc<D>, bo: D::Bo) -> Self {
        OwnedMemory {
            driver,
            bo: ManuallyDrop::new(bo),
            export_fd: None,
            map: MapState::default(),
        }
    }
}

impl<D: KmsDriver> Drop for OwnedMemory<D> {
    fn drop(&mut self) {
        if let Some(addr) = self.map.addr.take() {
            // SAFETY: the address was returned by mapping this bo and the owning
            // buffer object, which all accesses borrow, is being dropped.
            unsafe { self.driver.unmap(&self.bo, addr) };
        }
        self.export_fd = None;

        // SAFETY: `bo` is never touched again
        let bo = unsafe { ManuallyDrop::take(&mut self.bo) };
        let handle = bo.handle();
        if let Err(err) = self.driver.release(bo) {
            warn!(?handle, ?err, "failed to release buffer object storage");
        }
    }
}

#[derive(Debug)]
struct BorrowedMemory {
    fd: Option<OwnedFd>,
    addr: Option<NonNull<u8>>,
    map: MapState,
}

#[derive(Debug)]
enum Memory<D: KmsDriver> {
    Owned(OwnedMemory<D>),
    Borrowed(BorrowedMemory),
}

/// A buffer object
///
/// Dropping it (or calling [`destroy`](BufferObject::destroy)) unmaps and releases owned
/// kernel storage and closes every descriptor the buffer object holds. Borrowed storage
/// is left untouched.
#[derive(Debug)]
pub struct BufferObject<D: KmsDriver> {
    id: BufferId,
    driver: Arc<D>,
    width: u32,
    height: u32,
    // canonical, but not necessarily a known fourcc for imported buffers
    format: u32,
    planes: SmallVec<[Plane; MAX_PLANES]>,
    size: usize,
    memory: Memory<D>,
    locked: bool,
}

impl<D: KmsDriver> BufferObject<D> {
    #[instrument(level = "trace", skip(driver), err)]
    #[profiling::function]
    pub(crate) fn create(
        driver: &Arc<D>,
        width: u32,
        height: u32,
        format: u32,
        usage: BufferUsage,
    ) -> Result<Self, Error> {
        let fourcc = format::supported_fourcc(format).ok_or(Error::InvalidArgument("unsupported format"))?;
        let kind = if usage.contains(BufferUsage::CURSOR) {
            BoKind::Cursor64x64
        } else {
            BoKind::Scanout
        };

        let bo = driver
            .allocate(kind, width, height, fourcc)
            .map_err(Error::allocation("failed to allocate buffer object"))?;
        let plane = Plane {
            handle: bo.handle(),
            stride: bo.stride(),
        };
        let (_, allocated_height) = bo.size();

        // dropping `memory` on any error below gives the storage back
        let mut memory = OwnedMemory::new(driver.clone(), bo);
        memory.export_fd = Some(
            driver
                .handle_to_fd(plane.handle, ExportFlags::CLOEXEC)
                .map_err(Error::allocation("failed to export buffer object"))?,
        );

        let mut buffer = BufferObject {
            id: BufferId::next(),
            driver: driver.clone(),
            width,
            height,
            format: fourcc as u32,
            planes: smallvec![plane],
            size: plane.stride as usize * allocated_height as usize,
            memory: Memory::Owned(memory),
            locked: false,
        };

        if usage.contains(BufferUsage::WRITE) {
            buffer.map_acquire()?;
        }

        debug!(id = ?buffer.id, handle = ?plane.handle, stride = plane.stride, "created buffer object");
        Ok(buffer)
    }

    pub(crate) fn borrowed(
        driver: &Arc<D>,
        (width, height): (u32, u32),
        format: u32,
        planes: SmallVec<[Plane; MAX_PLANES]>,
        fd: Option<OwnedFd>,
        addr: Option<NonNull<u8>>,
    ) -> Self {
        let stride = planes.first().map_or(0, |plane| plane.stride);
        BufferObject {
            id: BufferId::next(),
            driver: driver.clone(),
            width,
            height,
            format,
            planes,
            size: stride as usize * height as usize,
            memory: Memory::Borrowed(BorrowedMemory {
                fd,
                addr,
                map: MapState::default(),
            }),
            locked: false,
        }
    }

    /// Process-local identifier of this buffer object
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Canonical format code
    ///
    /// Imported buffers keep whatever code they were described with, even if it is not a
    /// known fourcc.
    pub fn format_code(&self) -> u32 {
        self.format
    }

    /// Pixel format, if the format code is a known fourcc
    pub fn fourcc(&self) -> Option<Fourcc> {
        Fourcc::try_from(self.format).ok()
    }

    /// Stride of the first plane
    pub fn stride(&self) -> u32 {
        self.planes.first().map_or(0, |plane| plane.stride)
    }

    /// Kernel handle of the first plane
    pub fn handle(&self) -> Handle {
        self.planes.first().map_or(Handle::NULL, |plane| plane.handle)
    }

    /// Number of planes
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// All planes in order
    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    fn plane(&self, plane: usize) -> Result<&Plane, Error> {
        self.planes
            .get(plane)
            .ok_or(Error::InvalidArgument("plane index out of range"))
    }

    /// Stride of the given plane
    pub fn stride_for_plane(&self, plane: usize) -> Result<u32, Error> {
        self.plane(plane).map(|plane| plane.stride)
    }

    /// Kernel handle of the given plane
    pub fn handle_for_plane(&self, plane: usize) -> Result<Handle, Error> {
        self.plane(plane).map(|plane| plane.handle)
    }

    /// Offset of the given plane inside its storage
    ///
    /// Planes are never packed into a shared allocation, so this is always zero.
    pub fn offset(&self, plane: usize) -> Result<u32, Error> {
        self.plane(plane).map(|_| 0)
    }

    /// Layout modifier of this buffer
    ///
    /// Explicit modifiers are unsupported, this always reports [`Modifier::Invalid`].
    pub fn modifier(&self) -> Modifier {
        Modifier::Invalid
    }

    /// Size of the cpu accessible storage in bytes
    pub fn size_bytes(&self) -> usize {
        self.size
    }

    /// Whether the kernel storage is owned by this buffer object
    pub fn ownership(&self) -> Ownership {
        match self.memory {
            Memory::Owned(_) => Ownership::Owned,
            Memory::Borrowed(_) => Ownership::Borrowed,
        }
    }

    /// Returns `true` while the display pipeline holds on to this buffer
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub(crate) fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    fn map_state(&self) -> &MapState {
        match &self.memory {
            Memory::Owned(owned) => &owned.map,
            Memory::Borrowed(borrowed) => &borrowed.map,
        }
    }

    /// Returns `true` while at least one mapping reference is held
    pub fn is_mapped(&self) -> bool {
        self.map_state().addr.is_some()
    }

    /// Number of mapping references currently held
    pub fn map_count(&self) -> usize {
        self.map_state().refs
    }

    /// Descriptor exported on creation, if this buffer object holds one
    pub fn export_fd(&self) -> Option<BorrowedFd<'_>> {
        match &self.memory {
            Memory::Owned(owned) => owned.export_fd.as_ref().map(AsFd::as_fd),
            Memory::Borrowed(borrowed) => borrowed.fd.as_ref().map(AsFd::as_fd),
        }
    }

    /// Acquire a reference to the cpu mapping of this buffer object.
    ///
    /// The first reference maps the storage, every further one returns the same address.
    /// Each successful call has to be paired with a call to [`map_release`](BufferObject::map_release),
    /// see [`map`](BufferObject::map) for a scoped alternative.
    ///
    /// Borrowed buffer objects can only be mapped if they were given an address.
    pub fn map_acquire(&mut self) -> Result<NonNull<u8>, Error> {
        let (map, addr) = match &mut self.memory {
            Memory::Owned(owned) => {
                let addr = match owned.map.addr {
                    Some(addr) => addr,
                    None => owned
                        .driver
                        .map(&owned.bo)
                        .map_err(Error::allocation("failed to map buffer object"))?,
                };
                (&mut owned.map, addr)
            }
            Memory::Borrowed(borrowed) => {
                let addr = borrowed
                    .addr
                    .ok_or(Error::InvalidArgument("buffer object has no cpu accessible storage"))?;
                (&mut borrowed.map, addr)
            }
        };

        let refs = map.acquire(addr);
        trace!(id = ?self.id, refs, "acquired mapping");
        Ok(addr)
    }

    /// Map a region of this buffer object.
    ///
    /// Only the full buffer can be mapped, any other region is rejected.
    pub fn map_region(&mut self, x: u32, y: u32, width: u32, height: u32) -> Result<NonNull<u8>, Error> {
        if (x, y, width, height) != (0, 0, self.width, self.height) {
            return Err(Error::InvalidArgument("only the full buffer can be mapped"));
        }
        self.map_acquire()
    }

    /// Release a reference to the cpu mapping.
    ///
    /// The storage is unmapped once the last reference is released.
    /// Releasing an unmapped buffer object does nothing.
    pub fn map_release(&mut self) {
        let id = self.id;
        match &mut self.memory {
            Memory::Owned(owned) => {
                if let Some(addr) = owned.map.release() {
                    // SAFETY: the last reference is gone, nothing may access the mapping anymore
                    unsafe { owned.driver.unmap(&owned.bo, addr) };
                    trace!(?id, "unmapped buffer object");
                }
            }
            Memory::Borrowed(borrowed) => {
                borrowed.map.release();
            }
        }
    }

    /// Map this buffer object for the lifetime of the returned guard.
    pub fn map(&mut self) -> Result<Mapping<'_, D>, Error> {
        let addr = self.map_acquire()?;
        Ok(Mapping { bo: self, addr })
    }

    /// Copy `data` to the start of the mapped storage.
    ///
    /// Requires an active mapping and may not exceed [`size_bytes`](BufferObject::size_bytes).
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let addr = self.map_state().addr.ok_or(Error::NotMapped)?;
        if data.len() > self.size {
            return Err(Error::InvalidArgument("write exceeds buffer size"));
        }

        // SAFETY: the mapping covers `self.size` bytes and `data` cannot alias it
        // while we hold `&mut self`
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), addr.as_ptr(), data.len()) };
        Ok(())
    }

    /// Export a new dma-buf descriptor for the first plane.
    ///
    /// Each call returns a fresh descriptor owned by the caller. Buffer objects without a
    /// kernel handle duplicate the descriptor they were given instead.
    pub fn fd(&self) -> Result<OwnedFd, Error> {
        let handle = self.handle();
        if handle.is_null() {
            return match self.export_fd() {
                Some(fd) => fd
                    .try_clone_to_owned()
                    .map_err(Error::allocation("failed to duplicate buffer descriptor")),
                None => Err(Error::InvalidArgument("buffer object has no kernel handle")),
            };
        }
        self.driver
            .handle_to_fd(handle, ExportFlags::CLOEXEC)
            .map_err(Error::allocation("failed to export buffer object"))
    }

    /// Destroy this buffer object.
    ///
    /// Equivalent to dropping it. The buffer object must not be locked.
    pub fn destroy(self) {}
}

impl<D: KmsDriver> Drop for BufferObject<D> {
    fn drop(&mut self) {
        if self.locked {
            warn!(id = ?self.id, "destroying buffer object still locked for display");
        }
        trace!(id = ?self.id, ownership = ?self.ownership(), "destroying buffer object");
    }
}

impl<D: KmsDriver> Buffer for BufferObject<D> {
    #[inline]
    fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    fn format(&self) -> Option<Format> {
        self.fourcc().map(|code| Format {
            code,
            modifier: Modifier::Invalid,
        })
    }
}

/// Scoped mapping of a [`BufferObject`]
///
/// Holds one mapping reference, which is released on drop.
#[derive(Debug)]
pub struct Mapping<'a, D: KmsDriver> {
    bo: &'a mut BufferObject<D>,
    addr: NonNull<u8>,
}

impl<'a, D: KmsDriver> Mapping<'a, D> {
    /// Address of the mapping
    pub fn addr(&self) -> NonNull<u8> {
        self.addr
    }

    /// The mapped buffer object
    pub fn buffer(&self) -> &BufferObject<D> {
        self.bo
    }

    /// See [`BufferObject::write`]
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.bo.write(data)
    }
}

impl<'a, D: KmsDriver> Deref for Mapping<'a, D> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the mapping stays alive and covers `size` bytes until the guard is dropped
        unsafe { slice::from_raw_parts(self.addr.as_ptr(), self.bo.size) }
    }
}

impl<'a, D: KmsDriver> DerefMut for Mapping<'a, D> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `deref`, the guard holds the only borrow of the buffer object
        unsafe { slice::from_raw_parts_mut(self.addr.as_ptr(), self.bo.size) }
    }
}

impl<'a, D: KmsDriver> Drop for Mapping<'a, D> {
    fn drop(&mut self) {
        self.bo.map_release();
    }
}
