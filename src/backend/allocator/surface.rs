use std::os::unix::io::OwnedFd;
use std::ptr::NonNull;
use std::sync::Arc;

use smallvec::smallvec;
use tracing::{debug, instrument, trace, warn};

use super::{format, BufferId, BufferObject, BufferUsage, Fourcc, Plane};
use crate::backend::drm::{Error, Handle, KmsDriver};

/// Number of buffer slots of a [`Surface`]
pub const SLOT_COUNT: usize = 2;

/// Externally produced buffer to be installed into a [`Surface`] slot
///
/// The buffer object created from it has no kernel handle and never releases any kernel
/// storage, but takes ownership of the descriptor, if one is given.
#[derive(Debug)]
pub struct SlotBuffer {
    fd: Option<OwnedFd>,
    addr: Option<NonNull<u8>>,
    stride: u32,
}

impl SlotBuffer {
    /// Buffer shared as a dma-buf descriptor
    pub fn from_fd(fd: OwnedFd, stride: u32) -> SlotBuffer {
        SlotBuffer {
            fd: Some(fd),
            addr: None,
            stride,
        }
    }

    /// Buffer already mapped into this process, optionally also shared as a dma-buf descriptor.
    ///
    /// # Safety
    ///
    /// `addr` has to be valid for reads and writes of `stride * height` bytes, `height`
    /// being the height of the surface the buffer is installed into, for as long as the
    /// surface slot holds on to the buffer.
    pub unsafe fn from_raw_parts(addr: NonNull<u8>, fd: Option<OwnedFd>, stride: u32) -> SlotBuffer {
        SlotBuffer {
            fd,
            addr: Some(addr),
            stride,
        }
    }
}

/// Double-buffered drawing surface
///
/// ## How am I supposed to use this?
///
/// A surface holds two buffer slots sharing the surface geometry. At any time one of
/// them may be the *front* slot, holding the most recently completed frame, while the
/// other one is available to render the next frame into.
///
/// The render loop drives the handoff:
///
/// 1. Check [`has_free_buffer`](Surface::has_free_buffer) before composing a new frame.
/// 2. Populate the non-front slot, either through [`set_slot`](Surface::set_slot) with an
///    externally produced buffer or by rendering into a buffer created with
///    [`allocate_slot`](Surface::allocate_slot).
/// 3. Advance the front to that slot with [`set_front`](Surface::set_front).
/// 4. Hand the frame to the display pipeline through [`lock_front_buffer`](Surface::lock_front_buffer).
/// 5. Call [`release_buffer`](Surface::release_buffer) once the display is done with it.
///
/// Locked buffers must be released before their slot is replaced or the surface is destroyed.
#[derive(Debug)]
pub struct Surface<D: KmsDriver> {
    driver: Arc<D>,
    width: u32,
    height: u32,
    format: Fourcc,
    flags: BufferUsage,
    slots: [Option<BufferObject<D>>; SLOT_COUNT],
    front: Option<usize>,
}

fn check_index(index: usize) -> Result<usize, Error> {
    if index < SLOT_COUNT {
        Ok(index)
    } else {
        Err(Error::InvalidArgument("slot index out of range"))
    }
}

impl<D: KmsDriver> Surface<D> {
    pub(crate) fn new(
        driver: &Arc<D>,
        width: u32,
        height: u32,
        format: u32,
        flags: BufferUsage,
    ) -> Result<Surface<D>, Error> {
        let format = format::supported_fourcc(format).ok_or(Error::InvalidArgument("unsupported format"))?;
        debug!(width, height, ?format, ?flags, "created surface");

        Ok(Surface {
            driver: driver.clone(),
            width,
            height,
            format,
            flags,
            slots: [None, None],
            front: None,
        })
    }

    /// Width of the surface buffers
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height of the surface buffers
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel format of the surface buffers
    pub fn fourcc(&self) -> Fourcc {
        self.format
    }

    /// Usage flags the surface was created with
    pub fn flags(&self) -> BufferUsage {
        self.flags
    }

    /// Replace the buffer of a slot with an externally produced one.
    ///
    /// Any buffer object currently held by the slot is destroyed first. Passing `None`
    /// leaves the slot empty.
    #[instrument(level = "trace", skip(self))]
    pub fn set_slot(&mut self, index: usize, buffer: Option<SlotBuffer>) -> Result<(), Error> {
        let index = check_index(index)?;
        if let Some(old) = self.slots[index].take() {
            if old.is_locked() {
                warn!(index, id = ?old.id(), "replacing buffer still locked for display");
            }
            old.destroy();
        }

        let Some(buffer) = buffer else {
            trace!(index, "cleared slot");
            return Ok(());
        };

        let bo = BufferObject::borrowed(
            &self.driver,
            (self.width, self.height),
            self.format as u32,
            smallvec![Plane {
                handle: Handle::NULL,
                stride: buffer.stride,
            }],
            buffer.fd,
            buffer.addr,
        );

        trace!(index, id = ?bo.id(), "installed buffer");
        self.slots[index] = Some(bo);
        Ok(())
    }

    /// Fill a slot with a newly allocated, cpu mapped buffer object of the surface geometry.
    ///
    /// Any buffer object currently held by the slot is destroyed first.
    #[instrument(level = "trace", skip(self))]
    pub fn allocate_slot(&mut self, index: usize) -> Result<&mut BufferObject<D>, Error> {
        let index = check_index(index)?;
        if let Some(old) = self.slots[index].take() {
            if old.is_locked() {
                warn!(index, id = ?old.id(), "replacing buffer still locked for display");
            }
            old.destroy();
        }

        let bo = BufferObject::create(
            &self.driver,
            self.width,
            self.height,
            self.format as u32,
            self.flags | BufferUsage::WRITE,
        )?;
        Ok(self.slots[index].insert(bo))
    }

    /// Buffer object held by the given slot
    pub fn slot(&self, index: usize) -> Option<&BufferObject<D>> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Mutable access to the buffer object held by the given slot, e.g. to write to it
    pub fn slot_mut(&mut self, index: usize) -> Option<&mut BufferObject<D>> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Slot holding the most recently completed frame, if any
    pub fn front(&self) -> Option<usize> {
        self.front
    }

    /// Mark a slot as holding the most recently completed frame
    pub fn set_front(&mut self, front: Option<usize>) -> Result<(), Error> {
        self.front = front.map(check_index).transpose()?;
        trace!(front = ?self.front, "front buffer changed");
        Ok(())
    }

    /// Lock the front buffer for display.
    ///
    /// Returns `None` if there is no completed frame yet, meaning there is nothing to display.
    /// The returned buffer must not be modified until it is given back through
    /// [`release_buffer`](Surface::release_buffer).
    pub fn lock_front_buffer(&mut self) -> Option<&BufferObject<D>> {
        let front = self.front?;
        let bo = self.slots[front].as_mut()?;
        bo.set_locked(true);
        trace!(front, id = ?bo.id(), "locked front buffer");
        Some(bo)
    }

    /// Give a buffer obtained by [`lock_front_buffer`](Surface::lock_front_buffer) back.
    pub fn release_buffer(&mut self, id: BufferId) {
        match self.slots.iter_mut().flatten().find(|bo| bo.id() == id) {
            Some(bo) => {
                bo.set_locked(false);
                trace!(?id, "released buffer");
            }
            None => debug!(?id, "released buffer does not belong to this surface"),
        }
    }

    /// Returns `true` if at least one slot is empty or holds an unlocked buffer object
    pub fn has_free_buffer(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.as_ref().map_or(true, |bo| !bo.is_locked()))
    }

    /// Destroy the surface and the buffer objects of both slots.
    ///
    /// Neither slot may be locked anymore.
    pub fn destroy(self) {
        trace!(width = self.width, height = self.height, "destroying surface");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::{Buffer, Ownership};
    use crate::backend::drm::mock::{fds, init_logging, MockDriver};

    fn surface(width: u32, height: u32) -> (Arc<MockDriver>, Surface<MockDriver>) {
        init_logging();
        let driver = Arc::new(MockDriver::default());
        let surface = Surface::new(&driver, width, height, Fourcc::Xrgb8888 as u32, BufferUsage::SCANOUT).unwrap();
        (driver, surface)
    }

    fn slot_buffer(stride: u32) -> SlotBuffer {
        SlotBuffer::from_fd(fds(1).remove(0), stride)
    }

    #[test]
    fn front_buffer_handoff() {
        let (_driver, mut surface) = surface(640, 480);
        assert!(surface.lock_front_buffer().is_none());
        assert!(surface.has_free_buffer());

        surface.set_slot(0, Some(slot_buffer(2560))).unwrap();
        surface.set_front(Some(0)).unwrap();

        let locked = surface.lock_front_buffer().unwrap();
        assert!(locked.is_locked());
        assert_eq!(locked.stride(), 2560);
        assert_eq!(locked.size(), (640, 480));
        assert_eq!(locked.fourcc(), Some(Fourcc::Xrgb8888));
        assert_eq!(locked.ownership(), Ownership::Borrowed);
        let id = locked.id();
        assert_eq!(surface.slot(0).map(BufferObject::id), Some(id));

        // slot 1 is still free
        assert!(surface.has_free_buffer());

        surface.release_buffer(id);
        assert!(surface.has_free_buffer());
        assert!(!surface.slot(0).unwrap().is_locked());
    }

    #[test]
    fn no_free_buffer_while_both_locked() {
        let (_driver, mut surface) = surface(64, 64);
        surface.set_slot(0, Some(slot_buffer(256))).unwrap();
        surface.set_slot(1, Some(slot_buffer(256))).unwrap();

        surface.set_front(Some(0)).unwrap();
        let first = surface.lock_front_buffer().unwrap().id();
        surface.set_front(Some(1)).unwrap();
        let second = surface.lock_front_buffer().unwrap().id();
        assert_ne!(first, second);
        assert!(!surface.has_free_buffer());

        surface.release_buffer(first);
        assert!(surface.has_free_buffer());
        surface.release_buffer(second);
    }

    #[test]
    fn front_on_empty_slot_locks_nothing() {
        let (_driver, mut surface) = surface(64, 64);
        surface.set_front(Some(1)).unwrap();
        assert_eq!(surface.front(), Some(1));
        assert!(surface.lock_front_buffer().is_none());
    }

    #[test]
    fn slot_index_is_checked() {
        let (_driver, mut surface) = surface(64, 64);
        assert!(matches!(
            surface.set_slot(2, Some(slot_buffer(256))),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(surface.set_front(Some(2)), Err(Error::InvalidArgument(_))));
        assert!(matches!(surface.allocate_slot(5), Err(Error::InvalidArgument(_))));
        assert_eq!(surface.front(), None);
        assert!(surface.slot(2).is_none());
    }

    #[test]
    fn set_slot_replaces_and_clears() {
        let (driver, mut surface) = surface(64, 64);
        surface.allocate_slot(0).unwrap();
        assert_eq!(surface.slot(0).unwrap().ownership(), Ownership::Owned);

        surface.set_slot(0, Some(slot_buffer(256))).unwrap();
        assert_eq!(surface.slot(0).unwrap().ownership(), Ownership::Borrowed);
        assert_eq!(driver.state().releases, 1);

        surface.set_slot(0, None).unwrap();
        assert!(surface.slot(0).is_none());
        // borrowed storage is never released
        assert_eq!(driver.state().releases, 1);
    }

    #[test]
    fn substitution_only_wraps_the_buffer() {
        let (driver, mut surface) = surface(64, 64);
        driver.state_mut().fail_import_after = Some(0);
        surface.set_slot(0, Some(slot_buffer(256))).unwrap();

        for _ in 0..100 {
            surface.set_slot(1, Some(slot_buffer(256))).unwrap();
        }

        let bo = surface.slot(0).unwrap();
        assert!(bo.handle().is_null());
        assert!(bo.export_fd().is_some());
        bo.fd().unwrap();

        let state = driver.state();
        assert_eq!(state.imports, 0);
        assert_eq!(state.exports, 0);
        assert_eq!(state.allocations, 0);
    }

    #[test]
    fn allocate_slot_maps_buffer() {
        let (driver, mut surface) = surface(32, 16);
        let bo = surface.allocate_slot(1).unwrap();
        assert_eq!(bo.size(), (32, 16));
        assert!(bo.is_mapped());
        bo.write(&[1, 2, 3, 4]).unwrap();
        let handle = bo.handle();

        assert_eq!(&driver.state().contents(handle).unwrap()[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn mapped_slot_buffer() {
        let (_driver, mut surface) = surface(16, 16);
        let mut storage = vec![0u8; 64 * 16];
        let buffer = unsafe { SlotBuffer::from_raw_parts(NonNull::new(storage.as_mut_ptr()).unwrap(), None, 64) };
        surface.set_slot(1, Some(buffer)).unwrap();

        let bo = surface.slot_mut(1).unwrap();
        assert!(bo.handle().is_null());
        assert!(matches!(bo.fd(), Err(Error::InvalidArgument(_))));
        {
            let mut mapping = bo.map().unwrap();
            assert_eq!(mapping.len(), 64 * 16);
            mapping.write(&[9, 8, 7]).unwrap();
        }
        assert!(!bo.is_mapped());
        surface.destroy();

        assert_eq!(&storage[..3], &[9, 8, 7]);
    }

    #[test]
    fn destroy_destroys_both_slots() {
        let (driver, mut surface) = surface(64, 64);
        surface.allocate_slot(0).unwrap();
        surface.allocate_slot(1).unwrap();
        assert_eq!(driver.state().live_allocations(), 2);

        surface.destroy();
        let state = driver.state();
        assert_eq!(state.releases, 2);
        assert_eq!(state.unmaps, 2);
        assert_eq!(state.live_allocations(), 0);
    }

    #[test]
    fn destroy_leaves_borrowed_storage_alone() {
        let (driver, mut surface) = surface(64, 64);
        surface.set_slot(0, Some(slot_buffer(256))).unwrap();
        surface.set_slot(1, Some(slot_buffer(256))).unwrap();
        surface.destroy();
        assert_eq!(driver.state().releases, 0);
    }

    #[test]
    fn unsupported_surface_format() {
        let driver = Arc::new(MockDriver::default());
        let err = Surface::new(&driver, 64, 64, Fourcc::Nv12 as u32, BufferUsage::empty()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
