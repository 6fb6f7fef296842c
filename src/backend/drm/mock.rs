//! In-memory [`KmsDriver`] recording every call, for tests.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::io::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;

use drm_fourcc::DrmFourcc as Fourcc;

use super::{BoKind, ExportFlags, Handle, KmsBo, KmsDriver};

#[derive(Debug)]
pub(crate) struct MockBo {
    handle: Handle,
    stride: u32,
    size: (u32, u32),
}

impl KmsBo for MockBo {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn stride(&self) -> u32 {
        self.stride
    }

    fn size(&self) -> (u32, u32) {
        self.size
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockState {
    next_handle: u32,
    storage: HashMap<Handle, Box<[u8]>>,
    pub allocations: usize,
    pub releases: usize,
    pub maps: usize,
    pub unmaps: usize,
    pub exports: usize,
    pub imports: usize,
    pub last_kind: Option<BoKind>,
    pub last_format: Option<Fourcc>,
    pub fail_allocate: bool,
    pub fail_map: bool,
    pub fail_export: bool,
    /// Fail the import once this many descriptors were converted successfully
    pub fail_import_after: Option<usize>,
}

impl MockState {
    fn next_handle(&mut self) -> Handle {
        self.next_handle += 1;
        Handle::from(self.next_handle)
    }

    pub fn live_allocations(&self) -> usize {
        self.storage.len()
    }

    pub fn contents(&self, handle: Handle) -> Option<&[u8]> {
        self.storage.get(&handle).map(|data| &data[..])
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockDriver {
    state: RefCell<MockState>,
}

impl MockDriver {
    pub fn state(&self) -> Ref<'_, MockState> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, MockState> {
        self.state.borrow_mut()
    }
}

fn fake_fd() -> io::Result<OwnedFd> {
    Ok(File::open("/dev/null")?.into())
}

impl KmsDriver for MockDriver {
    type Bo = MockBo;

    fn allocate(&self, kind: BoKind, width: u32, height: u32, format: Fourcc) -> io::Result<MockBo> {
        let mut state = self.state.borrow_mut();
        state.last_kind = Some(kind);
        state.last_format = Some(format);
        if state.fail_allocate {
            return Err(io::Error::from_raw_os_error(12));
        }

        let (width, height) = kind.dimensions(width, height);
        let stride = (width * 4 + 63) & !63;
        let handle = state.next_handle();
        state
            .storage
            .insert(handle, vec![0u8; (stride * height) as usize].into_boxed_slice());
        state.allocations += 1;

        Ok(MockBo {
            handle,
            stride,
            size: (width, height),
        })
    }

    fn map(&self, bo: &MockBo) -> io::Result<NonNull<u8>> {
        let mut state = self.state.borrow_mut();
        if state.fail_map {
            return Err(io::Error::from_raw_os_error(22));
        }
        state.maps += 1;
        let data = state
            .storage
            .get_mut(&bo.handle)
            .ok_or_else(|| io::Error::from_raw_os_error(2))?;
        Ok(NonNull::new(data.as_mut_ptr()).unwrap())
    }

    unsafe fn unmap(&self, _bo: &MockBo, _addr: NonNull<u8>) {
        self.state.borrow_mut().unmaps += 1;
    }

    fn release(&self, bo: MockBo) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.releases += 1;
        state
            .storage
            .remove(&bo.handle)
            .map(|_| ())
            .ok_or_else(|| io::Error::from_raw_os_error(2))
    }

    fn fd_to_handle(&self, _fd: BorrowedFd<'_>) -> io::Result<Handle> {
        let mut state = self.state.borrow_mut();
        if state.fail_import_after == Some(state.imports) {
            return Err(io::Error::from_raw_os_error(9));
        }
        state.imports += 1;
        Ok(state.next_handle())
    }

    fn handle_to_fd(&self, _handle: Handle, flags: ExportFlags) -> io::Result<OwnedFd> {
        let mut state = self.state.borrow_mut();
        assert!(flags.contains(ExportFlags::CLOEXEC));
        if state.fail_export {
            return Err(io::Error::from_raw_os_error(24));
        }
        state.exports += 1;
        fake_fd()
    }
}

/// Route log output of the crate through the test harness, filtered by `RUST_LOG`.
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Descriptors to hand to import calls
pub(crate) fn fds(count: usize) -> Vec<OwnedFd> {
    (0..count).map(|_| fake_fd().unwrap()).collect()
}
