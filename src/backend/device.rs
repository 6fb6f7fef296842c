use std::sync::Arc;

use tracing::{debug, instrument};

use super::allocator::{
    format, is_trivial_modifier, Allocator, BufferObject, BufferUsage, Fourcc, ImportSource, Modifier,
    Surface,
};
use super::drm::{Error, KmsDriver};

/// Buffer allocation device bound to a kernel display connection
///
/// Creates [`BufferObject`]s and [`Surface`]s. All of them keep the driver alive,
/// so the device itself may be dropped before them.
#[derive(Debug)]
pub struct Device<D: KmsDriver> {
    driver: Arc<D>,
}

#[cfg(feature = "backend_drm")]
impl<A: std::os::unix::io::AsFd + 'static> Device<super::drm::DrmDumbDriver<A>> {
    /// Open a device on the given drm node.
    ///
    /// Fails without side effects if no allocation session can be established.
    pub fn new(fd: A) -> Result<Self, Error> {
        let driver = super::drm::DrmDumbDriver::new(fd)?;
        Ok(Device::with_driver(driver))
    }
}

impl<D: KmsDriver> Device<D> {
    /// Create a device around an already established driver session
    pub fn with_driver(driver: D) -> Self {
        Device {
            driver: Arc::new(driver),
        }
    }

    /// Name of this backend
    pub fn name(&self) -> &'static str {
        "kms"
    }

    /// The kernel driver serving this device
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Returns `true` if buffers of the given format can be created, regardless of usage.
    pub fn is_format_supported(&self, format: u32, _usage: BufferUsage) -> bool {
        format::supported_fourcc(format).is_some()
    }

    /// Number of planes a buffer with the given format and modifier would consist of.
    ///
    /// Explicit modifiers are unsupported, so this always fails.
    pub fn plane_count_for_modifier(&self, _format: u32, modifier: Modifier) -> Result<usize, Error> {
        Err(Error::UnsupportedModifier(modifier))
    }

    /// Create a new buffer object.
    ///
    /// [`BufferUsage::CURSOR`] allocates a 64x64 cursor buffer, [`BufferUsage::WRITE`]
    /// maps the buffer right away so it can be [written to](BufferObject::write).
    pub fn create_bo(
        &self,
        width: u32,
        height: u32,
        format: u32,
        usage: BufferUsage,
    ) -> Result<BufferObject<D>, Error> {
        BufferObject::create(&self.driver, width, height, format, usage)
    }

    /// Import a buffer allocated elsewhere.
    pub fn import_bo(&self, source: ImportSource<'_>) -> Result<BufferObject<D>, Error> {
        BufferObject::import(&self.driver, source)
    }

    /// Create a new double-buffered surface with empty slots.
    pub fn create_surface(
        &self,
        width: u32,
        height: u32,
        format: u32,
        flags: BufferUsage,
    ) -> Result<Surface<D>, Error> {
        Surface::new(&self.driver, width, height, format, flags)
    }

    /// Destroy the device.
    pub fn destroy(self) {
        debug!(name = self.name(), "destroying device");
    }
}

impl<D: KmsDriver> Allocator for Device<D> {
    type Buffer = BufferObject<D>;
    type Error = Error;

    #[instrument(level = "trace", skip(self), err)]
    #[profiling::function]
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<BufferObject<D>, Error> {
        // only the trivial layout is supported
        if let Some(&first) = modifiers.first() {
            if !modifiers.iter().copied().any(is_trivial_modifier) {
                return Err(Error::UnsupportedModifier(first));
            }
        }
        self.create_bo(width, height, fourcc as u32, BufferUsage::SCANOUT | BufferUsage::RENDERING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::{Buffer, Ownership};
    use crate::backend::drm::mock::MockDriver;

    #[test]
    fn supported_formats() {
        let device = Device::with_driver(MockDriver::default());
        for format in [
            Fourcc::Argb8888 as u32,
            Fourcc::Xrgb8888 as u32,
            format::BO_FORMAT_ARGB8888,
            format::BO_FORMAT_XRGB8888,
        ] {
            for usage in [BufferUsage::empty(), BufferUsage::CURSOR, BufferUsage::all()] {
                assert!(device.is_format_supported(format, usage));
            }
        }
        assert!(!device.is_format_supported(Fourcc::Nv12 as u32, BufferUsage::SCANOUT));
        assert!(!device.is_format_supported(Fourcc::Rgb565 as u32, BufferUsage::SCANOUT));
        assert_eq!(device.name(), "kms");
    }

    #[test]
    fn modifiers_are_unsupported() {
        let device = Device::with_driver(MockDriver::default());
        for modifier in [Modifier::Linear, Modifier::Invalid, Modifier::I915_x_tiled] {
            assert!(matches!(
                device.plane_count_for_modifier(Fourcc::Argb8888 as u32, modifier),
                Err(Error::UnsupportedModifier(_))
            ));
        }
    }

    #[test]
    fn allocator_rejects_tiled_layouts() {
        let mut device = Device::with_driver(MockDriver::default());
        let err = device
            .create_buffer(64, 64, Fourcc::Argb8888, &[Modifier::I915_x_tiled])
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedModifier(_)));
        assert_eq!(device.driver().state().allocations, 0);

        let bo = device
            .create_buffer(64, 64, Fourcc::Argb8888, &[Modifier::I915_x_tiled, Modifier::Linear])
            .unwrap();
        assert_eq!(bo.format().map(|format| format.code), Some(Fourcc::Argb8888));
        let bo = device.create_buffer(64, 64, Fourcc::Argb8888, &[]).unwrap();
        assert_eq!(bo.ownership(), Ownership::Owned);
    }

    #[test]
    fn buffers_outlive_device() {
        let device = Device::with_driver(MockDriver::default());
        let bo = device
            .create_bo(64, 64, Fourcc::Xrgb8888 as u32, BufferUsage::WRITE)
            .unwrap();
        let surface = device
            .create_surface(64, 64, Fourcc::Xrgb8888 as u32, BufferUsage::SCANOUT)
            .unwrap();
        device.destroy();

        assert_eq!(bo.size(), (64, 64));
        assert_eq!((surface.width(), surface.height()), (64, 64));
    }
}
