use drm_fourcc::DrmModifier as Modifier;

/// Errors thrown by the [`Device`](crate::backend::Device), its
/// [`BufferObject`](crate::backend::allocator::BufferObject)s and
/// [`Surface`](crate::backend::allocator::Surface)s.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The request itself was malformed and can never succeed as is
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The kernel driver failed to provide a resource
    #[error("Kernel driver error: {errmsg} ({source:})")]
    Allocation {
        /// Error message naming the failed step
        errmsg: &'static str,
        /// Underlying driver error
        source: std::io::Error,
    },
    /// A cpu access was attempted on a buffer without an active mapping
    #[error("Buffer object is not mapped")]
    NotMapped,
    /// Explicit layout modifiers are not supported by this backend
    #[error("Modifier `{0:?}` is not supported")]
    UnsupportedModifier(Modifier),
}

impl Error {
    /// Returns `true` if the error was caused by the request rather than by the backend.
    ///
    /// Callers may fix and retry these requests, while backend failures are
    /// usually best reported and aborted.
    pub fn is_invalid_input(&self) -> bool {
        !matches!(self, Error::Allocation { .. })
    }

    pub(crate) fn allocation(errmsg: &'static str) -> impl FnOnce(std::io::Error) -> Error {
        move |source| Error::Allocation { errmsg, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_bad_input() {
        assert!(Error::InvalidArgument("plane index out of range").is_invalid_input());
        assert!(Error::NotMapped.is_invalid_input());
        assert!(Error::UnsupportedModifier(Modifier::Linear).is_invalid_input());

        let err = Error::allocation("failed to allocate buffer object")(std::io::Error::from_raw_os_error(12));
        assert!(!err.is_invalid_input());
        assert!(err.to_string().contains("failed to allocate buffer object"));
    }
}
