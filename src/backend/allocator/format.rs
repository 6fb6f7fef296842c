//! Format canonicalization.
//!
//! Callers may spell the two supported pixel layouts either as drm fourcc codes or as the
//! legacy bare "bo format" codes. [`canonicalize`] maps the legacy spellings onto their fourcc
//! equivalent, every other code is passed through unchanged.
//!
//! ```
//! # use gbm_kms::backend::allocator::Fourcc;
//! # use gbm_kms::backend::allocator::format::{canonicalize, BO_FORMAT_ARGB8888};
//! assert_eq!(canonicalize(BO_FORMAT_ARGB8888), Fourcc::Argb8888 as u32);
//! assert_eq!(canonicalize(Fourcc::Argb8888 as u32), Fourcc::Argb8888 as u32);
//! ```
//!
//! [`supported_fourcc`] additionally checks the result against the formats this backend can allocate.
//!
//! ```
//! # use gbm_kms::backend::allocator::Fourcc;
//! # use gbm_kms::backend::allocator::format::{supported_fourcc, BO_FORMAT_XRGB8888};
//! assert_eq!(supported_fourcc(BO_FORMAT_XRGB8888), Some(Fourcc::Xrgb8888));
//! assert_eq!(supported_fourcc(Fourcc::Nv12 as u32), None);
//! ```

use super::Fourcc;

/// Generates the legacy alias table and its lookup function.
macro_rules! format_aliases {
    ($($alias: ident = $value: expr => $fourcc: ident),* $(,)?) => {
        $(
            #[doc = concat!("Legacy spelling of [`Fourcc::", stringify!($fourcc), "`]")]
            pub const $alias: u32 = $value;
        )*

        /// Returns the canonical code of the given format.
        ///
        /// Legacy bo format codes are mapped onto their fourcc, anything else is returned as is.
        pub const fn canonicalize(format: u32) -> u32 {
            match format {
                $($alias => $crate::backend::allocator::Fourcc::$fourcc as u32,)*
                other => other,
            }
        }

        #[cfg(test)]
        fn _aliases() -> &'static [(u32, $crate::backend::allocator::Fourcc)] {
            &[$(($alias, $crate::backend::allocator::Fourcc::$fourcc)),*]
        }
    };
}

format_aliases! {
    BO_FORMAT_XRGB8888 = 0 => Xrgb8888,
    BO_FORMAT_ARGB8888 = 1 => Argb8888,
}

/// Formats buffers can be allocated with
pub const SUPPORTED_FORMATS: [Fourcc; 2] = [Fourcc::Argb8888, Fourcc::Xrgb8888];

/// Returns the fourcc of a format code after canonicalization, if it is a known fourcc.
pub fn fourcc(format: u32) -> Option<Fourcc> {
    Fourcc::try_from(canonicalize(format)).ok()
}

/// Returns the fourcc of a format code after canonicalization, if buffers can be allocated with it.
pub fn supported_fourcc(format: u32) -> Option<Fourcc> {
    fourcc(format).filter(|code| SUPPORTED_FORMATS.contains(code))
}
