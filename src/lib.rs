#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # gbm-kms: buffer objects and surfaces on top of kms
//!
//! This crate hands a compositor memory regions suitable for display, called buffer objects,
//! and double-buffered drawing surfaces, both backed by a kernel display driver.
//!
//! ## Structure of the crate
//!
//! - [`backend::Device`] is the entry point. It is created on an open drm node
//!   (or any other [`KmsDriver`](backend::drm::KmsDriver)) and creates the other objects.
//! - [`backend::allocator`] contains [`BufferObject`](backend::allocator::BufferObject)s, which
//!   are either allocated by the device or imported from storage owned by somebody else, and
//!   [`Surface`](backend::allocator::Surface)s, which implement the front/back buffer handoff
//!   of a render loop.
//!
//! ```rust,no_run
//! use gbm_kms::backend::{allocator::{BufferUsage, Fourcc}, Device};
//! # let file = std::fs::File::open("/dev/dri/card0").unwrap();
//!
//! let device = Device::new(file).unwrap();
//! let mut cursor = device
//!     .create_bo(64, 64, Fourcc::Argb8888 as u32, BufferUsage::CURSOR | BufferUsage::WRITE)
//!     .unwrap();
//! cursor.write(&[0xff; 64 * 64 * 4]).unwrap();
//! ```
//!
//! ### Threading
//!
//! Nothing in this crate blocks or spawns threads besides the driver ioctls themselves.
//! Buffer objects and surfaces are not synchronized internally, which is why they are
//! neither `Send` nor `Sync`.
//!
//! ### Logging
//!
//! This crate makes use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;

pub mod reexports;
