//! # Savanna Testkit
//!
//! Test utilities for Savanna.
//!
//! This crate provides:
//! - Catalog and datastore fixtures (the seeded employee schema)
//! - An in-memory [`fixtures::MemoryAdapter`] virtual backend
//! - Property-based generators built on proptest
//! - Cross-crate integration scenarios exercising the public engine surface
//!
//! ## Usage
//!
//! ```rust,ignore
//! use savanna_testkit::prelude::*;
//!
//! #[test]
//! fn my_test() {
//!     with_seeded_datastore(|ds, ctx| {
//!         let employees = ds.dataclass("Employee").unwrap();
//!         assert_eq!(employees.length(ctx).unwrap(), 10);
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
