//! # Savanna Core
//!
//! The Savanna datastore engine.
//!
//! This crate provides:
//! - [`Datastore`] and [`DataClass`] handles over a sealed schema catalog
//! - [`Entity`] records with optimistic-concurrency stamps and advisory locks
//! - [`EntityCollection`] set algebra, ordering, aggregation and projection
//! - A textual query language with index-aware execution and plan diagnostics
//! - Per-context nested transactions with pause/resume
//! - Named key-value storage spaces with blocking locks
//! - The [`VirtualAdapter`] capability set for delegating a class to an
//!   external data source
//!
//! ## Quick tour
//!
//! ```rust,ignore
//! use savanna_core::{Datastore, QueryOptions};
//! use savanna_model::Value;
//!
//! let ds = Datastore::new(catalog);
//! let ctx = ds.context();
//! let employees = ds.dataclass("Employee")?;
//!
//! let mut smith = employees.create_entity()?;
//! smith.set("lastName", Value::from("Smith"))?;
//! smith.set("salary", Value::from(5500i64))?;
//! smith.save(&ctx)?;
//!
//! let rich = employees.query(&ctx, "salary > :1", &[Value::from(5000i64)],
//!     &QueryOptions::default())?;
//! assert_eq!(rich.length(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod collection;
mod context;
mod engine;
mod entity;
mod error;
mod export;
mod index;
mod locks;
mod query;
mod storage;
mod store;
mod transaction;
mod types;

pub use adapter::{AdapterError, AdapterResult, AttrRow, Criterion, SortDirective, VirtualAdapter};
pub use collection::{ComputeStats, EntityCollection};
pub use context::ExecutionContext;
pub use engine::{DataClass, Datastore, JsEval};
pub use entity::{
    Entity, ERR_KEY, ERR_LENGTH, ERR_NOT_NULL, ERR_PATTERN, ERR_RANGE, ERR_UNIQUE,
};
pub use error::{DbError, DbResult, QueryError};
pub use query::QueryOptions;
pub use storage::NamedStorage;
pub use types::{ContextId, EntityKey, Stamp};
