//! Transactional table store of a deterministic execution environment.
//!
//! The crate pairs a table controller — a uniform read/write façade over a
//! document-oriented backing store, fronted by a write-through row cache —
//! with an undo engine that records reverse deltas per table and revision,
//! so the outcome of a block or of any nested execution session can be
//! committed, squashed into its parent, or rolled back exactly.
//!
//! All public operations execute on one logical owner; the crate exposes no
//! locks and assumes no parallel mutation, which is what makes every write
//! transcript reproducible on a replaying node.

#![warn(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_qualifications
)]

pub mod cache;
pub mod controller;
pub mod driver;
pub mod error;
pub mod journal;
pub mod resource;
pub mod schema;
pub mod storage_size;
pub mod undo;

pub use controller::{Controller, CursorHandle, CursorKind, FindInfo, IndexRequest};
pub use driver::{Driver, DriverKind, StoreConfig};
pub use error::{Error, ErrorKind};
