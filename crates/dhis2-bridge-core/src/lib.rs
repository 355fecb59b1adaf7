//! # DHIS2 Bridge Core
//!
//! Shared, I/O-free logic for DHIS2 Bridge: column-name sanitization,
//! relative period resolution, query descriptor parsing, long-to-wide
//! pivoting, column reference reconciliation, and boundary geometry
//! correction.
//!
//! This crate contains no tokio, sqlx, reqwest, or other native-only
//! dependencies. Everything here is a pure function of its inputs (plus an
//! explicitly supplied reference date where time matters), so the three
//! code paths that name dataset columns (introspection, query references,
//! result assembly) agree by construction.

pub mod descriptor;
pub mod error;
pub mod geometry;
pub mod models;
pub mod period;
pub mod pivot;
pub mod reconcile;
pub mod sanitize;
pub mod store;

pub use error::BridgeError;
pub use sanitize::sanitize;
