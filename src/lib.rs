//! # DHIS2 Bridge
//!
//! An analytics adapter between a DHIS2-style health information API and a
//! BI host that wants flat, column-named datasets and renderable maps.
//!
//! ## Architecture
//!
//! ```text
//! descriptor ─▶ periods ─▶ ┌──────────┐ ─▶ pivot ─▶ reconcile/project ─▶ host
//!                          │ Upstream │
//! levels ───────────────▶  │  (HTTP)  │ ─▶ geometry correction ─▶ BoundaryCache ─▶ map
//!                          └──────────┘                              │
//!                                                                    ▼
//!                                                              SQLite mirror
//! ```
//!
//! Pure logic (sanitization, period resolution, descriptor parsing,
//! pivoting, reconciliation, geometry correction) lives in
//! [`dhis2_bridge_core`]; this crate adds I/O.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`traits`] | The [`Upstream`](traits::Upstream) seam |
//! | [`client`] | `reqwest` implementation of the upstream |
//! | [`fetch`] | Endpoint selection, chunking, paging, normalization |
//! | [`dataset`] | Query pipeline and column introspection |
//! | [`boundary`] | Boundary ingestion per level |
//! | [`cache`] | Single-flight, versioned boundary cache |
//! | [`sqlite_store`] | SQLite boundary store |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod boundary;
pub mod cache;
pub mod client;
pub mod commands;
pub mod config;
pub mod dataset;
pub mod db;
pub mod fetch;
pub mod logging;
pub mod migrate;
pub mod server;
pub mod sqlite_store;
pub mod traits;
