//! Pipeline engine for the symx symbol-mirror fleet.
//!
//! This crate provides the moving parts of the three-stage pipeline
//! (index -> mirror -> extract): the object-store abstraction with its GCS
//! and in-memory implementations, CAS-protected metadata stores, the HTTP
//! downloader, typed wrappers around the external `ipsw`/`symsorter`/
//! `hdiutil`/`git` tools, the per-domain stage drivers, and the
//! content-addressed symbol uploader. It is consumed by the CLI frontend
//! without coupling to any particular invocation style.

/// Wall-clock run budget shared by all stage loops.
pub mod budget;
/// `dyld_shared_cache` discovery and splitting.
pub mod dsc;
/// IPSW pipeline: AppleDB index sync, mirror, and extract stages.
pub mod ipsw;
/// CAS-protected metadata document stores.
pub mod meta;
/// Shared mirror-upload semantics.
pub mod mirror;
/// HTTP downloads with retry and hash verification.
pub mod net;
/// OTA pipeline: Apple index, mirror, and extract stages.
pub mod ota;
/// Simulator-runtime symbol extraction (local-disk mode).
pub mod sim;
/// Object-store trait and implementations.
pub mod store;
/// Symbol upload protocol.
pub mod symbols;
/// Typed subprocess wrappers for the external toolchain.
pub mod tools;

pub use budget::RunBudget;
pub use store::{BlobInfo, ObjectStore, StoreError};
