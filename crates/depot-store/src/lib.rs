//! Content-addressed blob storage with cross-namespace deduplication
//!
//! This crate provides a deduplicated storage layer built from three parts:
//! - a reference-counted resource catalog mapping content hashes to
//!   physical storage locations (`catalog`),
//! - path-addressed byte storage backends (`backend`),
//! - a namespaced facade that turns per-scope path writes into catalog
//!   operations, drives the two-phase upload lifecycle, and runs the
//!   proof-of-ownership exchange (`managed`).
//!
//! Content is fingerprinted with hex-encoded SHA-384. Identical content
//! stored under any number of scopes occupies backend space once.

pub mod backend;
mod cache;
pub mod catalog;
pub mod managed;
mod proof;

pub use backend::{Backend, ByteStream, CountingReader, LocalBackend};
#[cfg(feature = "object-storage")]
pub use backend::ObjectBackend;
pub use catalog::{MemoryCatalog, Removal, Reservation, Resource, ResourceCatalog};
pub use managed::{ManagedStore, StoreConfig};
pub use proof::{ByteRange, OwnershipChallenge, OwnershipProof};
