//! Core relay machinery shared by the multi-cluster controllers
//!
//! This library provides:
//! - Deterministic naming and labeling of relays and derived objects
//! - Wrapping of typed objects into relays and lazy decoding back
//! - The object-store contract reconcilers run against, with kube-backed and
//!   in-memory implementations
//! - The audit trail recorded against intent objects

pub mod diff;
pub mod envelope;
pub mod error;
pub mod events;
pub mod finalizer;
pub mod memory;
pub mod naming;
pub mod store;

pub use error::{CoreError, Result};
pub use events::{AuditRecord, AuditSink, KubeAuditSink, MemoryAuditSink, Severity};
pub use memory::MemoryStore;
pub use naming::Labels;
pub use store::{KubeStore, ObjectStore};
