//! In-process adapters for the core's ports.
//!
//! These back the local runner and the integration tests: an in-memory
//! target store with real lock-document semantics, a JSONL file warehouse,
//! and log/static stand-ins for the delivery-side ports.

pub mod jsonl;
pub mod memory;
pub mod stubs;

pub use jsonl::JsonlWarehouse;
pub use memory::{MemoryTargetStore, MemoryWarehouse};
pub use stubs::{LogAlertPort, NoopGeoLookup, StaticSubscriptionLookup};
