//! Durable local record table.
//!
//! The [`RecordStore`] exclusively owns every record field. Other components
//! request state transitions (`synced`, `exported` + batch id) through its
//! operations and never touch the database directly.

pub mod record;
pub mod store;

pub use record::{ReconcileOutcome, Record};
pub use store::RecordStore;
