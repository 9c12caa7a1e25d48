//! Remote service abstraction for fieldsync.
//!
//! The remote service is reached through four operations (ingest one record,
//! submit an export batch, resend a batch notification, download a batch
//! artifact) plus an export listing. This crate provides the trait, an HTTP
//! implementation, an in-memory implementation for tests, the session
//! collaborator that supplies the bearer credential, and the connectivity
//! monitor that gates network work.
//!
//! # Design Principles
//! - Components request work through [`RemoteService`]; they never build HTTP
//!   requests themselves
//! - A 401 surfaces as `Error::Authentication`; callers decide on teardown
//! - Non-success responses surface the server's text verbatim

pub mod config;
pub mod connectivity;
pub mod http;
pub mod memory;
pub mod service;
pub mod session;

pub use config::{Endpoints, RemoteConfig};
pub use connectivity::{ConnectivityMonitor, ConnectivityProbe, HttpProbe, ManualProbe, Reachability};
pub use http::HttpRemote;
pub use memory::{FailureMode, MemoryRemote, Operation};
pub use service::{ExportRow, ExportSubmission, IngestPayload, RemoteService};
pub use session::{Credentials, Session, StaticSession};
