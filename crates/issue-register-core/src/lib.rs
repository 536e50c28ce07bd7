//! Issue reconciliation engine.
//!
//! Candidate statements extracted from documents and meetings are matched against the
//! open issues, classified, and merged into a revisioned register with provenance for
//! every change. [`IssueStore::commit`] is the only mutation path.

pub mod agenda;
pub mod classifier;
pub mod config;
pub mod error;
pub mod framework;
pub mod ingest;
pub mod matcher;
pub mod memory;
pub mod model;
pub mod oracle;
pub mod reconcile;
pub mod registry;
pub mod revision;
pub mod store;

pub use agenda::*;
pub use classifier::*;
pub use config::*;
pub use error::*;
pub use framework::*;
pub use ingest::*;
pub use matcher::*;
pub use memory::*;
pub use model::*;
pub use oracle::*;
pub use reconcile::*;
pub use registry::*;
pub use revision::*;
pub use store::*;
