//! Schema-driven scientific data writer for beamline experiment control.
//!
//! The crate acquires measurement data from heterogeneous runtime sources —
//! remote instrument endpoints, relational queries, caller-pushed payloads,
//! computed expressions — and writes it into a hierarchical, strongly-typed
//! container file, following a schema declared in a small XML dialect. One
//! entry is opened per experiment run, fed measurement steps, and closed:
//!
//! ```text
//! schema ──► SchemaCompiler ──► node tree + phase queues
//!                                      │
//! record(payload) ──► PhaseEngine ──► fetch+write per field ──► container
//! ```
//!
//! See [`writer::NexusWriter`] for the lifecycle API.

pub mod client;
pub mod config;
pub mod container;
pub mod decode;
pub mod error;
pub mod phase;
pub mod schema;
pub mod source;
pub mod types;
pub mod writer;

pub use config::Settings;
pub use error::{WriterError, WriterResult};
pub use writer::{NexusWriter, WriterState};
