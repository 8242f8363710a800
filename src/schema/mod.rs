//! Declarative schema handling.
//!
//! A schema document describes the output tree and where every value comes
//! from. The [`compiler::SchemaCompiler`] streams the markup once, creating
//! live nodes bound to the output container as tags open and finalizing
//! shape, literal content, or data-source bindings as they close; the
//! result is a node arena plus the phase-keyed work queues the phase engine
//! consumes.

pub mod compiler;
pub mod element;
pub mod node;

pub use compiler::{CompiledSchema, PhaseMode, SchemaCompiler, StrategySpec};
pub use element::XmlElement;
pub use node::{Node, NodeArena, NodeId, NodeKind};
