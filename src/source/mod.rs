//! Data sources.
//!
//! A [`DataSource`] feeds one schema field: it is configured once from its
//! `<datasource>` element, fetched once per relevant phase invocation, and
//! dropped with its node when the entry closes. Four variants ship with the
//! crate — remote device members, relational queries, caller-pushed
//! payloads, and computed expressions — and the [`pool::SourcePool`] lets
//! integrations register further kinds at writer construction time.

use crate::client::{ClientRegistry, RetryPolicy};
use crate::decode::DecoderRegistry;
use crate::error::WriterResult;
use crate::schema::element::XmlElement;
use crate::types::{DataRecord, Rank};
use async_trait::async_trait;
use std::sync::Arc;

pub mod computed;
pub mod coordinator;
pub mod pool;
pub mod push;
pub mod query;
pub mod remote;

pub use computed::ComputedSource;
pub use coordinator::FetchCoordinator;
pub use pool::SourcePool;
pub use push::PushSource;
pub use query::RelationalQuerySource;
pub use remote::RemoteDeviceSource;

/// Shared collaborators a source may need while being configured or fetched.
///
/// Everything here is populated at writer construction and read-only during
/// phase runs, so the whole bundle is cheaply cloneable.
#[derive(Clone)]
pub struct SourceEnv {
    pub clients: Arc<ClientRegistry>,
    pub decoders: Arc<DecoderRegistry>,
    pub pool: Arc<SourcePool>,
    pub coordinator: Arc<FetchCoordinator>,
    pub retry: RetryPolicy,
    /// Client scheme used when a `<device>` element does not name one.
    pub default_scheme: String,
}

/// Per-invocation fetch state handed to every `get_data` call.
#[derive(Clone)]
pub struct FetchContext {
    /// Current step counter (sentinels for INIT/FINAL, 0.. for records).
    pub step: i64,
    /// Per-entry global push layer.
    pub global: Arc<serde_json::Value>,
    /// Per-step local push layer; overrides the global layer key by key.
    pub local: Option<Arc<serde_json::Value>>,
    pub env: SourceEnv,
}

impl FetchContext {
    /// Resolve a push-payload key against the local layer, then the global
    /// layer.
    pub fn payload_value(&self, key: &str) -> Option<&serde_json::Value> {
        if let Some(local) = self.local.as_deref() {
            if let Some(v) = local.get("data").and_then(|d| d.get(key)) {
                return Some(v);
            }
        }
        self.global.get("data").and_then(|d| d.get(key))
    }
}

/// Uniform capability set of every data source.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Configure the source from its `<datasource>` element. Called exactly
    /// once, during schema compilation; sources that talk to remote
    /// endpoints establish connectivity here, with bounded retry.
    async fn setup(&mut self, config: &XmlElement, env: &SourceEnv) -> WriterResult<()>;

    /// Fetch one record. `Ok(None)` means the source has nothing for this
    /// invocation, which is not an error.
    async fn get_data(&mut self, ctx: &FetchContext) -> WriterResult<Option<DataRecord>>;

    /// True once the source is configured and usable.
    fn is_valid(&self) -> bool;

    /// The result shape the source declares up front, if any. Used by the
    /// compiler when a field carries no explicit dimensions.
    fn declared_shape(&self) -> Option<(Rank, Vec<usize>)> {
        None
    }
}
