//! Writer orchestrator.
//!
//! Owns the file/entry lifecycle and drives the schema compiler and the
//! phase engine through it:
//!
//! ```text
//! Idle ──open_file──► FileOpen ──open_entry──► EntryOpen
//!                        ▲                        │ record()*
//!                        └──────close_entry───────┘
//! ```
//!
//! `open_entry` compiles the schema against the open container, runs the
//! INIT phase to completion and error-checks it before returning; `record`
//! advances the step counter and runs the default STEP queue plus any
//! trigger queues the payload names; `close_entry` runs FINAL and POSTRUN
//! and releases all queues. Misordered calls are programmer errors and
//! surface as `State` errors without touching the container.

use crate::client::{ClientRegistry, RetryPolicy};
use crate::config::Settings;
use crate::container::{BackendRegistry, FieldOptions, FileHandle, GroupHandle};
use crate::decode::DecoderRegistry;
use crate::error::{ItemFailure, WriterError, WriterResult};
use crate::phase::{PhaseEngine, WorkItemHandle};
use crate::schema::{CompiledSchema, SchemaCompiler};
use crate::source::{FetchCoordinator, FetchContext, SourceEnv, SourcePool};
use crate::types::{DataRecord, NxType, ScalarValue};
use std::sync::Arc;

/// Step-counter value during the INIT phase.
pub const INIT_STEP: i64 = -1;
/// Step-counter value during the FINAL and POSTRUN phases.
pub const FINAL_STEP: i64 = -2;

/// Writer lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriterState {
    Idle,
    FileOpen,
    EntryOpen,
}

/// The acquisition-and-write engine's public face.
pub struct NexusWriter {
    settings: Arc<Settings>,
    pool: Arc<SourcePool>,
    decoders: Arc<DecoderRegistry>,
    clients: Arc<ClientRegistry>,
    backends: Arc<BackendRegistry>,
    coordinator: Arc<FetchCoordinator>,
    engine: PhaseEngine,
    state: WriterState,
    output_path: String,
    file: Option<FileHandle>,
    log_group: Option<GroupHandle>,
    schema: Option<String>,
    compiled: Option<CompiledSchema>,
    global: Arc<serde_json::Value>,
    step: i64,
    entry_seq: usize,
}

impl NexusWriter {
    /// A writer with the built-in registries.
    pub fn new(settings: Settings) -> Self {
        Self::with_registries(
            settings,
            Arc::new(SourcePool::new()),
            Arc::new(DecoderRegistry::new()),
            Arc::new(ClientRegistry::new()),
            Arc::new(BackendRegistry::new()),
        )
    }

    /// A writer with caller-extended registries (extra source kinds,
    /// decoders, transports, or container backends).
    pub fn with_registries(
        settings: Settings,
        pool: Arc<SourcePool>,
        decoders: Arc<DecoderRegistry>,
        clients: Arc<ClientRegistry>,
        backends: Arc<BackendRegistry>,
    ) -> Self {
        let engine = PhaseEngine::new(settings.engine.max_workers);
        let output_path = settings.storage.path.clone();
        NexusWriter {
            settings: Arc::new(settings),
            pool,
            decoders,
            clients,
            backends,
            coordinator: Arc::new(FetchCoordinator::new()),
            engine,
            state: WriterState::Idle,
            output_path,
            file: None,
            log_group: None,
            schema: None,
            compiled: None,
            global: Arc::new(serde_json::Value::Null),
            step: INIT_STEP,
            entry_seq: 0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// The open container, if any. Mainly for inspection in tests and
    /// integrations.
    pub fn file(&self) -> Option<FileHandle> {
        self.file.clone()
    }

    /// Override the output path for the next `open_file`.
    pub fn set_output_path(&mut self, path: &str) {
        self.output_path = path.to_string();
    }

    /// Install the schema document the next `open_entry` compiles.
    pub fn set_schema(&mut self, xml: &str) {
        self.schema = Some(xml.to_string());
    }

    /// Install the per-entry global push layer.
    pub fn set_global_data(&mut self, json: &str) -> WriterResult<()> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| WriterError::Data(format!("invalid global data payload: {}", e)))?;
        self.global = Arc::new(value);
        Ok(())
    }

    fn source_env(&self) -> SourceEnv {
        SourceEnv {
            clients: self.clients.clone(),
            decoders: self.decoders.clone(),
            pool: self.pool.clone(),
            coordinator: self.coordinator.clone(),
            retry: RetryPolicy::new(
                self.settings.remote.connect_retries,
                self.settings.remote.retry_delay_ms,
            ),
            default_scheme: self.settings.remote.default_scheme.clone(),
        }
    }

    fn context(&self, local: Option<Arc<serde_json::Value>>) -> FetchContext {
        FetchContext {
            step: self.step,
            global: self.global.clone(),
            local,
            env: self.source_env(),
        }
    }

    /// Open a fresh container file, closing any prior one first.
    pub async fn open_file(&mut self) -> WriterResult<()> {
        if self.state != WriterState::Idle {
            self.close_file().await?;
        }
        let file = self
            .backends
            .create(&self.settings.storage.backend, &self.output_path)?;
        if self.settings.log.configuration_logs {
            let group = file.root().create_group("configuration-logs", "NXcollection")?;
            group.set_attribute(
                "version",
                &DataRecord::scalar(
                    ScalarValue::Text(env!("CARGO_PKG_VERSION").to_string()),
                    NxType::Char,
                ),
            )?;
            self.log_group = Some(group);
        }
        log::info!(
            "opened {} container at '{}'",
            self.settings.storage.backend,
            self.output_path
        );
        self.file = Some(file);
        self.entry_seq = 0;
        self.state = WriterState::FileOpen;
        Ok(())
    }

    /// Compile the installed schema and run the INIT phase.
    pub async fn open_entry(&mut self) -> WriterResult<()> {
        match self.state {
            WriterState::Idle => {
                return Err(WriterError::State(
                    "open_file must precede open_entry".to_string(),
                ))
            }
            WriterState::EntryOpen => {
                return Err(WriterError::State(
                    "an entry is already open; close it first".to_string(),
                ))
            }
            WriterState::FileOpen => {}
        }
        let schema = self.schema.clone().ok_or_else(|| {
            WriterError::State("no schema set before open_entry".to_string())
        })?;
        let file = self
            .file
            .clone()
            .ok_or_else(|| WriterError::State("no open container".to_string()))?;

        let compiler = SchemaCompiler::new(self.source_env());
        let compiled = compiler.compile(&schema, file.root()).await?;
        log::info!(
            "entry compiled: {} work item(s) across all phases",
            compiled.queues.len()
        );

        self.step = INIT_STEP;
        let ctx = self.context(None);
        self.engine.run("INIT", &compiled.queues.init, &ctx).await?;

        self.entry_seq += 1;
        if let Some(log_group) = &self.log_group {
            let name = format!("configuration-{}", self.entry_seq);
            let field = log_group.create_field(
                &name,
                NxType::Char,
                &[],
                None,
                &FieldOptions::default(),
            )?;
            field.write(&DataRecord::scalar(
                ScalarValue::Text(compiled.raw.clone()),
                NxType::Char,
            ))?;
            field.set_attribute(
                "timestamp",
                &DataRecord::scalar(
                    ScalarValue::Text(chrono::Utc::now().to_rfc3339()),
                    NxType::DateTime,
                ),
            )?;
            field.set_attribute(
                "version",
                &DataRecord::scalar(
                    ScalarValue::Text(env!("CARGO_PKG_VERSION").to_string()),
                    NxType::Char,
                ),
            )?;
        }

        self.compiled = Some(compiled);
        self.state = WriterState::EntryOpen;
        Ok(())
    }

    /// Record one measurement step: run the default STEP queue and any
    /// trigger queues the payload names, then flush the container.
    pub async fn record(&mut self, payload: Option<&str>) -> WriterResult<()> {
        if self.state != WriterState::EntryOpen {
            return Err(WriterError::State(
                "record requires an open entry".to_string(),
            ));
        }
        let parsed: Option<serde_json::Value> = match payload {
            Some(text) => Some(serde_json::from_str(text).map_err(|e| {
                WriterError::Data(format!("invalid record payload: {}", e))
            })?),
            None => None,
        };
        let triggers: Vec<String> = parsed
            .as_ref()
            .and_then(|p| p.get("triggers"))
            .and_then(|t| t.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let local = parsed.map(Arc::new);

        self.step += 1;
        let ctx = self.context(local);
        let compiled = self
            .compiled
            .as_ref()
            .ok_or_else(|| WriterError::State("entry has no compiled schema".to_string()))?;

        let mut failures: Vec<ItemFailure> = Vec::new();
        run_collecting(&self.engine, "STEP", &compiled.queues.step, &ctx, &mut failures).await?;
        for trigger in &triggers {
            match compiled.queues.triggers.get(trigger) {
                Some(items) => {
                    run_collecting(&self.engine, trigger, items, &ctx, &mut failures).await?
                }
                None => log::warn!("payload names unknown trigger phase '{}'", trigger),
            }
        }

        if let Some(file) = &self.file {
            file.flush()?;
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(WriterError::Write(failures))
        }
    }

    /// Run FINAL and POSTRUN, then release all phase queues.
    pub async fn close_entry(&mut self) -> WriterResult<()> {
        if self.state != WriterState::EntryOpen {
            return Err(WriterError::State(
                "close_entry requires an open entry".to_string(),
            ));
        }
        self.step = FINAL_STEP;
        // Queues are released whatever the phase outcome.
        let compiled = self
            .compiled
            .take()
            .ok_or_else(|| WriterError::State("entry has no compiled schema".to_string()))?;
        let ctx = self.context(None);

        let mut failures: Vec<ItemFailure> = Vec::new();
        let result = async {
            run_collecting(&self.engine, "FINAL", &compiled.queues.finals, &ctx, &mut failures)
                .await?;
            run_collecting(&self.engine, "POSTRUN", &compiled.queues.postrun, &ctx, &mut failures)
                .await?;
            Ok::<(), WriterError>(())
        }
        .await;

        self.coordinator.clear();
        self.state = WriterState::FileOpen;
        if let Some(file) = &self.file {
            file.flush()?;
        }
        result?;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(WriterError::Write(failures))
        }
    }

    /// Close the container, releasing any still-open queues first.
    pub async fn close_file(&mut self) -> WriterResult<()> {
        let entry_result = if self.state == WriterState::EntryOpen {
            self.close_entry().await
        } else {
            Ok(())
        };
        self.compiled = None;
        self.log_group = None;
        if let Some(file) = self.file.take() {
            file.close()?;
        }
        self.state = WriterState::Idle;
        log::info!("closed container at '{}'", self.output_path);
        entry_result
    }
}

/// Run one queue, folding an aggregate write failure into `failures` and
/// propagating everything else.
async fn run_collecting(
    engine: &PhaseEngine,
    phase: &str,
    items: &[WorkItemHandle],
    ctx: &FetchContext,
    failures: &mut Vec<ItemFailure>,
) -> WriterResult<()> {
    match engine.run(phase, items, ctx).await {
        Ok(()) => Ok(()),
        Err(WriterError::Write(mut f)) => {
            failures.append(&mut f);
            Ok(())
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> NexusWriter {
        NexusWriter::new(Settings::default())
    }

    #[tokio::test]
    async fn test_record_before_open_entry_is_state_error() {
        let mut w = writer();
        w.open_file().await.expect("open file");
        assert!(matches!(
            w.record(None).await,
            Err(WriterError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_double_open_entry_is_state_error() {
        let mut w = writer();
        w.set_schema("<definition><group type=\"NXentry\" name=\"entry\"/></definition>");
        w.open_file().await.expect("open file");
        w.open_entry().await.expect("open entry");
        assert!(matches!(
            w.open_entry().await,
            Err(WriterError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_open_entry_requires_schema() {
        let mut w = writer();
        w.open_file().await.expect("open file");
        assert!(matches!(
            w.open_entry().await,
            Err(WriterError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_reaches_idle_again() {
        let mut w = writer();
        w.set_schema("<definition><group type=\"NXentry\" name=\"entry\"/></definition>");
        w.open_file().await.expect("open file");
        w.open_entry().await.expect("open entry");
        assert_eq!(w.state(), WriterState::EntryOpen);
        w.record(None).await.expect("record");
        w.close_entry().await.expect("close entry");
        assert_eq!(w.state(), WriterState::FileOpen);
        w.close_file().await.expect("close file");
        assert_eq!(w.state(), WriterState::Idle);
    }
}
