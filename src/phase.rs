//! Concurrent phase execution engine.
//!
//! A phase run takes every work item of one queue, spawns a bounded pool of
//! workers that pop items and perform fetch+write, joins them all, and then
//! checks the collected per-item errors. Can-fail items mask their failure
//! with the field type's sentinel value and a logged warning; any other
//! failure set raises one aggregate `Write` error naming every failing
//! item. The engine never retries an item, and item order within a run is
//! unspecified.

use crate::container::FieldHandle;
use crate::error::{ItemFailure, WriterError, WriterResult};
use crate::source::{DataSource, FetchContext};
use crate::types::{DataRecord, NxType, Rank, ScalarValue};
use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

/// One field to fetch and write during a phase run.
pub struct WorkItem {
    /// Container path of the field, used in diagnostics.
    pub name: String,
    pub field: FieldHandle,
    /// Absent for postrun reference items.
    pub source: Option<Box<dyn DataSource>>,
    pub dtype: NxType,
    /// Declared record rank (the step axis of a growing field not counted).
    pub rank: Rank,
    pub shape: Vec<usize>,
    /// Growing axis of the dataset; `None` writes in place.
    pub grows: Option<usize>,
    pub can_fail: bool,
    /// Reference string written as a `postrun` attribute instead of data.
    pub postrun_text: Option<String>,
}

/// Work items are shared between the queue owner and the workers of the
/// current run.
pub type WorkItemHandle = Arc<Mutex<WorkItem>>;

/// The phase-keyed work queues produced by schema compilation. Items are
/// entered into exactly one queue and the queues are dropped when the entry
/// closes.
#[derive(Default)]
pub struct PhaseQueues {
    pub init: Vec<WorkItemHandle>,
    pub step: Vec<WorkItemHandle>,
    pub triggers: HashMap<String, Vec<WorkItemHandle>>,
    pub finals: Vec<WorkItemHandle>,
    pub postrun: Vec<WorkItemHandle>,
}

impl PhaseQueues {
    /// Total queued items across all phases.
    pub fn len(&self) -> usize {
        self.init.len()
            + self.step.len()
            + self.triggers.values().map(Vec::len).sum::<usize>()
            + self.finals.len()
            + self.postrun.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded worker pool that executes one phase at a time.
pub struct PhaseEngine {
    max_workers: usize,
}

impl PhaseEngine {
    pub fn new(max_workers: usize) -> Self {
        PhaseEngine {
            max_workers: max_workers.max(1),
        }
    }

    /// Run all items of one phase: spawn workers, join them all, then check
    /// errors. Either every non-can-fail item succeeded, or the aggregate
    /// error lists each failure.
    pub async fn run(
        &self,
        phase: &str,
        items: &[WorkItemHandle],
        ctx: &FetchContext,
    ) -> WriterResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let queue: Arc<StdMutex<VecDeque<WorkItemHandle>>> =
            Arc::new(StdMutex::new(items.iter().cloned().collect()));
        let failures: Arc<StdMutex<Vec<ItemFailure>>> = Arc::new(StdMutex::new(Vec::new()));
        let workers = self.max_workers.min(items.len());
        log::debug!(
            "phase {}: {} item(s) across {} worker(s)",
            phase,
            items.len(),
            workers
        );

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let queue = queue.clone();
                let failures = failures.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    loop {
                        let item = match queue.lock() {
                            Ok(mut q) => q.pop_front(),
                            Err(_) => None,
                        };
                        let Some(item) = item else { break };
                        let mut item = item.lock().await;
                        if let Err(message) = execute_item(&mut item, &ctx).await {
                            if let Ok(mut f) = failures.lock() {
                                f.push(ItemFailure {
                                    name: item.name.clone(),
                                    message,
                                });
                            }
                        }
                    }
                })
            })
            .collect();

        // Join barrier: every worker finishes before errors are judged.
        for join in join_all(handles).await {
            if let Err(e) = join {
                if let Ok(mut f) = failures.lock() {
                    f.push(ItemFailure {
                        name: format!("<{} worker>", phase),
                        message: e.to_string(),
                    });
                }
            }
        }

        let failures = failures
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(WriterError::Write(failures))
        }
    }
}

/// Fetch+write one item. Returns the failure message for aggregation; a
/// can-fail item converts its failure into a sentinel fill and a warning.
async fn execute_item(item: &mut WorkItem, ctx: &FetchContext) -> Result<(), String> {
    match fetch_and_write(item, ctx).await {
        Ok(()) => Ok(()),
        Err(err) if item.can_fail => {
            log::warn!(
                "{} failed ({}); filling with {} sentinel",
                item.name,
                err,
                item.dtype.schema_name()
            );
            let fill = DataRecord::sentinel(item.dtype, item.rank, &item.shape);
            let result = match item.grows {
                Some(axis) => item.field.append(&fill, axis),
                None => item.field.write(&fill),
            };
            result.map_err(|e| format!("sentinel fill failed: {}", e))
        }
        Err(err) => Err(err.to_string()),
    }
}

async fn fetch_and_write(item: &mut WorkItem, ctx: &FetchContext) -> WriterResult<()> {
    if let Some(text) = &item.postrun_text {
        return item.field.set_attribute(
            "postrun",
            &DataRecord::scalar(ScalarValue::Text(text.clone()), NxType::Char),
        );
    }
    let Some(source) = item.source.as_mut() else {
        log::debug!("{} has no source bound; nothing to do", item.name);
        return Ok(());
    };
    let Some(record) = source.get_data(ctx).await? else {
        log::debug!("{} produced no record this phase", item.name);
        return Ok(());
    };
    let record = record.cast_to(item.dtype)?;
    match item.grows {
        Some(axis) => item.field.append(&record, axis),
        None => item.field.write(&record),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientRegistry, RetryPolicy};
    use crate::container::{ContainerFile, ContainerGroup, FieldOptions, MemoryFile};
    use crate::decode::DecoderRegistry;
    use crate::schema::element::XmlElement;
    use crate::source::{FetchCoordinator, SourceEnv, SourcePool};
    use async_trait::async_trait;
    use serde_json::json;

    struct FailingSource;

    #[async_trait]
    impl DataSource for FailingSource {
        async fn setup(&mut self, _c: &XmlElement, _e: &SourceEnv) -> WriterResult<()> {
            Ok(())
        }
        async fn get_data(&mut self, _ctx: &FetchContext) -> WriterResult<Option<DataRecord>> {
            Err(WriterError::SourceSetup("backend gone".to_string()))
        }
        fn is_valid(&self) -> bool {
            true
        }
    }

    struct ConstSource(f64);

    #[async_trait]
    impl DataSource for ConstSource {
        async fn setup(&mut self, _c: &XmlElement, _e: &SourceEnv) -> WriterResult<()> {
            Ok(())
        }
        async fn get_data(&mut self, _ctx: &FetchContext) -> WriterResult<Option<DataRecord>> {
            Ok(Some(DataRecord::scalar(
                ScalarValue::Float(self.0),
                NxType::Float64,
            )))
        }
        fn is_valid(&self) -> bool {
            true
        }
    }

    fn ctx() -> FetchContext {
        FetchContext {
            step: 0,
            global: Arc::new(json!({})),
            local: None,
            env: SourceEnv {
                clients: Arc::new(ClientRegistry::new()),
                decoders: Arc::new(DecoderRegistry::new()),
                pool: Arc::new(SourcePool::new()),
                coordinator: Arc::new(FetchCoordinator::new()),
                retry: RetryPolicy::new(1, 1),
                default_scheme: "sim".to_string(),
            },
        }
    }

    fn scalar_item(
        file: &MemoryFile,
        name: &str,
        source: Box<dyn DataSource>,
        can_fail: bool,
    ) -> WorkItemHandle {
        let field = file
            .root()
            .create_field(name, NxType::Float64, &[], None, &FieldOptions::default())
            .expect("field");
        Arc::new(Mutex::new(WorkItem {
            name: format!("/{}", name),
            field,
            source: Some(source),
            dtype: NxType::Float64,
            rank: Rank::Scalar,
            shape: Vec::new(),
            grows: None,
            can_fail,
            postrun_text: None,
        }))
    }

    #[tokio::test]
    async fn test_all_items_execute() {
        let file = MemoryFile::create("t");
        let items: Vec<_> = (0..10)
            .map(|i| scalar_item(&file, &format!("f{}", i), Box::new(ConstSource(i as f64)), false))
            .collect();
        let engine = PhaseEngine::new(4);
        engine.run("STEP", &items, &ctx()).await.expect("run");
        for i in 0..10 {
            let rec = file
                .dataset(&format!("/f{}", i))
                .expect("dataset")
                .read()
                .expect("read");
            assert_eq!(
                rec.value,
                crate::types::WireData::Scalar(ScalarValue::Float(i as f64))
            );
        }
    }

    #[tokio::test]
    async fn test_failures_aggregate_and_name_items() {
        let file = MemoryFile::create("t");
        let items = vec![
            scalar_item(&file, "good", Box::new(ConstSource(1.0)), false),
            scalar_item(&file, "bad1", Box::new(FailingSource), false),
            scalar_item(&file, "bad2", Box::new(FailingSource), false),
        ];
        let engine = PhaseEngine::new(2);
        let err = engine.run("STEP", &items, &ctx()).await;
        let Err(WriterError::Write(failures)) = err else {
            panic!("expected aggregate write error");
        };
        assert_eq!(failures.len(), 2);
        let names: Vec<_> = failures.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"/bad1") && names.contains(&"/bad2"));
        // The good item was still written.
        assert!(file.dataset("/good").expect("dataset").read().is_ok());
    }

    #[tokio::test]
    async fn test_can_fail_masks_with_sentinel() {
        let file = MemoryFile::create("t");
        let items = vec![scalar_item(&file, "masked", Box::new(FailingSource), true)];
        let engine = PhaseEngine::new(1);
        engine.run("STEP", &items, &ctx()).await.expect("masked run");
        let rec = file
            .dataset("/masked")
            .expect("dataset")
            .read()
            .expect("read");
        assert_eq!(
            rec.value,
            crate::types::WireData::Scalar(ScalarValue::Float(f64::MAX))
        );
    }
}
