//! End-to-end writer scenarios against the in-memory container.

use async_trait::async_trait;
use nexus_writer::client::ClientRegistry;
use nexus_writer::container::{BackendRegistry, ContainerFile, MemoryFile};
use nexus_writer::decode::DecoderRegistry;
use nexus_writer::error::WriterError;
use nexus_writer::schema::XmlElement;
use nexus_writer::source::{DataSource, FetchContext, SourceEnv, SourcePool};
use nexus_writer::types::{DataRecord, NxType, Rank, ScalarValue, WireData};
use nexus_writer::{NexusWriter, Settings, WriterResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Read a dataset out of the writer's in-memory container.
fn dataset(writer: &NexusWriter, path: &str) -> DataRecord {
    let file = writer.file().expect("container open");
    let mem = file
        .as_any()
        .downcast_ref::<MemoryFile>()
        .expect("memory backend");
    mem.dataset(path)
        .unwrap_or_else(|| panic!("dataset {} missing", path))
        .read()
        .expect("read")
}

const SCENARIO_SCHEMA: &str = r#"<definition>
  <group type="NXentry" name="entry">
    <field name="serial" type="NX_CHAR">
      <strategy mode="INIT"/>
      <datasource type="PUSH"><record name="serial"/></datasource>
    </field>
    <field name="mca" type="NX_FLOAT64">
      <dimensions rank="1"><dim index="1" value="3"/></dimensions>
      <strategy mode="STEP" grows="1"/>
      <datasource type="PUSH"><record name="mca"/></datasource>
    </field>
  </group>
</definition>"#;

#[tokio::test]
async fn test_scenario_grows_to_3x3_and_keeps_init_serial() {
    init_logs();
    let mut writer = NexusWriter::new(Settings::default());
    writer.set_schema(SCENARIO_SCHEMA);
    writer
        .set_global_data(r#"{"data": {"serial": "S-12345"}}"#)
        .expect("global data");
    writer.open_file().await.expect("open file");
    writer.open_entry().await.expect("open entry");

    for _ in 0..3 {
        writer
            .record(Some(r#"{"data": {"mca": [1, 2, 3]}}"#))
            .await
            .expect("record");
    }
    writer.close_entry().await.expect("close entry");

    let mca = dataset(&writer, "/entry/mca");
    assert_eq!(mca.rank, Rank::TwoD);
    assert_eq!(mca.shape, vec![3, 3]);
    let WireData::Table(rows) = &mca.value else {
        panic!("expected table");
    };
    for row in rows {
        assert_eq!(
            row,
            &vec![
                ScalarValue::Float(1.0),
                ScalarValue::Float(2.0),
                ScalarValue::Float(3.0)
            ]
        );
    }

    let serial = dataset(&writer, "/entry/serial");
    assert_eq!(
        serial.value,
        WireData::Scalar(ScalarValue::Text("S-12345".to_string()))
    );

    writer.close_file().await.expect("close file");
}

#[tokio::test]
async fn test_configuration_log_persists_schema_text() {
    let mut writer = NexusWriter::new(Settings::default());
    writer.set_schema(SCENARIO_SCHEMA);
    writer
        .set_global_data(r#"{"data": {"serial": "S-1"}}"#)
        .expect("global data");
    writer.open_file().await.expect("open file");
    writer.open_entry().await.expect("open entry");

    let logged = dataset(&writer, "/configuration-logs/configuration-1");
    let WireData::Scalar(ScalarValue::Text(text)) = logged.value else {
        panic!("expected schema text");
    };
    assert!(text.contains("<definition>"));
    assert!(text.contains("mca"));
}

// Sources used by the phase-ordering test: INIT raises a flag, STEP fails
// unless the flag is up.
struct MarkSource(Arc<AtomicBool>);

#[async_trait]
impl DataSource for MarkSource {
    async fn setup(&mut self, _c: &XmlElement, _e: &SourceEnv) -> WriterResult<()> {
        Ok(())
    }
    async fn get_data(&mut self, _ctx: &FetchContext) -> WriterResult<Option<DataRecord>> {
        self.0.store(true, Ordering::SeqCst);
        Ok(Some(DataRecord::scalar(
            ScalarValue::Int(1),
            NxType::Int64,
        )))
    }
    fn is_valid(&self) -> bool {
        true
    }
}

struct CheckSource(Arc<AtomicBool>);

#[async_trait]
impl DataSource for CheckSource {
    async fn setup(&mut self, _c: &XmlElement, _e: &SourceEnv) -> WriterResult<()> {
        Ok(())
    }
    async fn get_data(&mut self, _ctx: &FetchContext) -> WriterResult<Option<DataRecord>> {
        if !self.0.load(Ordering::SeqCst) {
            return Err(WriterError::Data(
                "step ran before init completed".to_string(),
            ));
        }
        Ok(Some(DataRecord::scalar(
            ScalarValue::Int(2),
            NxType::Int64,
        )))
    }
    fn is_valid(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn test_init_joins_before_step_runs() {
    let flag = Arc::new(AtomicBool::new(false));
    let mut pool = SourcePool::new();
    let mark_flag = flag.clone();
    pool.register("MARK", move || {
        Box::new(MarkSource(mark_flag.clone())) as Box<dyn DataSource>
    });
    let check_flag = flag.clone();
    pool.register("CHECK", move || {
        Box::new(CheckSource(check_flag.clone())) as Box<dyn DataSource>
    });

    let mut writer = NexusWriter::with_registries(
        Settings::default(),
        Arc::new(pool),
        Arc::new(DecoderRegistry::new()),
        Arc::new(ClientRegistry::new()),
        Arc::new(BackendRegistry::new()),
    );
    writer.set_schema(
        r#"<definition>
             <group type="NXentry" name="entry">
               <field name="start_marker" type="NX_INT64">
                 <strategy mode="INIT"/>
                 <datasource type="MARK"/>
               </field>
               <field name="per_step" type="NX_INT64">
                 <strategy mode="STEP"/>
                 <datasource type="CHECK"/>
               </field>
             </group>
           </definition>"#,
    );
    writer.open_file().await.expect("open file");
    writer.open_entry().await.expect("open entry runs init");
    writer.record(None).await.expect("step sees init done");
    writer.close_entry().await.expect("close entry");
}

#[tokio::test]
async fn test_can_fail_masks_step_failure_with_sentinel() {
    init_logs();
    let mut writer = NexusWriter::new(Settings::default());
    writer.set_schema(
        r#"<definition>
             <group type="NXentry" name="entry">
               <field name="fragile" type="NX_FLOAT64">
                 <strategy mode="STEP" canfail="true"/>
                 <datasource type="DEVICE">
                   <record name="counts"/>
                   <device name="offline/counter/1"/>
                 </datasource>
               </field>
             </group>
           </definition>"#,
    );
    writer.open_file().await.expect("open file");
    writer.open_entry().await.expect("can-fail source tolerated");
    writer.record(None).await.expect("record completes");
    writer.record(None).await.expect("record completes");

    let rec = dataset(&writer, "/entry/fragile");
    assert_eq!(rec.shape, vec![2]);
    let WireData::List(values) = rec.value else {
        panic!("expected list");
    };
    assert!(values.iter().all(|v| *v == ScalarValue::Float(f64::MAX)));
}

#[tokio::test]
async fn test_non_can_fail_failure_aborts_record() {
    let mut writer = NexusWriter::new(Settings::default());
    writer.set_schema(
        r#"<definition>
             <group type="NXentry" name="entry">
               <field name="ratio" type="NX_FLOAT64">
                 <strategy mode="STEP"/>
                 <datasource type="COMPUTED">
                   <datasource name="x" type="PUSH"><record name="x"/></datasource>
                   <result>x.no_such_method()</result>
                 </datasource>
               </field>
             </group>
           </definition>"#,
    );
    writer.open_file().await.expect("open file");
    writer.open_entry().await.expect("open entry");
    let err = writer.record(Some(r#"{"data": {"x": 2.0}}"#)).await;
    let Err(WriterError::Write(failures)) = err else {
        panic!("expected aggregate write error");
    };
    assert_eq!(failures.len(), 1);
    assert!(failures[0].name.contains("ratio"));
}

#[tokio::test]
async fn test_trigger_phases_run_only_when_named() {
    let mut writer = NexusWriter::new(Settings::default());
    writer.set_schema(
        r#"<definition>
             <group type="NXentry" name="entry">
               <field name="fast" type="NX_FLOAT64">
                 <strategy mode="STEP"/>
                 <datasource type="PUSH"><record name="fast"/></datasource>
               </field>
               <field name="slow" type="NX_FLOAT64">
                 <strategy mode="STEP" trigger="slow_scan"/>
                 <datasource type="PUSH"><record name="slow"/></datasource>
               </field>
             </group>
           </definition>"#,
    );
    writer.open_file().await.expect("open file");
    writer.open_entry().await.expect("open entry");

    writer
        .record(Some(r#"{"data": {"fast": 1.0, "slow": 10.0}}"#))
        .await
        .expect("plain record");
    writer
        .record(Some(r#"{"data": {"fast": 2.0, "slow": 20.0}, "triggers": ["slow_scan"]}"#))
        .await
        .expect("triggered record");

    assert_eq!(dataset(&writer, "/entry/fast").shape, vec![2]);
    assert_eq!(dataset(&writer, "/entry/slow").shape, vec![1]);
    let WireData::List(slow) = dataset(&writer, "/entry/slow").value else {
        panic!("expected list");
    };
    assert_eq!(slow, vec![ScalarValue::Float(20.0)]);
}

#[tokio::test]
async fn test_absent_push_key_skips_step_write() {
    let mut writer = NexusWriter::new(Settings::default());
    writer.set_schema(
        r#"<definition>
             <group type="NXentry" name="entry">
               <field name="sparse" type="NX_FLOAT64">
                 <strategy mode="STEP"/>
                 <datasource type="PUSH"><record name="sparse"/></datasource>
               </field>
             </group>
           </definition>"#,
    );
    writer.open_file().await.expect("open file");
    writer.open_entry().await.expect("open entry");
    writer
        .record(Some(r#"{"data": {"sparse": 5.0}}"#))
        .await
        .expect("present");
    writer
        .record(Some(r#"{"data": {}}"#))
        .await
        .expect("absent key is fine");
    assert_eq!(dataset(&writer, "/entry/sparse").shape, vec![1]);
}
