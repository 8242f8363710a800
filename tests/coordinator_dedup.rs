//! Fetch deduplication: N grouped sources on one endpoint, one physical
//! batch read per step.

use async_trait::async_trait;
use nexus_writer::client::{ClientRegistry, DeviceAddress, DeviceClient};
use nexus_writer::container::BackendRegistry;
use nexus_writer::decode::DecoderRegistry;
use nexus_writer::source::SourcePool;
use nexus_writer::types::{DataRecord, NxType, ScalarValue};
use nexus_writer::{NexusWriter, Settings, WriterResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Transport that counts its physical exchanges.
struct CountingClient {
    address: DeviceAddress,
    connected: bool,
    batch_reads: Arc<AtomicUsize>,
    single_reads: Arc<AtomicUsize>,
}

#[async_trait]
impl DeviceClient for CountingClient {
    fn address(&self) -> &DeviceAddress {
        &self.address
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> WriterResult<()> {
        self.connected = true;
        Ok(())
    }

    async fn read_attribute(&mut self, name: &str) -> WriterResult<DataRecord> {
        self.single_reads.fetch_add(1, Ordering::SeqCst);
        Ok(DataRecord::scalar(
            ScalarValue::Float(name.len() as f64),
            NxType::Float64,
        ))
    }

    async fn read_attributes(
        &mut self,
        names: &[String],
    ) -> WriterResult<Vec<(String, DataRecord)>> {
        self.batch_reads.fetch_add(1, Ordering::SeqCst);
        Ok(names
            .iter()
            .map(|n| {
                (
                    n.clone(),
                    DataRecord::scalar(ScalarValue::Float(n.len() as f64), NxType::Float64),
                )
            })
            .collect())
    }

    async fn read_property(&mut self, name: &str) -> WriterResult<DataRecord> {
        self.single_reads.fetch_add(1, Ordering::SeqCst);
        Ok(DataRecord::scalar(
            ScalarValue::Text(name.to_string()),
            NxType::Char,
        ))
    }

    async fn run_command(&mut self, _name: &str) -> WriterResult<DataRecord> {
        self.single_reads.fetch_add(1, Ordering::SeqCst);
        Ok(DataRecord::scalar(ScalarValue::Int(0), NxType::Int64))
    }
}

#[tokio::test]
async fn test_endpoint_fetched_once_per_step_regardless_of_source_count() {
    let batch_reads = Arc::new(AtomicUsize::new(0));
    let single_reads = Arc::new(AtomicUsize::new(0));

    let mut clients = ClientRegistry::new();
    let batch = batch_reads.clone();
    let single = single_reads.clone();
    clients.register("count", move |addr| {
        Ok(Box::new(CountingClient {
            address: addr.clone(),
            connected: false,
            batch_reads: batch.clone(),
            single_reads: single.clone(),
        }) as Box<dyn DeviceClient>)
    });

    let mut writer = NexusWriter::with_registries(
        Settings::default(),
        Arc::new(SourcePool::new()),
        Arc::new(DecoderRegistry::new()),
        Arc::new(clients),
        Arc::new(BackendRegistry::new()),
    );
    // Three attribute members of the same device, all in one fetch group.
    writer.set_schema(
        r#"<definition>
             <group type="NXentry" name="entry">
               <field name="position" type="NX_FLOAT64">
                 <strategy mode="STEP"/>
                 <datasource type="DEVICE">
                   <record name="position"/>
                   <device name="p09/motor/1" scheme="count" group="motors"/>
                 </datasource>
               </field>
               <field name="velocity" type="NX_FLOAT64">
                 <strategy mode="STEP"/>
                 <datasource type="DEVICE">
                   <record name="velocity"/>
                   <device name="p09/motor/1" scheme="count" group="motors"/>
                 </datasource>
               </field>
               <field name="acceleration" type="NX_FLOAT64">
                 <strategy mode="STEP"/>
                 <datasource type="DEVICE">
                   <record name="acceleration"/>
                   <device name="p09/motor/1" scheme="count" group="motors"/>
                 </datasource>
               </field>
             </group>
           </definition>"#,
    );

    writer.open_file().await.expect("open file");
    writer.open_entry().await.expect("open entry");
    assert_eq!(batch_reads.load(Ordering::SeqCst), 0, "no fetch before steps");

    for expected in 1..=3 {
        writer.record(None).await.expect("record");
        assert_eq!(
            batch_reads.load(Ordering::SeqCst),
            expected,
            "exactly one batch read per step"
        );
    }
    assert_eq!(
        single_reads.load(Ordering::SeqCst),
        0,
        "attribute members never fetch individually"
    );

    writer.close_entry().await.expect("close entry");
    writer.close_file().await.expect("close file");
}
