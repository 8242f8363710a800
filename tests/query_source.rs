//! Relational query sources against in-memory SQLite.

#![cfg(feature = "source_db")]

use nexus_writer::container::{ContainerFile, MemoryFile};
use nexus_writer::types::{Rank, ScalarValue, WireData};
use nexus_writer::{NexusWriter, Settings};

fn dataset(writer: &NexusWriter, path: &str) -> nexus_writer::types::DataRecord {
    let file = writer.file().expect("container open");
    file.as_any()
        .downcast_ref::<MemoryFile>()
        .expect("memory backend")
        .dataset(path)
        .unwrap_or_else(|| panic!("dataset {} missing", path))
        .read()
        .expect("read")
}

#[tokio::test]
async fn test_scalar_spectrum_and_image_formats() {
    let mut writer = NexusWriter::new(Settings::default());
    writer.set_schema(
        r#"<definition>
             <group type="NXentry" name="entry">
               <field name="run_number" type="NX_INT64">
                 <strategy mode="INIT"/>
                 <datasource type="DB">
                   <database dbtype="SQLITE3" file=":memory:"/>
                   <query format="SCALAR">SELECT 42</query>
                 </datasource>
               </field>
               <field name="calibration" type="NX_FLOAT64">
                 <strategy mode="INIT"/>
                 <datasource type="DB">
                   <database dbtype="SQLITE3" file=":memory:"/>
                   <query format="SPECTRUM">SELECT 1.5 UNION ALL SELECT 2.5 UNION ALL SELECT 3.5</query>
                 </datasource>
               </field>
               <field name="matrix" type="NX_INT64">
                 <strategy mode="INIT"/>
                 <datasource type="DB">
                   <database dbtype="SQLITE3" file=":memory:"/>
                   <query format="IMAGE">SELECT 1, 2 UNION ALL SELECT 3, 4</query>
                 </datasource>
               </field>
             </group>
           </definition>"#,
    );
    writer.open_file().await.expect("open file");
    writer.open_entry().await.expect("open entry");

    let run = dataset(&writer, "/entry/run_number");
    assert_eq!(run.value, WireData::Scalar(ScalarValue::Int(42)));

    let calibration = dataset(&writer, "/entry/calibration");
    assert_eq!(calibration.rank, Rank::OneD);
    assert_eq!(
        calibration.value,
        WireData::List(vec![
            ScalarValue::Float(1.5),
            ScalarValue::Float(2.5),
            ScalarValue::Float(3.5)
        ])
    );

    let matrix = dataset(&writer, "/entry/matrix");
    assert_eq!(matrix.shape, vec![2, 2]);

    writer.close_file().await.expect("close file");
}

#[tokio::test]
async fn test_unavailable_engine_is_feature_error() {
    let mut writer = NexusWriter::new(Settings::default());
    writer.set_schema(
        r#"<definition>
             <group type="NXentry" name="entry">
               <field name="remote_row" type="NX_FLOAT64">
                 <strategy mode="STEP"/>
                 <datasource type="DB">
                   <database dbtype="MYSQL" dbname="tango"/>
                   <query format="SCALAR">SELECT value FROM readings</query>
                 </datasource>
               </field>
             </group>
           </definition>"#,
    );
    writer.open_file().await.expect("open file");
    writer.open_entry().await.expect("setup itself is engine-agnostic");
    let err = writer.record(None).await;
    let Err(nexus_writer::WriterError::Write(failures)) = err else {
        panic!("expected aggregate write error");
    };
    assert!(failures[0].message.contains("source_db_mysql"));
}
