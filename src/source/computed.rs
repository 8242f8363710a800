//! Computed source.
//!
//! Evaluates an expression over the fetched values of named sub-sources.
//! The expression runs in an embedded rhai engine with hard safety limits
//! and a scope that contains nothing but the sub-source values; there is no
//! filesystem, network, or host-function surface. The result's rank and
//! shape are inferred from its runtime structure.

use super::{DataSource, FetchContext, SourceEnv};
use crate::error::{WriterError, WriterResult};
use crate::schema::element::XmlElement;
use crate::types::{promote, DataRecord, NxType, ScalarValue, WireData};
use async_trait::async_trait;
use rhai::{Dynamic, Engine, Scope};

/// Operation cap for one expression evaluation.
const MAX_OPERATIONS: u64 = 100_000;

pub struct ComputedSource {
    result_name: String,
    expression: String,
    inputs: Vec<(String, Box<dyn DataSource>)>,
    engine: Engine,
}

impl Default for ComputedSource {
    fn default() -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_OPERATIONS);
        engine.set_max_call_levels(8);
        ComputedSource {
            result_name: "result".to_string(),
            expression: String::new(),
            inputs: Vec::new(),
            engine,
        }
    }
}

fn scalar_to_dynamic(value: &ScalarValue) -> Dynamic {
    match value {
        ScalarValue::Bool(b) => Dynamic::from_bool(*b),
        ScalarValue::Int(i) => Dynamic::from_int(*i),
        ScalarValue::UInt(u) => match i64::try_from(*u) {
            Ok(i) => Dynamic::from_int(i),
            Err(_) => Dynamic::from_float(*u as f64),
        },
        ScalarValue::Float(f) => Dynamic::from_float(*f),
        ScalarValue::Text(s) => Dynamic::from(s.clone()),
    }
}

fn record_to_dynamic(record: &DataRecord) -> WriterResult<Dynamic> {
    match &record.value {
        WireData::Scalar(v) => Ok(scalar_to_dynamic(v)),
        WireData::List(vs) => Ok(Dynamic::from_array(
            vs.iter().map(scalar_to_dynamic).collect(),
        )),
        WireData::Table(rows) => Ok(Dynamic::from_array(
            rows.iter()
                .map(|row| Dynamic::from_array(row.iter().map(scalar_to_dynamic).collect()))
                .collect(),
        )),
        WireData::Encoded(_) => Err(WriterError::Data(
            "encoded payloads cannot feed expressions".to_string(),
        )),
    }
}

fn scalar_from_dynamic(value: &Dynamic) -> WriterResult<(ScalarValue, NxType)> {
    if value.is_bool() {
        return Ok((
            ScalarValue::Bool(value.as_bool().unwrap_or_default()),
            NxType::Boolean,
        ));
    }
    if value.is_int() {
        return Ok((
            ScalarValue::Int(value.as_int().unwrap_or_default()),
            NxType::Int64,
        ));
    }
    if value.is_float() {
        return Ok((
            ScalarValue::Float(value.as_float().unwrap_or_default()),
            NxType::Float64,
        ));
    }
    if value.is_string() {
        return Ok((
            ScalarValue::Text(value.clone().into_string().unwrap_or_default()),
            NxType::Char,
        ));
    }
    Err(WriterError::Data(format!(
        "expression produced unsupported value of type {}",
        value.type_name()
    )))
}

fn dynamic_to_record(value: Dynamic) -> WriterResult<DataRecord> {
    if value.is_array() {
        let items = value.into_array().map_err(|t| {
            WriterError::Data(format!("expression produced unexpected {}", t))
        })?;
        if items.iter().any(Dynamic::is_array) {
            let mut dtype = NxType::Int64;
            let mut rows = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                let cells = item.into_array().map_err(|_| {
                    WriterError::Data("mixed nesting in expression result".to_string())
                })?;
                let mut row = Vec::with_capacity(cells.len());
                for (c, cell) in cells.iter().enumerate() {
                    let (v, d) = scalar_from_dynamic(cell)?;
                    dtype = if i == 0 && c == 0 { d } else { promote(dtype, d)? };
                    row.push(v);
                }
                rows.push(row);
            }
            return DataRecord::table(rows, dtype)?.cast_to(dtype);
        }
        let mut dtype = NxType::Int64;
        let mut values = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let (v, d) = scalar_from_dynamic(item)?;
            dtype = if i == 0 { d } else { promote(dtype, d)? };
            values.push(v);
        }
        return DataRecord::list(values, dtype).cast_to(dtype);
    }
    let (v, dtype) = scalar_from_dynamic(&value)?;
    Ok(DataRecord::scalar(v, dtype))
}

#[async_trait]
impl DataSource for ComputedSource {
    async fn setup(&mut self, config: &XmlElement, env: &SourceEnv) -> WriterResult<()> {
        for child in config.children_named("datasource") {
            let name = child.attr("name").ok_or_else(|| {
                WriterError::SourceSetup("computed sub-source without a name".to_string())
            })?;
            let kind = child.attr("type").ok_or_else(|| {
                WriterError::SourceSetup(format!("sub-source '{}' without a type", name))
            })?;
            let mut sub = env.pool.create(kind)?;
            sub.setup(child, env).await?;
            self.inputs.push((name.to_string(), sub));
        }
        let result = config.child("result").ok_or_else(|| {
            WriterError::SourceSetup("computed source without a <result> element".to_string())
        })?;
        if let Some(name) = result.attr("name") {
            self.result_name = name.to_string();
        }
        self.expression = result.text.trim().to_string();
        if self.expression.is_empty() {
            return Err(WriterError::SourceSetup(
                "computed source with an empty expression".to_string(),
            ));
        }
        Ok(())
    }

    async fn get_data(&mut self, ctx: &FetchContext) -> WriterResult<Option<DataRecord>> {
        let mut scope = Scope::new();
        for (name, source) in &mut self.inputs {
            match source.get_data(ctx).await? {
                Some(record) => {
                    scope.push_dynamic(name.clone(), record_to_dynamic(&record)?);
                }
                None => {
                    log::debug!(
                        "sub-source '{}' produced no value; skipping '{}'",
                        name,
                        self.result_name
                    );
                    return Ok(None);
                }
            }
        }
        let value = self
            .engine
            .eval_with_scope::<Dynamic>(&mut scope, &self.expression)
            .map_err(|e| {
                WriterError::Data(format!("expression '{}' failed: {}", self.result_name, e))
            })?;
        dynamic_to_record(value).map(Some)
    }

    fn is_valid(&self) -> bool {
        !self.expression.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientRegistry, RetryPolicy};
    use crate::decode::DecoderRegistry;
    use crate::source::{FetchCoordinator, SourcePool};
    use crate::types::Rank;
    use serde_json::json;
    use std::sync::Arc;

    fn env() -> SourceEnv {
        SourceEnv {
            clients: Arc::new(ClientRegistry::new()),
            decoders: Arc::new(DecoderRegistry::new()),
            pool: Arc::new(SourcePool::new()),
            coordinator: Arc::new(FetchCoordinator::new()),
            retry: RetryPolicy::new(1, 1),
            default_scheme: "sim".to_string(),
        }
    }

    fn ctx(local: serde_json::Value) -> FetchContext {
        FetchContext {
            step: 0,
            global: Arc::new(json!({})),
            local: Some(Arc::new(local)),
            env: env(),
        }
    }

    async fn setup(body: &str) -> ComputedSource {
        let mut source = ComputedSource::default();
        let config = XmlElement::parse(body).expect("fragment");
        source.setup(&config, &env()).await.expect("setup");
        source
    }

    #[tokio::test]
    async fn test_scalar_expression_over_push_inputs() {
        let mut source = setup(
            r#"<datasource type="COMPUTED">
                 <datasource name="x" type="PUSH"><record name="x"/></datasource>
                 <datasource name="y" type="PUSH"><record name="y"/></datasource>
                 <result name="ratio">x / y</result>
               </datasource>"#,
        )
        .await;
        let rec = source
            .get_data(&ctx(json!({"data": {"x": 6.0, "y": 3.0}})))
            .await
            .expect("fetch")
            .expect("record");
        assert_eq!(rec.rank, Rank::Scalar);
        assert_eq!(rec.value, WireData::Scalar(ScalarValue::Float(2.0)));
    }

    #[tokio::test]
    async fn test_array_result_infers_shape() {
        let mut source = setup(
            r#"<datasource type="COMPUTED">
                 <datasource name="mca" type="PUSH"><record name="mca"/></datasource>
                 <result name="scaled">mca.map(|v| v * 2)</result>
               </datasource>"#,
        )
        .await;
        let rec = source
            .get_data(&ctx(json!({"data": {"mca": [1, 2, 3]}})))
            .await
            .expect("fetch")
            .expect("record");
        assert_eq!(rec.rank, Rank::OneD);
        assert_eq!(rec.shape, vec![3]);
    }

    #[tokio::test]
    async fn test_missing_input_yields_no_record() {
        let mut source = setup(
            r#"<datasource type="COMPUTED">
                 <datasource name="x" type="PUSH"><record name="x"/></datasource>
                 <result>x + 1</result>
               </datasource>"#,
        )
        .await;
        assert!(source
            .get_data(&ctx(json!({"data": {}})))
            .await
            .expect("fetch")
            .is_none());
    }

    #[tokio::test]
    async fn test_runaway_expression_is_capped() {
        let mut source = setup(
            r#"<datasource type="COMPUTED">
                 <datasource name="x" type="PUSH"><record name="x"/></datasource>
                 <result>loop { x += 1; }</result>
               </datasource>"#,
        )
        .await;
        let err = source.get_data(&ctx(json!({"data": {"x": 1}}))).await;
        assert!(matches!(err, Err(WriterError::Data(_))));
    }
}
