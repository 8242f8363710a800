//! Push source.
//!
//! Reads a named key out of the caller-supplied JSON payload layers: the
//! per-step local layer first, the per-entry global layer as fallback. An
//! absent key produces no record, which lets one schema serve callers that
//! only push a subset of the declared fields.

use super::{DataSource, FetchContext, SourceEnv};
use crate::error::{WriterError, WriterResult};
use crate::schema::element::XmlElement;
use crate::types::DataRecord;
use async_trait::async_trait;

#[derive(Default)]
pub struct PushSource {
    name: String,
}

#[async_trait]
impl DataSource for PushSource {
    async fn setup(&mut self, config: &XmlElement, _env: &SourceEnv) -> WriterResult<()> {
        let name = config
            .child("record")
            .and_then(|r| r.attr("name"))
            .or_else(|| config.attr("name"))
            .ok_or_else(|| {
                WriterError::SourceSetup("push source without a record name".to_string())
            })?;
        self.name = name.to_string();
        Ok(())
    }

    async fn get_data(&mut self, ctx: &FetchContext) -> WriterResult<Option<DataRecord>> {
        match ctx.payload_value(&self.name) {
            Some(value) => DataRecord::from_json(value).map(Some),
            None => {
                log::debug!("no payload value for '{}' this step", self.name);
                Ok(None)
            }
        }
    }

    fn is_valid(&self) -> bool {
        !self.name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientRegistry, RetryPolicy};
    use crate::decode::DecoderRegistry;
    use crate::source::{FetchCoordinator, SourcePool};
    use crate::types::{Rank, ScalarValue, WireData};
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

    fn ctx(global: serde_json::Value, local: Option<serde_json::Value>) -> FetchContext {
        FetchContext {
            step: 0,
            global: Arc::new(global),
            local: local.map(Arc::new),
            env: env(),
        }
    }

    async fn source(name: &str) -> PushSource {
        let mut s = PushSource::default();
        let config =
            XmlElement::parse(&format!("<datasource type=\"PUSH\"><record name=\"{}\"/></datasource>", name))
                .expect("fragment");
        s.setup(&config, &env()).await.expect("setup");
        s
    }

    #[tokio::test]
    async fn test_local_layer_overrides_global() {
        let mut s = source("serial").await;
        let ctx = ctx(
            json!({"data": {"serial": "global-1"}}),
            Some(json!({"data": {"serial": "local-2"}})),
        );
        let rec = s.get_data(&ctx).await.expect("fetch").expect("record");
        assert_eq!(
            rec.value,
            WireData::Scalar(ScalarValue::Text("local-2".to_string()))
        );
    }

    #[tokio::test]
    async fn test_global_layer_fallback() {
        let mut s = source("serial").await;
        let ctx = ctx(json!({"data": {"serial": "global-1"}}), Some(json!({"data": {}})));
        let rec = s.get_data(&ctx).await.expect("fetch").expect("record");
        assert_eq!(
            rec.value,
            WireData::Scalar(ScalarValue::Text("global-1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_absent_key_is_no_record() {
        let mut s = source("missing").await;
        let ctx = ctx(json!({"data": {}}), None);
        assert!(s.get_data(&ctx).await.expect("fetch").is_none());
    }

    #[tokio::test]
    async fn test_array_payload_shape() {
        let mut s = source("mca").await;
        let ctx = ctx(json!({}), Some(json!({"data": {"mca": [1, 2, 3]}})));
        let rec = s.get_data(&ctx).await.expect("fetch").expect("record");
        assert_eq!(rec.rank, Rank::OneD);
        assert_eq!(rec.shape, vec![3]);
    }
}
