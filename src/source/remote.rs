//! Remote device source.
//!
//! Reads one member (attribute, property, or command result) of a remote
//! device endpoint. Construction is eager: `setup` resolves the transport
//! and establishes connectivity with bounded retry, so a dead endpoint
//! fails the entry open instead of the first record. Sources that declare a
//! fetch group delegate the physical read to the coordinator and only pick
//! the cached value afterwards.

use super::{DataSource, FetchContext, SourceEnv};
use crate::client::{connect_with_retry, DeviceAddress, DeviceClient, MemberKind};
use crate::error::{WriterError, WriterResult};
use crate::schema::element::XmlElement;
use crate::types::{DataRecord, WireData};
use async_trait::async_trait;

pub struct RemoteDeviceSource {
    record: String,
    address: Option<DeviceAddress>,
    member: MemberKind,
    encoding: Option<String>,
    group: Option<String>,
    client: Option<Box<dyn DeviceClient>>,
    registered: bool,
}

impl Default for RemoteDeviceSource {
    fn default() -> Self {
        RemoteDeviceSource {
            record: String::new(),
            address: None,
            member: MemberKind::Attribute,
            encoding: None,
            group: None,
            client: None,
            registered: false,
        }
    }
}

impl RemoteDeviceSource {
    fn address(&self) -> WriterResult<&DeviceAddress> {
        self.address
            .as_ref()
            .ok_or_else(|| WriterError::SourceSetup("device source not set up".to_string()))
    }
}

#[async_trait]
impl DataSource for RemoteDeviceSource {
    async fn setup(&mut self, config: &XmlElement, env: &SourceEnv) -> WriterResult<()> {
        let record = config
            .child("record")
            .and_then(|r| r.attr("name"))
            .ok_or_else(|| {
                WriterError::SourceSetup("device source without a <record name=>".to_string())
            })?;
        let device = config.child("device").ok_or_else(|| {
            WriterError::SourceSetup("device source without a <device> element".to_string())
        })?;
        let identity = device.attr("name").ok_or_else(|| {
            WriterError::SourceSetup("<device> element without a name".to_string())
        })?;
        let port = match device.attr("port") {
            Some(p) => Some(p.parse::<u16>().map_err(|_| {
                WriterError::SourceSetup(format!("invalid device port '{}'", p))
            })?),
            None => None,
        };
        let address = DeviceAddress {
            scheme: device
                .attr("scheme")
                .unwrap_or(&env.default_scheme)
                .to_string(),
            host: device.attr("hostname").map(str::to_string),
            port,
            device: identity.to_string(),
        };
        self.record = record.to_string();
        self.member = MemberKind::from_schema(device.attr("member"))
            .map_err(|e| WriterError::SourceSetup(e.to_string()))?;
        self.encoding = device.attr("encoding").map(str::to_string);
        self.group = device.attr("group").map(str::to_string);

        if let Some(group) = &self.group {
            env.coordinator
                .register(group, &address, &self.record, self.member, &env.clients, &env.retry)
                .await?;
            self.registered = true;
        } else {
            let mut client = env.clients.create(&address)?;
            connect_with_retry(client.as_mut(), &env.retry).await?;
            self.client = Some(client);
        }
        self.address = Some(address);
        Ok(())
    }

    async fn get_data(&mut self, ctx: &FetchContext) -> WriterResult<Option<DataRecord>> {
        let mut record = if let Some(group) = &self.group {
            if !self.registered {
                return Err(WriterError::SourceSetup(format!(
                    "fetch group '{}' was never wired to the coordinator",
                    group
                )));
            }
            let address = self.address()?;
            ctx.env
                .coordinator
                .fetch(group, ctx.step, &ctx.env.retry)
                .await?;
            ctx.env
                .coordinator
                .cached(group, &address.endpoint_key(), &self.record)
                .await?
        } else {
            let client = self.client.as_mut().ok_or_else(|| {
                WriterError::SourceSetup("device source not set up".to_string())
            })?;
            if !client.is_connected() {
                connect_with_retry(client.as_mut(), &ctx.env.retry).await?;
            }
            match self.member {
                MemberKind::Attribute => client.read_attribute(&self.record).await?,
                MemberKind::Property => client.read_property(&self.record).await?,
                MemberKind::Command => client.run_command(&self.record).await?,
            }
        };

        if matches!(record.value, WireData::Encoded(_)) {
            if record.encoding.is_none() {
                record.encoding = self.encoding.clone();
            }
            record = ctx.env.decoders.resolve(record)?;
        }
        Ok(Some(record))
    }

    fn is_valid(&self) -> bool {
        !self.record.is_empty() && (self.registered || self.client.is_some())
    }
}
