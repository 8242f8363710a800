//! Instrument-control transport seam.
//!
//! The engine reads device data through the [`DeviceClient`] trait: three
//! read primitives (attribute, property, command) addressed by member name,
//! plus a batched attribute read used by the remote-fetch coordinator. The
//! transport itself is an external collaborator; a [`ClientRegistry`] maps a
//! scheme tag to a client constructor, checked at registration time, and a
//! deterministic simulated transport ships for tests and dry runs.

use crate::error::{WriterError, WriterResult};
use crate::types::DataRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub mod sim;

pub use sim::SimulatedClient;

/// Which read primitive a device member uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Attribute,
    Property,
    Command,
}

impl MemberKind {
    /// Parse the schema `member` attribute. Defaults to `Attribute`.
    pub fn from_schema(tag: Option<&str>) -> WriterResult<MemberKind> {
        match tag {
            None | Some("attribute") => Ok(MemberKind::Attribute),
            Some("property") => Ok(MemberKind::Property),
            Some("command") => Ok(MemberKind::Command),
            Some(other) => Err(WriterError::Schema(format!(
                "unknown device member kind '{}'",
                other
            ))),
        }
    }
}

/// Where a remote endpoint lives.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    /// Registered client scheme ("sim" unless the schema names another).
    pub scheme: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Device identity on the endpoint (e.g. `p09/motor/exp.01`).
    pub device: String,
}

impl DeviceAddress {
    /// Stable key for endpoint deduplication within a fetch group.
    pub fn endpoint_key(&self) -> String {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => format!("{}:{}/{}", host, port, self.device),
            (Some(host), None) => format!("{}/{}", host, self.device),
            _ => self.device.clone(),
        }
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.endpoint_key())
    }
}

/// Bounded reconnect policy, taken from `remote.*` settings.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, delay_ms: u64) -> Self {
        RetryPolicy {
            retries: retries.max(1),
            delay: Duration::from_millis(delay_ms),
        }
    }
}

/// A connection to one remote device endpoint.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// The address this client was constructed for.
    fn address(&self) -> &DeviceAddress;

    /// True once `connect` has succeeded.
    fn is_connected(&self) -> bool;

    /// Establish or re-establish the connection.
    async fn connect(&mut self) -> WriterResult<()>;

    /// Read one attribute.
    async fn read_attribute(&mut self, name: &str) -> WriterResult<DataRecord>;

    /// Read several attributes in one exchange. The default implementation
    /// loops; transports with a native batch call override it.
    async fn read_attributes(
        &mut self,
        names: &[String],
    ) -> WriterResult<Vec<(String, DataRecord)>> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            out.push((name.clone(), self.read_attribute(name).await?));
        }
        Ok(out)
    }

    /// Read one device property.
    async fn read_property(&mut self, name: &str) -> WriterResult<DataRecord>;

    /// Execute an argument-less command and return its result.
    async fn run_command(&mut self, name: &str) -> WriterResult<DataRecord>;
}

/// Connect with the bounded retry policy; used by source setup and the
/// coordinator's reconnect path.
pub async fn connect_with_retry(
    client: &mut (dyn DeviceClient + '_),
    policy: &RetryPolicy,
) -> WriterResult<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.connect().await {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= policy.retries => {
                return Err(WriterError::SourceSetup(format!(
                    "could not connect to {} after {} attempt(s): {}",
                    client.address(),
                    attempt,
                    err
                )));
            }
            Err(err) => {
                log::debug!(
                    "connect attempt {}/{} to {} failed: {}",
                    attempt,
                    policy.retries,
                    client.address(),
                    err
                );
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

type ClientFactory = Box<dyn Fn(&DeviceAddress) -> WriterResult<Box<dyn DeviceClient>> + Send + Sync>;

/// Registry of transport constructors, keyed by scheme. Populated at writer
/// construction and sealed afterwards.
pub struct ClientRegistry {
    factories: HashMap<String, ClientFactory>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    /// A registry with the built-in simulated transport.
    pub fn new() -> Self {
        let mut registry = ClientRegistry {
            factories: HashMap::new(),
        };
        registry.register("sim", |addr| {
            Ok(Box::new(SimulatedClient::new(addr.clone())) as Box<dyn DeviceClient>)
        });
        registry
    }

    /// Register (or replace) a transport constructor.
    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&DeviceAddress) -> WriterResult<Box<dyn DeviceClient>> + Send + Sync + 'static,
    {
        if self.factories.contains_key(scheme) {
            log::debug!("replacing device client scheme '{}'", scheme);
        }
        self.factories.insert(scheme.to_string(), Box::new(factory));
    }

    /// Construct a client for the address's scheme.
    pub fn create(&self, address: &DeviceAddress) -> WriterResult<Box<dyn DeviceClient>> {
        self.factories
            .get(&address.scheme)
            .ok_or_else(|| {
                WriterError::SourceSetup(format!(
                    "no device client registered for scheme '{}'",
                    address.scheme
                ))
            })
            .and_then(|factory| factory(address))
    }
}
