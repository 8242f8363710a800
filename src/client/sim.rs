//! A simulated device transport that generates synthetic data.
//!
//! Values are deterministic per member name (seeded from a hash of the
//! name), so tests can assert against them, while still looking like live
//! readings. Devices whose identity starts with `offline` refuse to
//! connect, which exercises the bounded-retry paths.

use super::{DeviceAddress, DeviceClient};
use crate::decode::video::encode_video_frame;
use crate::error::{WriterError, WriterResult};
use crate::types::{DataRecord, NxType, ScalarValue};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

fn name_seed(device: &str, member: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    device.hash(&mut hasher);
    member.hash(&mut hasher);
    hasher.finish()
}

/// Synthetic transport for tests and dry runs.
pub struct SimulatedClient {
    address: DeviceAddress,
    connected: bool,
    reads: AtomicU64,
}

impl SimulatedClient {
    pub fn new(address: DeviceAddress) -> Self {
        SimulatedClient {
            address,
            connected: false,
            reads: AtomicU64::new(0),
        }
    }

    /// Total completed single reads, used by tests.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn check_connected(&self) -> WriterResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(WriterError::SourceSetup(format!(
                "not connected to {}",
                self.address
            )))
        }
    }

    fn scalar_reading(&self, member: &str, tick: u64) -> DataRecord {
        let seed = name_seed(&self.address.device, member);
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(tick));
        let base = (seed % 1000) as f64 / 10.0;
        let noise: f64 = rng.gen_range(-0.05..0.05);
        DataRecord::scalar(ScalarValue::Float(base + noise), NxType::Float64)
    }
}

#[async_trait]
impl DeviceClient for SimulatedClient {
    fn address(&self) -> &DeviceAddress {
        &self.address
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> WriterResult<()> {
        if self.address.device.starts_with("offline") {
            return Err(WriterError::SourceSetup(format!(
                "{} is unreachable",
                self.address
            )));
        }
        self.connected = true;
        Ok(())
    }

    async fn read_attribute(&mut self, name: &str) -> WriterResult<DataRecord> {
        self.check_connected()?;
        let tick = self.reads.fetch_add(1, Ordering::SeqCst);
        if name.ends_with("_frame") {
            // An encoded camera frame: 8x6 16-bit gradient.
            let pixels: Vec<u16> = (0..48).map(|i| (i as u16) * 13 + (tick as u16)).collect();
            let payload = encode_video_frame(8, 6, tick as i64, &pixels);
            return Ok(DataRecord::encoded(payload, "LIMA_VIDEO_IMAGE"));
        }
        if name.contains("spectrum") {
            let seed = name_seed(&self.address.device, name);
            let values = (0..16)
                .map(|i| ScalarValue::Float(((seed % 97) as f64) + f64::from(i) * 0.5))
                .collect();
            return Ok(DataRecord::list(values, NxType::Float64));
        }
        if name.contains("image") {
            let rows = (0..4)
                .map(|r| {
                    (0..4)
                        .map(|c| ScalarValue::Int(i64::from(r * 4 + c)))
                        .collect()
                })
                .collect();
            return DataRecord::table(rows, NxType::Int64);
        }
        Ok(self.scalar_reading(name, tick))
    }

    async fn read_property(&mut self, name: &str) -> WriterResult<DataRecord> {
        self.check_connected()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(DataRecord::scalar(
            ScalarValue::Text(format!("{}@{}", name, self.address.device)),
            NxType::Char,
        ))
    }

    async fn run_command(&mut self, name: &str) -> WriterResult<DataRecord> {
        self.check_connected()?;
        let tick = self.reads.fetch_add(1, Ordering::SeqCst);
        let seed = name_seed(&self.address.device, name);
        Ok(DataRecord::scalar(
            ScalarValue::Int(((seed % 128) + tick) as i64),
            NxType::Int64,
        ))
    }
}
