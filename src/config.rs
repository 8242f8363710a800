//! Writer configuration.
//!
//! Settings are loaded in layers: built-in defaults, then an optional TOML
//! file, then `NXW_*` environment variables (e.g. `NXW_ENGINE__MAX_WORKERS=4`
//! overrides `engine.max_workers`). A semantic validation pass runs after
//! deserialization so that values which parse but make no sense (a worker
//! pool of zero, an unknown backend name) are rejected up front with a
//! `Configuration` error rather than failing deep inside a phase run.

use crate::error::{WriterError, WriterResult};
use serde::Deserialize;

/// Top-level writer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Container backend selection and output location.
    pub storage: StorageSettings,
    /// Phase-engine tuning.
    pub engine: EngineSettings,
    /// Remote device connection policy.
    pub remote: RemoteSettings,
    /// Provenance logging.
    pub log: LogSettings,
}

/// Which container backend to open and where.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Registered backend name ("memory", "hdf5", or a custom registration).
    pub backend: String,
    /// Default output path; `set_output_path` overrides per writer.
    pub path: String,
}

/// Concurrency bounds for phase runs.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Upper bound on concurrent workers per phase run. The effective worker
    /// count is also bounded by the number of queued items.
    pub max_workers: usize,
}

/// Connection retry policy for remote device sources.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSettings {
    /// Client scheme used when a `<device>` element does not name one.
    pub default_scheme: String,
    /// Bounded connect attempts before a source setup fails.
    pub connect_retries: u32,
    /// Delay between connect attempts, in milliseconds.
    pub retry_delay_ms: u64,
}

/// Schema provenance logging.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    /// When true, `open_file` creates a `configuration-logs` group and each
    /// `open_entry` persists the raw schema text into it.
    pub configuration_logs: bool,
}

impl Settings {
    /// Load settings from defaults, an optional TOML file, and the
    /// environment, then validate them.
    pub fn new(path: Option<&str>) -> WriterResult<Self> {
        let mut builder = config::Config::builder()
            .set_default("storage.backend", "memory")?
            .set_default("storage.path", "experiment.nxs")?
            .set_default("engine.max_workers", 8i64)?
            .set_default("remote.default_scheme", "sim")?
            .set_default("remote.connect_retries", 4i64)?
            .set_default("remote.retry_delay_ms", 200i64)?
            .set_default("log.configuration_logs", true)?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("NXW")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks beyond what deserialization enforces.
    pub fn validate(&self) -> WriterResult<()> {
        if self.engine.max_workers == 0 {
            return Err(WriterError::Configuration(
                "engine.max_workers must be at least 1".to_string(),
            ));
        }
        if self.storage.backend.trim().is_empty() {
            return Err(WriterError::Configuration(
                "storage.backend must not be empty".to_string(),
            ));
        }
        if self.remote.connect_retries == 0 {
            return Err(WriterError::Configuration(
                "remote.connect_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Settings {
    // Defaults cannot fail: every key has a set_default above.
    #[allow(clippy::expect_used)]
    fn default() -> Self {
        Settings::new(None).expect("built-in settings defaults are valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let s = Settings::new(None).expect("defaults load");
        assert_eq!(s.storage.backend, "memory");
        assert_eq!(s.engine.max_workers, 8);
        assert_eq!(s.remote.default_scheme, "sim");
        assert!(s.log.configuration_logs);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("tempfile");
        writeln!(file, "[engine]\nmax_workers = 2\n[storage]\nbackend = \"memory\"\npath = \"run.nxs\"")
            .expect("write settings");
        let s = Settings::new(file.path().to_str()).expect("settings load");
        assert_eq!(s.engine.max_workers, 2);
        assert_eq!(s.storage.path, "run.nxs");
        // Untouched sections keep their defaults.
        assert_eq!(s.remote.connect_retries, 4);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("tempfile");
        writeln!(file, "[engine]\nmax_workers = 0").expect("write settings");
        let err = Settings::new(file.path().to_str());
        assert!(matches!(err, Err(WriterError::Configuration(_))));
    }
}
