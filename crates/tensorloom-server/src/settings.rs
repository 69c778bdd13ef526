use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Daemon settings, layered defaults < settings file < `TENSORLOOM_*`
/// environment variables. Command-line flags override on top of this in
/// `main`.
#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    /// Address the HTTP listener binds.
    pub http_addr: String,
    /// Root directory of the model repository.
    pub repository: PathBuf,
    /// How long a stage batcher waits for co-batchable requests before
    /// dispatching a partial batch, in milliseconds.
    pub batch_delay_ms: u64,
}

impl Settings {
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("http_addr", "0.0.0.0:8000")?
            .set_default("repository", "model_repository")?
            .set_default("batch_delay_ms", 5_u64)?;
        if let Some(path) = file {
            builder = builder.add_source(File::from(path.to_path_buf()));
        }
        builder
            .add_source(Environment::with_prefix("TENSORLOOM"))
            .build()?
            .try_deserialize()
            .context("invalid daemon settings")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_settings_file() {
        let settings = Settings::load(None).expect("defaults should load");
        assert_eq!(settings.http_addr, "0.0.0.0:8000");
        assert_eq!(settings.repository, PathBuf::from("model_repository"));
        assert_eq!(settings.batch_delay_ms, 5);
    }

    #[test]
    fn settings_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tensorloomd.toml");
        std::fs::write(
            &path,
            "http_addr = \"127.0.0.1:9001\"\nbatch_delay_ms = 20\n",
        )
        .expect("write settings");

        let settings = Settings::load(Some(&path)).expect("file should load");
        assert_eq!(settings.http_addr, "127.0.0.1:9001");
        assert_eq!(settings.batch_delay_ms, 20);
        assert_eq!(settings.repository, PathBuf::from("model_repository"));
    }
}
