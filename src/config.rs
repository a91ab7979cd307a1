use std::{env, net::IpAddr, path::PathBuf};

use config::{Config, Environment, File};
use serde::Deserialize;
use tracing::debug;

use crate::bridge::BridgeConfig;
use crate::protocol::{ProtocolVariant, TrackRoutingPolicy};
use crate::recording::UploadTarget;

#[derive(Debug, Deserialize)]
pub struct Server {
    pub port: u16,
    pub host: IpAddr,
}

fn default_platform() -> String {
    "talkdesk".to_string()
}

fn default_sample_rate() -> u32 {
    8000
}

#[derive(Debug, Deserialize)]
pub struct Stream {
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default)]
    pub track_routing: Option<TrackRoutingPolicy>,
}

fn default_temp_dir() -> PathBuf {
    env::temp_dir()
}

fn default_prefix() -> String {
    "lca-audio-wav/".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Recording {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for Recording {
    fn default() -> Self {
        Self {
            enabled: false,
            temp_dir: default_temp_dir(),
            bucket: None,
            prefix: default_prefix(),
        }
    }
}

fn default_language_code() -> String {
    "en-US".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Transcribe {
    #[serde(default = "default_language_code")]
    pub language_code: String,
}

impl Default for Transcribe {
    fn default() -> Self {
        Self {
            language_code: default_language_code(),
        }
    }
}

fn default_cpu_threshold() -> f64 {
    60.0
}

#[derive(Debug, Deserialize)]
pub struct Health {
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            cpu_threshold: default_cpu_threshold(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server: Server,
    pub stream: Stream,
    #[serde(default)]
    pub recording: Recording,
    #[serde(default)]
    pub transcribe: Transcribe,
    #[serde(default)]
    pub health: Health,
}

impl Settings {
    /// Loads `config/{APP_RUN_MODE}.yaml` (if present) overlaid with `APP_*`
    /// environment variables, e.g. `APP_STREAM__ACCOUNT_ID`.
    pub fn new() -> Result<Self, anyhow::Error> {
        let run_mode = env::var("APP_RUN_MODE").unwrap_or("dev".into());
        let config = Config::builder()
            .add_source(File::with_name(&format!("config/{run_mode}.yaml")).required(false))
            .add_source(Environment::with_prefix("APP").prefix_separator("_").separator("__"))
            .build()
            .map_err(anyhow::Error::from)?;

        config.try_deserialize::<Self>().map_err(Into::into)
            .map(|settings| {
                debug!("Settings: {settings:?}");
                settings
            })
    }

    pub fn bridge_config(&self, region: &str) -> anyhow::Result<BridgeConfig> {
        let variant: ProtocolVariant = self.stream.platform.parse()?;
        if self.stream.account_id.is_empty() {
            tracing::warn!(
                "stream.account_id is empty; only an empty accountSid will be accepted"
            );
        }
        Ok(BridgeConfig {
            variant,
            account_id: self.stream.account_id.clone(),
            sample_rate: self.stream.sample_rate,
            track_routing: self.stream.track_routing,
            record_calls: self.recording.enabled,
            temp_dir: self.recording.temp_dir.clone(),
            upload: UploadTarget {
                bucket: self.recording.bucket.clone(),
                prefix: self.recording.prefix.clone(),
                region: region.to_string(),
            },
        })
    }
}
