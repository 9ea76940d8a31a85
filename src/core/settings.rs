use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::llm::{DEFAULT_MAX_TOKENS, DEFAULT_SYSTEM_PROMPT};
use crate::models::DEFAULT_CHUNK_SIZE;

const CONFIG_FILE: &str = "config.json";
const DEFAULT_MODEL_FILE: &str = "gemma-2b-it-q4.gguf";
const DEFAULT_PROBE_URL: &str = "https://clients3.google.com/generate_204";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub model_url: String,
    pub model_file_name: String,
    /// Overrides `<data dir>/models` when set.
    pub models_dir: Option<PathBuf>,
    pub model_sha256: Option<String>,
    pub auto_initialize: bool,
    pub startup_poll_delay_ms: u64,
    pub chunk_size_bytes: usize,
    pub probe_url: String,
    pub probe_interval_secs: u64,
    pub system_prompt: String,
    pub max_generated_tokens: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_url: String::new(),
            model_file_name: DEFAULT_MODEL_FILE.into(),
            models_dir: None,
            model_sha256: None,
            auto_initialize: true,
            startup_poll_delay_ms: 1500,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            probe_url: DEFAULT_PROBE_URL.into(),
            probe_interval_secs: 30,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_generated_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl Settings {
    pub fn startup_poll_delay(&self) -> Duration {
        Duration::from_millis(self.startup_poll_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}

pub struct SettingsManager {
    path: PathBuf,
    data_dir: PathBuf,
    inner: RwLock<Settings>,
}

impl SettingsManager {
    pub fn new() -> Result<Self> {
        let project_dirs = ProjectDirs::from("com", "OfflineAi", "OfflineAi")
            .context("missing project directories")?;
        let config_dir = project_dirs.config_dir();
        fs::create_dir_all(config_dir).context("creating config directory failed")?;
        Ok(Self::at(
            config_dir.join(CONFIG_FILE),
            project_dirs.data_dir().to_path_buf(),
        ))
    }

    /// Manager backed by an explicit config file and data directory.
    pub fn at(path: PathBuf, data_dir: PathBuf) -> Self {
        let settings = match load_settings(&path) {
            Ok(settings) => settings,
            Err(err) => {
                warn!("ignoring unreadable settings at {path:?}: {err:?}");
                Settings::default()
            }
        };
        Self {
            path,
            data_dir,
            inner: RwLock::new(settings),
        }
    }

    pub fn read(&self) -> Settings {
        self.inner.read().clone()
    }

    pub fn write(&self, settings: Settings) -> Result<()> {
        let mut guard = self.inner.write();
        persist_settings(&self.path, &settings)?;
        *guard = settings;
        Ok(())
    }

    pub fn models_dir(&self) -> PathBuf {
        self.inner
            .read()
            .models_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models"))
    }

    /// Fixed location of the model artifact.
    pub fn artifact_path(&self) -> PathBuf {
        let file_name = self.inner.read().model_file_name.clone();
        self.models_dir().join(file_name)
    }

    pub fn config_path(&self) -> &Path {
        &self.path
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let bytes = fs::read(path).with_context(|| format!("failed reading {path:?}"))?;
    serde_json::from_slice(&bytes).context("config json could not be parsed")
}

fn persist_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
    }
    let serialized =
        serde_json::to_vec_pretty(settings).context("serialize settings to json failed")?;
    fs::write(path, serialized).with_context(|| format!("write settings to {path:?}"))?;
    Ok(())
}
