use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::PathTemplate;
use crate::error::KiraError;
use crate::transfer::{Aria2Settings, ConnectionBudget, TransferMode};

pub const CONFIG_FILE_NAME: &str = "kira-dd.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub catalog: Option<String>,
    #[serde(default)]
    pub dest: Option<PathBuf>,
    #[serde(default)]
    pub dest_compressed: Option<PathBuf>,
    #[serde(default)]
    pub output_structure: Option<PathTemplate>,
    #[serde(default)]
    pub connections_total: Option<u32>,
    #[serde(default)]
    pub connections_per_server_per_download: Option<u32>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub max_tries_per_model: Option<u32>,
    #[serde(default)]
    pub aria2: Option<Aria2Entry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Aria2Entry {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub create_server: Option<bool>,
    #[serde(default)]
    pub cmdline_opts: Option<String>,
}

/// Values given on the command line; each one wins over the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub catalog: Option<String>,
    pub dest: Option<PathBuf>,
    pub dest_compressed: Option<PathBuf>,
    pub output_structure: Option<PathTemplate>,
    pub connections_total: Option<u32>,
    pub connections_per_server_per_download: Option<u32>,
    pub workers: Option<usize>,
    pub max_tries_per_model: Option<u32>,
    pub aria2_uri: Option<String>,
    pub aria2_secret: Option<String>,
    pub aria2_cmdline_opts: Option<String>,
    pub no_aria2_server: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub catalog: String,
    pub dest: PathBuf,
    pub dest_compressed: PathBuf,
    pub template: PathTemplate,
    pub budget: ConnectionBudget,
    pub workers: usize,
    pub max_attempts: u32,
    pub transfer: TransferMode,
    pub ready_timeout: Duration,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the explicit path, else `./kira-dd.json`, else the per-user config
    /// file. No file at all yields an empty config.
    pub fn load(path: Option<&str>) -> Result<Config, KiraError> {
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::discover(),
        };
        let Some(config_path) = config_path else {
            return Ok(Config::default());
        };

        debug!(path = %config_path.display(), "loading config");
        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| KiraError::ConfigParse(err.to_string()))
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("", "", "kira-dataset-downloader")
            .map(|dirs| dirs.config_dir().join("config.json"))
            .filter(|path| path.exists())
    }

    pub fn resolve_config(config: Config, overrides: Overrides) -> Result<ResolvedConfig, KiraError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let catalog = overrides
            .catalog
            .or(config.catalog)
            .ok_or(KiraError::MissingCatalog)?;

        let aria2 = config.aria2.unwrap_or_default();
        let defaults = Aria2Settings::default();
        let settings = Aria2Settings {
            uri: overrides.aria2_uri.or(aria2.uri).unwrap_or(defaults.uri),
            secret: overrides.aria2_secret.or(aria2.secret),
            create_server: !overrides.no_aria2_server
                && aria2.create_server.unwrap_or(defaults.create_server),
            cmdline_opts: overrides
                .aria2_cmdline_opts
                .or(aria2.cmdline_opts)
                .unwrap_or_default(),
        };

        let budget = ConnectionBudget::new(
            overrides
                .connections_total
                .or(config.connections_total)
                .unwrap_or(8),
            overrides
                .connections_per_server_per_download
                .or(config.connections_per_server_per_download),
        );

        Ok(ResolvedConfig {
            schema_version,
            catalog,
            dest: overrides
                .dest
                .or(config.dest)
                .unwrap_or_else(|| PathBuf::from("uncompressed")),
            dest_compressed: overrides
                .dest_compressed
                .or(config.dest_compressed)
                .unwrap_or_else(|| PathBuf::from("compressed")),
            template: overrides
                .output_structure
                .or(config.output_structure)
                .unwrap_or_default(),
            budget,
            workers: overrides
                .workers
                .or(config.workers)
                .unwrap_or_else(default_workers),
            max_attempts: overrides
                .max_tries_per_model
                .or(config.max_tries_per_model)
                .unwrap_or(3)
                .max(1),
            transfer: TransferMode::from_settings(settings),
            ready_timeout: Duration::from_secs(5),
        })
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}
