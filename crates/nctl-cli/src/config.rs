use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use nctl_store::StoreConfig;
use nctl_types::Namespace;
use serde::{Deserialize, Serialize};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "NCTL_TOML";
/// Environment variable selecting the namespace.
pub const NAMESPACE_ENV: &str = "CONTAINERD_NAMESPACE";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nctl/nctl.toml";

/// Contents of `nctl.toml`. Every key is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub data_root: Option<PathBuf>,
    pub address: Option<String>,
    pub namespace: Option<String>,
}

impl FileConfig {
    /// Read a config file. A missing file yields the defaults unless
    /// `required` is set.
    pub fn load(path: &Path, required: bool) -> anyhow::Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound && !required => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading config {}", path.display()))
            }
        };
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

/// Command-line values that take precedence over everything else.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub data_root: Option<PathBuf>,
    pub address: Option<String>,
    pub namespace: Option<String>,
}

/// Fully resolved settings for one invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub store: StoreConfig,
    pub namespace: Namespace,
}

impl Settings {
    /// Layer flags over the environment over the config file over defaults.
    /// `env` is the environment lookup, injectable for tests.
    pub fn resolve(
        flags: &Overrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let file = match (&flags.config, env(CONFIG_ENV)) {
            (Some(path), _) => FileConfig::load(path, true)?,
            (None, Some(path)) => FileConfig::load(Path::new(&path), false)?,
            (None, None) => FileConfig::load(Path::new(DEFAULT_CONFIG_PATH), false)?,
        };

        let defaults = StoreConfig::default();
        let store = StoreConfig {
            data_root: flags
                .data_root
                .clone()
                .or(file.data_root)
                .unwrap_or(defaults.data_root),
            address: flags
                .address
                .clone()
                .or(file.address)
                .unwrap_or(defaults.address),
        };

        let namespace = match flags
            .namespace
            .clone()
            .or_else(|| env(NAMESPACE_ENV).filter(|ns| !ns.is_empty()))
            .or(file.namespace)
        {
            Some(ns) => Namespace::new(ns).context("invalid namespace")?,
            None => Namespace::default(),
        };

        Ok(Self { store, namespace })
    }
}
