use std::{collections::HashMap, path::PathBuf};

use anyhow::{Context, Result, bail};
use warden_core::ModuleConfig;

const DEFAULT_CONFIG_FILE: &str = "/etc/warden/warden.ini";

/// Daemon configuration: one [`ModuleConfig`] per `INI` section.
#[derive(Debug, Clone, Default)]
pub struct WardenConfig {
    configs: HashMap<String, ModuleConfig>,
}

impl WardenConfig {
    /// Load the default file. A missing file means every default applies.
    pub fn new() -> Result<Self> {
        let config_file = PathBuf::from(DEFAULT_CONFIG_FILE);
        if !config_file.exists() {
            log::info!(
                "{} not found, using default configuration",
                config_file.display()
            );
            return Ok(Self::default());
        }
        Self::from_config_file(config_file)
    }

    /// Load a custom file, which must exist.
    pub fn with_custom_file(config_file: &str) -> Result<Self> {
        let config_file = PathBuf::from(config_file);
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        Self::from_config_file(config_file)
    }

    fn from_config_file(config_file: PathBuf) -> Result<Self> {
        let conf = ini::Ini::load_from_file(&config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;

        Ok(Self::from_ini(&conf))
    }

    fn from_ini(conf: &ini::Ini) -> Self {
        let mut configs: HashMap<String, ModuleConfig> = HashMap::new();

        for (section, prop) in conf {
            if let Some(section) = section {
                let section_config = configs.entry(section.to_string()).or_default();
                for (key, value) in prop.iter() {
                    log::debug!("{}.{}={}", section, key, value);
                    section_config.insert(key.to_string(), value.to_string());
                }
            }
        }

        Self { configs }
    }

    /// Settings of `section`, empty if the section is absent.
    pub fn get_module_config(&self, section: &str) -> ModuleConfig {
        self.configs.get(section).cloned().unwrap_or_default()
    }
}
