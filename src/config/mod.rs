// pgvault/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backup::EngineSettings;
use crate::backup::compression::CompressionKind;
use crate::backup::retention::RetentionPolicy;
use crate::catalog::ObjectId;
use crate::export::{ExportScope, FormatOptions, SerializationFormat};
use crate::source::postgres::PgConnectorOptions;
use crate::source::{ConnectionDescriptor, Secret, TlsMode};

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const CONFIG_PATH_ENV: &str = "PGVAULT_CONFIG";
pub const PASSWORD_ENV: &str = "PGVAULT_PASSWORD";

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonConnection {
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
    pub username: String,
    pub password: Option<Secret>,
    pub ssl_mode: Option<TlsMode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub source_database_url: Option<String>,
    pub connection: Option<JsonConnection>,
    pub local_backup_dir: Option<PathBuf>,
    pub objects: Option<serde_json::Value>,
    pub format: Option<SerializationFormat>,
    pub compression: Option<CompressionKind>,
    pub compression_level: Option<u32>,
    pub scope: Option<ExportScope>,
    pub concurrency: Option<usize>,
    pub max_connections: Option<u32>,
    pub connect_timeout_secs: Option<u64>,
    pub progress_buffer: Option<usize>,
    pub write_failure_threshold: Option<usize>,
    pub write_manifest: Option<bool>,
    pub retention_days: Option<u32>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// `None` selects every object in the catalog.
    pub objects: Option<Vec<ObjectId>>,
    pub local_backup_path: PathBuf,
    pub options: FormatOptions,
    pub retention: Option<RetentionPolicy>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub engine: EngineSettings,
    pub connector: PgConnectorOptions,
    pub raw_json_config: RawJsonConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        Self::from_json_str(&config_content)
            .with_context(|| format!("Invalid config file at {}", config_path.display()))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw_json_config: RawJsonConfig =
            serde_json::from_str(content).context("Failed to parse JSON configuration")?;

        let defaults = EngineSettings::default();
        let concurrency = raw_json_config.concurrency.unwrap_or(defaults.concurrency);
        if concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        let engine = EngineSettings {
            concurrency,
            progress_buffer: raw_json_config
                .progress_buffer
                .unwrap_or(defaults.progress_buffer)
                .max(1),
            write_failure_threshold: raw_json_config
                .write_failure_threshold
                .unwrap_or(defaults.write_failure_threshold)
                .max(1),
            write_manifest: raw_json_config.write_manifest.unwrap_or(defaults.write_manifest),
        };
        let connector = PgConnectorOptions {
            max_connections: raw_json_config
                .max_connections
                .unwrap_or(u32::try_from(concurrency).unwrap_or(u32::MAX))
                .max(1),
            connect_timeout: Duration::from_secs(raw_json_config.connect_timeout_secs.unwrap_or(10).max(1)),
        };

        Ok(AppConfig {
            engine,
            connector,
            raw_json_config,
        })
    }
}

/// `PGVAULT_CONFIG` if set, else `config.json` in the working directory.
pub fn config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Builds the connection from either `source_database_url` or `connection`.
/// A non-empty `password_override` replaces whatever secret the file holds.
pub fn load_connection_from_json(
    raw_config: &RawJsonConfig,
    password_override: Option<String>,
) -> Result<ConnectionDescriptor> {
    let mut descriptor = match (&raw_config.source_database_url, &raw_config.connection) {
        (Some(_), Some(_)) => {
            anyhow::bail!("config.json must set either source_database_url or connection, not both")
        }
        (Some(url), None) => ConnectionDescriptor::from_url(url)
            .context("source_database_url in config.json is not a valid postgres URL")?,
        (None, Some(conn)) => {
            let mut descriptor = ConnectionDescriptor::new(
                &conn.host,
                conn.port.unwrap_or(5432),
                &conn.database,
                &conn.username,
                conn.password.clone().unwrap_or_default(),
            );
            descriptor.tls = conn.ssl_mode;
            descriptor
        }
        (None, None) => {
            anyhow::bail!("source_database_url or connection must be set in config.json")
        }
    };

    if let Some(password) = password_override.filter(|p| !p.is_empty()) {
        descriptor.secret = Secret::new(password);
    }
    if descriptor.host.trim().is_empty() || descriptor.database.trim().is_empty() {
        anyhow::bail!("connection host and database cannot be empty in config.json");
    }
    Ok(descriptor)
}

pub fn load_backup_config_from_json(raw_config: &RawJsonConfig) -> Result<BackupConfig> {
    let local_backup_path = local_backup_dir(raw_config)?;
    let options = FormatOptions {
        format: raw_config.format.unwrap_or_default(),
        compression: raw_config.compression.unwrap_or_default(),
        compression_level: raw_config.compression_level,
        scope: raw_config.scope.unwrap_or_default(),
    };
    if options.format == SerializationFormat::Csv && options.scope == ExportScope::SchemaOnly {
        anyhow::bail!("format \"csv\" carries row data only and cannot be combined with scope \"schema_only\"");
    }
    if let Some(level) = options.compression_level {
        if !(1..=9).contains(&level) {
            anyhow::bail!("compression_level must be between 1 and 9, got {}", level);
        }
    }

    Ok(BackupConfig {
        objects: parse_object_list(&raw_config.objects)?,
        local_backup_path,
        options,
        retention: raw_config
            .retention_days
            .map(|max_age_days| RetentionPolicy { max_age_days }),
    })
}

pub fn load_cleanup_config_from_json(raw_config: &RawJsonConfig) -> Result<(PathBuf, RetentionPolicy)> {
    let root = local_backup_dir(raw_config)?;
    let max_age_days = raw_config
        .retention_days
        .context("retention_days must be set in config.json for cleanup")?;
    Ok((root, RetentionPolicy { max_age_days }))
}

fn local_backup_dir(raw_config: &RawJsonConfig) -> Result<PathBuf> {
    let local_backup_path = raw_config
        .local_backup_dir
        .as_ref()
        .context("local_backup_dir must be set in config.json")?
        .clone();
    if local_backup_path.to_string_lossy().trim().is_empty() {
        return Err(anyhow::anyhow!("local_backup_dir cannot be empty in config.json."));
    }
    Ok(local_backup_path)
}

/// Accepts `["public.users", ...]` or a mapping grouped by kind,
/// `{"tables": ["public.users"], "functions": ["public.f(integer)"]}`.
/// Identifiers are unique across kinds, so the grouping is only cosmetic.
fn parse_object_list(objects: &Option<serde_json::Value>) -> Result<Option<Vec<ObjectId>>> {
    match objects {
        Some(value) => {
            let ids: Vec<String> = if value.is_array() {
                serde_json::from_value(value.clone()).context("Failed to parse objects as array")?
            } else if value.is_object() {
                let grouped: BTreeMap<String, Vec<String>> = serde_json::from_value(value.clone())
                    .context("Failed to parse objects as mapping of kind to identifiers")?;
                grouped.into_values().flatten().collect()
            } else {
                return Err(anyhow::anyhow!(
                    "objects must be either an array of identifiers or a mapping object"
                ));
            };
            if ids.iter().any(|id| id.trim().is_empty()) {
                anyhow::bail!("objects cannot contain empty identifiers");
            }
            Ok(Some(ids.into_iter().map(ObjectId::new).collect()))
        }
        None => Ok(None),
    }
}
