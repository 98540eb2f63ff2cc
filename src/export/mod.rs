//! Object Exporter: turns one catalog object into a lazy byte stream.
//!
//! Each object kind has its own exporter; [`ObjectExporter`] is the tagged
//! variant the source dispatches on. All of them share the same contract:
//! a finite, single-pass [`ByteStream`] that issues fresh queries every time it
//! is opened and never holds more than one chunk of output in memory.

pub mod sql;
mod functions;
mod relations;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

pub use functions::FunctionExporter;
pub use relations::{MaterializedViewExporter, TableExporter, ViewExporter};

use crate::backup::compression::CompressionKind;
use crate::catalog::{DatabaseObject, ObjectKind};
use crate::errors::BackupError;
use crate::source::ByteStream;

/// Output is handed downstream once this much text has accumulated.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationFormat {
    /// DDL plus one `INSERT` statement per row.
    #[default]
    Sql,
    /// `COPY ... TO STDOUT` CSV with a header row. Row data only.
    Csv,
}

impl SerializationFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            SerializationFormat::Sql => "sql",
            SerializationFormat::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportScope {
    #[default]
    SchemaAndData,
    SchemaOnly,
    DataOnly,
}

impl ExportScope {
    pub fn includes_schema(&self) -> bool {
        !matches!(self, ExportScope::DataOnly)
    }

    pub fn includes_data(&self) -> bool {
        !matches!(self, ExportScope::SchemaOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FormatOptions {
    #[serde(default)]
    pub format: SerializationFormat,
    #[serde(default)]
    pub compression: CompressionKind,
    #[serde(default)]
    pub compression_level: Option<u32>,
    #[serde(default)]
    pub scope: ExportScope,
}

impl FormatOptions {
    /// File extension including the compression suffix, e.g. `sql.gz`.
    pub fn file_extension(&self) -> String {
        self.with_compression(self.format.extension())
    }

    /// Functions carry no rows, so their definition is written as SQL in
    /// every format.
    pub fn file_extension_for(&self, kind: ObjectKind) -> String {
        match kind {
            ObjectKind::Function => self.with_compression(SerializationFormat::Sql.extension()),
            _ => self.file_extension(),
        }
    }

    fn with_compression(&self, base: &str) -> String {
        match self.compression.extension() {
            Some(suffix) => format!("{}.{}", base, suffix),
            None => base.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ObjectExporter {
    Table(TableExporter),
    View(ViewExporter),
    MaterializedView(MaterializedViewExporter),
    Function(FunctionExporter),
}

impl ObjectExporter {
    pub fn for_object(object: &DatabaseObject) -> Self {
        let object = object.clone();
        match object.kind {
            ObjectKind::Table => ObjectExporter::Table(TableExporter { object }),
            ObjectKind::View => ObjectExporter::View(ViewExporter { object }),
            ObjectKind::MaterializedView => {
                ObjectExporter::MaterializedView(MaterializedViewExporter { object })
            }
            ObjectKind::Function => ObjectExporter::Function(FunctionExporter { object }),
        }
    }

    pub fn open(&self, pool: PgPool, options: FormatOptions) -> ByteStream {
        match self {
            ObjectExporter::Table(exporter) => exporter.open(pool, options),
            ObjectExporter::View(exporter) => exporter.open(pool, options),
            ObjectExporter::MaterializedView(exporter) => exporter.open(pool, options),
            ObjectExporter::Function(exporter) => exporter.open(pool, options),
        }
    }
}

pub(crate) fn export_error(object: &DatabaseObject, cause: impl std::fmt::Display) -> BackupError {
    BackupError::export(object.id.as_str(), cause)
}

pub(crate) fn sql_header(object: &DatabaseObject) -> Vec<u8> {
    format!(
        "-- PostgreSQL {} backup\n-- Object: {}\n-- Backup time: {}\nBEGIN;\n\n",
        object.kind,
        object.id,
        Utc::now().to_rfc3339()
    )
    .into_bytes()
}

pub(crate) fn sql_footer() -> Vec<u8> {
    b"\nCOMMIT;\n".to_vec()
}
