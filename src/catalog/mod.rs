//! Catalog Reader: the inventory of backupable objects.

pub(crate) mod queries;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

use crate::errors::Result;
use crate::source::DataSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Table,
    View,
    MaterializedView,
    Function,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Table => "table",
            ObjectKind::View => "view",
            ObjectKind::MaterializedView => "materialized_view",
            ObjectKind::Function => "function",
        }
    }

    /// Whether rows can be fetched from the object.
    pub fn has_rows(&self) -> bool {
        !matches!(self, ObjectKind::Function)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of an object, stable within one catalog snapshot.
///
/// Relations use `schema.name`; functions append their identity arguments,
/// `schema.name(integer, text)`, so overloads stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        ObjectId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        ObjectId(value.to_string())
    }
}

/// Best-effort size hints; either part may be unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimatedSize {
    pub rows: Option<u64>,
    pub bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseObject {
    pub id: ObjectId,
    pub schema: String,
    pub name: String,
    pub kind: ObjectKind,
    pub estimated_size: EstimatedSize,
    /// Objects this one references. Informational ordering only.
    pub depends_on: Vec<ObjectId>,
}

impl DatabaseObject {
    pub fn display_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// The objects available for backup at one point in time, in a stable order.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub taken_at: DateTime<Utc>,
    objects: Vec<DatabaseObject>,
    index: HashMap<ObjectId, usize>,
}

impl CatalogSnapshot {
    pub fn new(objects: Vec<DatabaseObject>) -> Self {
        let index = objects
            .iter()
            .enumerate()
            .map(|(pos, object)| (object.id.clone(), pos))
            .collect();
        Self {
            taken_at: Utc::now(),
            objects,
            index,
        }
    }

    pub fn objects(&self) -> &[DatabaseObject] {
        &self.objects
    }

    pub fn get(&self, id: &ObjectId) -> Option<&DatabaseObject> {
        self.index.get(id).map(|&pos| &self.objects[pos])
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn count_by_kind(&self, kind: ObjectKind) -> usize {
        self.objects.iter().filter(|o| o.kind == kind).count()
    }
}

/// Drains the source's object stream into a snapshot.
pub async fn read_catalog(source: &dyn DataSource) -> Result<CatalogSnapshot> {
    let mut stream = source.list_objects();
    let mut objects = Vec::new();
    while let Some(object) = stream.try_next().await? {
        debug!(object = %object.id, kind = %object.kind, "catalog entry");
        objects.push(object);
    }
    let snapshot = CatalogSnapshot::new(objects);
    info!(
        objects = snapshot.len(),
        tables = snapshot.count_by_kind(ObjectKind::Table),
        views = snapshot.count_by_kind(ObjectKind::View),
        materialized_views = snapshot.count_by_kind(ObjectKind::MaterializedView),
        functions = snapshot.count_by_kind(ObjectKind::Function),
        "catalog loaded"
    );
    Ok(snapshot)
}
