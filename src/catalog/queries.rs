// pgvault/src/catalog/queries.rs
use async_stream::try_stream;
use futures::{StreamExt, TryStreamExt};
use futures::stream::BoxStream;
use sqlx::{PgPool, Row};
use std::collections::HashMap;

use super::{DatabaseObject, EstimatedSize, ObjectId, ObjectKind};
use crate::errors::{BackupError, Result};

const SYSTEM_SCHEMA_FILTER: &str = "n.nspname NOT IN ('pg_catalog', 'information_schema')
           AND n.nspname NOT LIKE 'pg\\_toast%'
           AND n.nspname NOT LIKE 'pg\\_temp\\_%'";

/// Relations and functions in one ordered pass. Extension-owned objects are
/// skipped since restoring the extension recreates them.
fn objects_query() -> String {
    format!(
        r#"
        SELECT oid, schema_name, object_name, kind, identity_args, estimated_rows, estimated_bytes
        FROM (
            SELECT c.oid::bigint AS oid,
                   n.nspname::text AS schema_name,
                   c.relname::text AS object_name,
                   CASE c.relkind WHEN 'v' THEN 'view'
                                  WHEN 'm' THEN 'materialized_view'
                                  ELSE 'table' END AS kind,
                   NULL::text AS identity_args,
                   CASE WHEN c.relkind IN ('r', 'p', 'm') AND c.reltuples >= 0
                        THEN c.reltuples::bigint END AS estimated_rows,
                   CASE WHEN c.relkind IN ('r', 'p', 'm')
                        THEN pg_total_relation_size(c.oid)::bigint END AS estimated_bytes
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relkind IN ('r', 'p', 'v', 'm')
              AND NOT c.relispartition
              AND {filter}
              AND NOT EXISTS (
                  SELECT 1 FROM pg_depend d
                  WHERE d.classid = 'pg_class'::regclass AND d.objid = c.oid AND d.deptype = 'e')
            UNION ALL
            SELECT p.oid::bigint,
                   n.nspname::text,
                   p.proname::text,
                   'function',
                   pg_get_function_identity_arguments(p.oid),
                   NULL::bigint,
                   octet_length(p.prosrc)::bigint
            FROM pg_proc p
            JOIN pg_namespace n ON n.oid = p.pronamespace
            WHERE p.prokind = 'f'
              AND {filter}
              AND NOT EXISTS (
                  SELECT 1 FROM pg_depend d
                  WHERE d.classid = 'pg_proc'::regclass AND d.objid = p.oid AND d.deptype = 'e')
        ) objects
        ORDER BY kind, schema_name, object_name, identity_args NULLS FIRST
        "#,
        filter = SYSTEM_SCHEMA_FILTER
    )
}

/// Which relations and functions each view or materialized view reads from.
const DEPENDENCIES_QUERY: &str = r#"
    SELECT DISTINCT r.ev_class::bigint AS dependent_oid,
           CASE WHEN d.refclassid = 'pg_proc'::regclass
                THEN pn.nspname || '.' || p.proname || '(' || pg_get_function_identity_arguments(p.oid) || ')'
                ELSE cn.nspname || '.' || c.relname END AS referenced_id
    FROM pg_depend d
    JOIN pg_rewrite r ON r.oid = d.objid
    LEFT JOIN pg_class c ON d.refclassid = 'pg_class'::regclass AND c.oid = d.refobjid
    LEFT JOIN pg_namespace cn ON cn.oid = c.relnamespace
    LEFT JOIN pg_proc p ON d.refclassid = 'pg_proc'::regclass AND p.oid = d.refobjid
    LEFT JOIN pg_namespace pn ON pn.oid = p.pronamespace
    WHERE d.classid = 'pg_rewrite'::regclass
      AND d.refclassid IN ('pg_class'::regclass, 'pg_proc'::regclass)
      AND d.refobjid <> r.ev_class
    ORDER BY 1, 2
"#;

pub(crate) fn object_id(schema: &str, name: &str, identity_args: Option<&str>) -> ObjectId {
    match identity_args {
        Some(args) => ObjectId::new(format!("{}.{}({})", schema, name, args)),
        None => ObjectId::new(format!("{}.{}", schema, name)),
    }
}

fn parse_kind(raw: &str) -> Result<ObjectKind> {
    match raw {
        "table" => Ok(ObjectKind::Table),
        "view" => Ok(ObjectKind::View),
        "materialized_view" => Ok(ObjectKind::MaterializedView),
        "function" => Ok(ObjectKind::Function),
        other => Err(BackupError::Query(format!("unexpected object kind '{}' in catalog", other))),
    }
}

async fn load_dependencies(pool: &PgPool) -> Result<HashMap<i64, Vec<ObjectId>>> {
    let rows = sqlx::query(DEPENDENCIES_QUERY).fetch_all(pool).await?;
    let mut deps: HashMap<i64, Vec<ObjectId>> = HashMap::new();
    for row in rows {
        let dependent: i64 = row.try_get("dependent_oid")?;
        let referenced: Option<String> = row.try_get("referenced_id")?;
        if let Some(referenced) = referenced {
            deps.entry(dependent).or_default().push(ObjectId::new(referenced));
        }
    }
    Ok(deps)
}

/// Streams the catalog with a server-side cursor instead of materialising it.
pub(crate) fn stream_objects(pool: PgPool) -> BoxStream<'static, Result<DatabaseObject>> {
    let stream = try_stream! {
        let mut deps = load_dependencies(&pool).await?;
        let sql = objects_query();
        let mut rows = sqlx::query(&sql).fetch(&pool);
        while let Some(row) = rows.try_next().await.map_err(BackupError::from)? {
            let oid: i64 = row.try_get("oid").map_err(BackupError::from)?;
            let schema: String = row.try_get("schema_name").map_err(BackupError::from)?;
            let name: String = row.try_get("object_name").map_err(BackupError::from)?;
            let kind: String = row.try_get("kind").map_err(BackupError::from)?;
            let identity_args: Option<String> = row.try_get("identity_args").map_err(BackupError::from)?;
            let rows_estimate: Option<i64> = row.try_get("estimated_rows").map_err(BackupError::from)?;
            let bytes_estimate: Option<i64> = row.try_get("estimated_bytes").map_err(BackupError::from)?;

            let kind = parse_kind(&kind)?;
            // Relations and functions live in different oid spaces.
            let depends_on = if kind == ObjectKind::Function {
                Vec::new()
            } else {
                deps.remove(&oid).unwrap_or_default()
            };

            yield DatabaseObject {
                id: object_id(&schema, &name, identity_args.as_deref()),
                schema,
                name,
                kind,
                estimated_size: EstimatedSize {
                    rows: rows_estimate.and_then(|v| u64::try_from(v).ok()),
                    bytes: bytes_estimate.and_then(|v| u64::try_from(v).ok()),
                },
                depends_on,
            };
        }
    };
    stream.boxed()
}
