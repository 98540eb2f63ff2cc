// pgvault/src/export/relations.rs
use async_stream::try_stream;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, TryStreamExt};
use sqlx::{PgPool, Row};
use std::future::Future;
use tracing::debug;

use super::sql::{
    ColumnDef, create_table_statement, insert_prefix, qualified_name, select_list, serialize_value,
    trim_definition,
};
use super::{
    CHUNK_SIZE, ExportScope, FormatOptions, SerializationFormat, export_error, sql_footer, sql_header,
};
use crate::catalog::DatabaseObject;
use crate::errors::Result;
use crate::source::ByteStream;

#[derive(Debug, Clone)]
pub struct TableExporter {
    pub(crate) object: DatabaseObject,
}

#[derive(Debug, Clone)]
pub struct ViewExporter {
    pub(crate) object: DatabaseObject,
}

#[derive(Debug, Clone)]
pub struct MaterializedViewExporter {
    pub(crate) object: DatabaseObject,
}

async fn load_columns(pool: &PgPool, qualified: &str) -> std::result::Result<Vec<ColumnDef>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT a.attname::text AS column_name,
                format_type(a.atttypid, a.atttypmod) AS data_type,
                t.typname::text AS udt_name,
                a.attnotnull AS not_null,
                pg_get_expr(ad.adbin, ad.adrelid) AS column_default
         FROM pg_attribute a
         JOIN pg_type t ON t.oid = a.atttypid
         LEFT JOIN pg_attrdef ad ON ad.adrelid = a.attrelid AND ad.adnum = a.attnum
         WHERE a.attrelid = $1::regclass AND a.attnum > 0 AND NOT a.attisdropped
         ORDER BY a.attnum",
    )
    .bind(qualified)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(ColumnDef {
                name: row.try_get("column_name")?,
                data_type: row.try_get("data_type")?,
                udt_name: row.try_get("udt_name")?,
                not_null: row.try_get("not_null")?,
                default: row.try_get("column_default")?,
            })
        })
        .collect()
}

/// Constraints first (primary, unique, check, foreign), then indexes that no
/// constraint owns.
async fn load_constraints_and_indexes(
    pool: &PgPool,
    qualified: &str,
) -> std::result::Result<String, sqlx::Error> {
    let mut ddl = String::new();

    let constraints = sqlx::query(
        "SELECT conname::text AS name, pg_get_constraintdef(oid) AS def
         FROM pg_constraint
         WHERE conrelid = $1::regclass AND contype IN ('p', 'u', 'c', 'f', 'x')
         ORDER BY CASE contype WHEN 'p' THEN 0 WHEN 'u' THEN 1 WHEN 'c' THEN 2 WHEN 'x' THEN 3 ELSE 4 END,
                  conname",
    )
    .bind(qualified)
    .fetch_all(pool)
    .await?;

    for row in &constraints {
        let name: String = row.try_get("name")?;
        let def: String = row.try_get("def")?;
        ddl.push_str(&format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {};\n",
            qualified,
            super::sql::quote_ident(&name),
            def
        ));
    }

    let indexes = sqlx::query(
        "SELECT pg_get_indexdef(i.indexrelid) AS def
         FROM pg_index i
         WHERE i.indrelid = $1::regclass
           AND NOT EXISTS (SELECT 1 FROM pg_constraint c WHERE c.conindid = i.indexrelid)
         ORDER BY i.indexrelid",
    )
    .bind(qualified)
    .fetch_all(pool)
    .await?;

    for row in &indexes {
        let def: String = row.try_get("def")?;
        ddl.push_str(&format!("{};\n", def));
    }

    Ok(ddl)
}

async fn load_view_definition(pool: &PgPool, qualified: &str) -> std::result::Result<String, sqlx::Error> {
    let def: String = sqlx::query_scalar("SELECT pg_get_viewdef($1::regclass, true)")
        .bind(qualified)
        .fetch_one(pool)
        .await?;
    Ok(trim_definition(&def).to_string())
}

/// Regroups `input` into chunks of at least [`CHUNK_SIZE`] bytes; only the
/// last one may be shorter. An empty input yields nothing.
pub(crate) fn rechunk<S, B>(input: S) -> ByteStream
where
    S: Stream<Item = Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let stream = try_stream! {
        let mut input = Box::pin(input);
        let mut buf: Vec<u8> = Vec::with_capacity(CHUNK_SIZE);
        while let Some(piece) = input.try_next().await? {
            buf.extend_from_slice(piece.as_ref());
            if buf.len() >= CHUNK_SIZE {
                yield std::mem::replace(&mut buf, Vec::with_capacity(CHUNK_SIZE));
            }
        }
        if !buf.is_empty() {
            yield buf;
        }
    };
    stream.boxed()
}

/// Streams a relation's rows as `COPY` CSV.
fn csv_rows(pool: PgPool, object: DatabaseObject) -> ByteStream {
    let copied = try_stream! {
        let qualified = qualified_name(&object.schema, &object.name);
        let statement = format!(
            "COPY (SELECT * FROM {}) TO STDOUT WITH (FORMAT csv, HEADER true)",
            qualified
        );
        debug!(object = %object.id, "starting COPY export");
        let mut conn = pool.acquire().await.map_err(|e| export_error(&object, e))?;
        let mut copy = conn
            .copy_out_raw(&statement)
            .await
            .map_err(|e| export_error(&object, e))?;
        while let Some(chunk) = copy.try_next().await.map_err(|e| export_error(&object, e))? {
            yield chunk;
        }
    };
    rechunk(copied)
}

/// Row values rendered as SQL literals, fetched through a cursor.
fn row_values(
    pool: PgPool,
    object: DatabaseObject,
    sql: String,
    columns: Vec<ColumnDef>,
) -> BoxStream<'static, Result<Vec<String>>> {
    let stream = try_stream! {
        let mut rows = sqlx::query(&sql).fetch(&pool);
        while let Some(row) = rows.try_next().await.map_err(|e| export_error(&object, e))? {
            let mut values = Vec::with_capacity(columns.len());
            for (idx, col) in columns.iter().enumerate() {
                let value = serialize_value(&row, idx, &col.udt_name)
                    .map_err(|e| export_error(&object, format!("column {}: {}", col.name, e)))?;
                values.push(value);
            }
            yield values;
        }
    };
    stream.boxed()
}

/// One `INSERT` per row, then a row count comment.
pub(crate) fn insert_statements<S>(prefix: String, rows: S) -> ByteStream
where
    S: Stream<Item = Result<Vec<String>>> + Send + 'static,
{
    let statements = try_stream! {
        let mut rows = Box::pin(rows);
        let mut row_count: u64 = 0;
        while let Some(values) = rows.try_next().await? {
            row_count += 1;
            yield format!("{}{});\n", prefix, values.join(", ")).into_bytes();
        }
        debug!(rows = row_count, "row export finished");
        yield format!("-- Total rows: {}\n", row_count).into_bytes();
    };
    rechunk(statements)
}

fn insert_rows(
    pool: PgPool,
    object: DatabaseObject,
    qualified: String,
    columns: Vec<ColumnDef>,
) -> ByteStream {
    if columns.is_empty() {
        return stream::empty().boxed();
    }
    let sql = format!("SELECT {} FROM {}", select_list(&columns), qualified);
    let prefix = insert_prefix(&qualified, &columns);
    insert_statements(prefix, row_values(pool, object, sql, columns))
}

/// Header, table DDL, rows, constraints and indexes, footer. Parts outside
/// `scope` are skipped without being polled; `constraints` runs only after
/// every row is out.
pub(crate) fn table_script<C>(
    object: DatabaseObject,
    scope: ExportScope,
    ddl: String,
    rows: ByteStream,
    constraints: C,
) -> ByteStream
where
    C: Future<Output = Result<String>> + Send + 'static,
{
    let stream = try_stream! {
        yield sql_header(&object);

        if scope.includes_schema() {
            yield format!("-- Table structure\n{}", ddl).into_bytes();
        }

        if scope.includes_data() {
            yield format!("\n-- Data for table: {}\n", object.id).into_bytes();
            let mut rows = rows;
            while let Some(chunk) = rows.try_next().await? {
                yield chunk;
            }
        }

        // Constraints and indexes go after the data so restores load fast.
        if scope.includes_schema() {
            let ddl = constraints.await?;
            if !ddl.is_empty() {
                yield format!("\n-- Constraints and indexes\n{}", ddl).into_bytes();
            }
        }

        yield sql_footer();
    };
    stream.boxed()
}

impl TableExporter {
    pub fn open(&self, pool: PgPool, options: FormatOptions) -> ByteStream {
        if options.format == SerializationFormat::Csv {
            return csv_rows(pool, self.object.clone());
        }

        let object = self.object.clone();
        let scope = options.scope;
        let stream = try_stream! {
            let qualified = qualified_name(&object.schema, &object.name);
            let columns = load_columns(&pool, &qualified)
                .await
                .map_err(|e| export_error(&object, e))?;

            let ddl = create_table_statement(&qualified, &columns);
            let rows = insert_rows(pool.clone(), object.clone(), qualified.clone(), columns);
            let constraints = {
                let pool = pool.clone();
                let object = object.clone();
                let qualified = qualified.clone();
                async move {
                    load_constraints_and_indexes(&pool, &qualified)
                        .await
                        .map_err(|e| export_error(&object, e))
                }
            };

            let mut script = table_script(object.clone(), scope, ddl, rows, constraints);
            while let Some(chunk) = script.try_next().await? {
                yield chunk;
            }
        };
        stream.boxed()
    }
}

/// Header, `CREATE VIEW` when `scope` includes schema, footer. A plain view
/// holds no rows of its own, so `definition` is not polled for data-only
/// backups.
pub(crate) fn view_script<D>(object: DatabaseObject, scope: ExportScope, definition: D) -> ByteStream
where
    D: Future<Output = Result<String>> + Send + 'static,
{
    let stream = try_stream! {
        yield sql_header(&object);
        if scope.includes_schema() {
            let def = definition.await?;
            let qualified = qualified_name(&object.schema, &object.name);
            yield format!("CREATE OR REPLACE VIEW {} AS\n{};\n", qualified, def).into_bytes();
        } else {
            yield format!("-- View {}: no row data to export\n", object.id).into_bytes();
        }
        yield sql_footer();
    };
    stream.boxed()
}

impl ViewExporter {
    pub fn open(&self, pool: PgPool, options: FormatOptions) -> ByteStream {
        if options.format == SerializationFormat::Csv {
            return csv_rows(pool, self.object.clone());
        }

        let object = self.object.clone();
        let definition = async move {
            let qualified = qualified_name(&object.schema, &object.name);
            load_view_definition(&pool, &qualified)
                .await
                .map_err(|e| export_error(&object, e))
        };
        view_script(self.object.clone(), options.scope, definition)
    }
}

impl MaterializedViewExporter {
    pub fn open(&self, pool: PgPool, options: FormatOptions) -> ByteStream {
        if options.format == SerializationFormat::Csv {
            return csv_rows(pool, self.object.clone());
        }

        let object = self.object.clone();
        let scope = options.scope;
        let stream = try_stream! {
            let qualified = qualified_name(&object.schema, &object.name);
            let def = load_view_definition(&pool, &qualified)
                .await
                .map_err(|e| export_error(&object, e))?;
            let indexes = load_constraints_and_indexes(&pool, &qualified)
                .await
                .map_err(|e| export_error(&object, e))?;

            yield sql_header(&object);
            let mut body = String::new();
            if scope.includes_schema() {
                body.push_str(&format!(
                    "CREATE MATERIALIZED VIEW {} AS\n{}\nWITH NO DATA;\n{}",
                    qualified, def, indexes
                ));
            }
            // Contents are rebuilt from the definition rather than copied.
            if scope.includes_data() {
                body.push_str(&format!("REFRESH MATERIALIZED VIEW {};\n", qualified));
            }
            yield body.into_bytes();
            yield sql_footer();
        };
        stream.boxed()
    }
}
