// pgvault/src/export/functions.rs
use async_stream::try_stream;
use futures::StreamExt;
use sqlx::PgPool;

use super::{FormatOptions, export_error, sql::trim_definition};
use crate::catalog::DatabaseObject;
use crate::source::ByteStream;

/// Functions have no rows; the stream is the definition text in every format.
/// The definition counts as schema, so a data-only backup leaves it out.
#[derive(Debug, Clone)]
pub struct FunctionExporter {
    pub(crate) object: DatabaseObject,
}

impl FunctionExporter {
    pub fn open(&self, pool: PgPool, options: FormatOptions) -> ByteStream {
        let object = self.object.clone();
        let scope = options.scope;
        let stream = try_stream! {
            if scope.includes_schema() {
                let def: Option<String> = sqlx::query_scalar(
                    "SELECT pg_get_functiondef(p.oid)
                     FROM pg_proc p
                     JOIN pg_namespace n ON n.oid = p.pronamespace
                     WHERE n.nspname = $1 AND p.proname = $2 AND p.prokind = 'f'
                       AND n.nspname || '.' || p.proname || '(' || pg_get_function_identity_arguments(p.oid) || ')' = $3",
                )
                .bind(&object.schema)
                .bind(&object.name)
                .bind(object.id.as_str())
                .fetch_optional(&pool)
                .await
                .map_err(|e| export_error(&object, e))?;

                let def = def.ok_or_else(|| export_error(&object, "function no longer exists"))?;
                yield format!("{};\n", trim_definition(&def)).into_bytes();
            } else {
                yield format!("-- Function {}: no row data to export\n", object.id).into_bytes();
            }
        };
        stream.boxed()
    }
}
