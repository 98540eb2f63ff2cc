// pgvault/src/export/sql.rs
//! Text rendering for SQL backups: identifiers, literals, DDL and row values.

use sqlx::Row;
use sqlx::postgres::PgRow;

/// Column metadata as read from `pg_attribute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    /// `format_type()` output, e.g. `character varying(64)`.
    pub data_type: String,
    /// Base type name, e.g. `varchar`, `_int4`.
    pub udt_name: String,
    pub not_null: bool,
    pub default: Option<String>,
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn qualified_name(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Types decoded natively. Everything else is selected as `::text` and
/// written back as a quoted literal, which keeps values such as `numeric`
/// `NaN`, `'infinity'` timestamps and `json` text exactly as the server
/// prints them.
const NATIVE_TYPES: &[&str] = &[
    "bool", "int2", "int4", "int8", "float4", "float8", "text", "varchar", "bpchar", "name", "uuid",
    "time", "bytea",
];

pub fn is_native(udt_name: &str) -> bool {
    NATIVE_TYPES.contains(&udt_name)
}

/// Select list that keeps the column order and names of `columns`.
pub fn select_list(columns: &[ColumnDef]) -> String {
    columns
        .iter()
        .map(|col| {
            let ident = quote_ident(&col.name);
            if is_native(&col.udt_name) {
                ident
            } else {
                format!("{}::text AS {}", ident, ident)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn create_table_statement(qualified: &str, columns: &[ColumnDef]) -> String {
    let mut ddl = format!("CREATE TABLE {} (\n", qualified);
    for (i, col) in columns.iter().enumerate() {
        if i > 0 {
            ddl.push_str(",\n");
        }
        ddl.push_str(&format!("  {} {}", quote_ident(&col.name), col.data_type));
        if col.not_null {
            ddl.push_str(" NOT NULL");
        }
        if let Some(def) = &col.default {
            ddl.push_str(&format!(" DEFAULT {}", def));
        }
    }
    ddl.push_str("\n);\n");
    ddl
}

pub fn insert_prefix(qualified: &str, columns: &[ColumnDef]) -> String {
    let names = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({}) VALUES (", qualified, names)
}

/// Strips trailing semicolons/whitespace from a server-rendered definition.
pub fn trim_definition(def: &str) -> &str {
    def.trim_end().trim_end_matches(';').trim_end()
}

fn float_literal(v: f64) -> String {
    if v.is_finite() {
        v.to_string()
    } else if v.is_nan() {
        "'NaN'".to_string()
    } else if v > 0.0 {
        "'Infinity'".to_string()
    } else {
        "'-Infinity'".to_string()
    }
}

fn render<T, F>(row: &PgRow, idx: usize, f: F) -> Result<String, sqlx::Error>
where
    T: for<'r> sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    F: FnOnce(T) -> String,
{
    Ok(row
        .try_get::<Option<T>, _>(idx)?
        .map(f)
        .unwrap_or_else(|| "NULL".to_string()))
}

/// Renders column `idx` of `row` as a SQL literal.
///
/// `udt_name` must come from the same column metadata the select list was
/// built from, so non-native types arrive here as text.
pub fn serialize_value(row: &PgRow, idx: usize, udt_name: &str) -> Result<String, sqlx::Error> {
    match udt_name {
        "bool" => render::<bool, _>(row, idx, |v| v.to_string()),
        "int2" => render::<i16, _>(row, idx, |v| v.to_string()),
        "int4" => render::<i32, _>(row, idx, |v| v.to_string()),
        "int8" => render::<i64, _>(row, idx, |v| v.to_string()),
        "float4" => render::<f32, _>(row, idx, |v| float_literal(f64::from(v))),
        "float8" => render::<f64, _>(row, idx, float_literal),
        "uuid" => render::<uuid::Uuid, _>(row, idx, |v| format!("'{}'", v)),
        "time" => render::<chrono::NaiveTime, _>(row, idx, |v| format!("'{}'", v)),
        "bytea" => render::<Vec<u8>, _>(row, idx, |v| format!("'\\x{}'", hex::encode(v))),
        _ => render::<String, _>(row, idx, |v| quote_literal(&v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, data_type: &str, udt: &str) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            data_type: data_type.to_string(),
            udt_name: udt.to_string(),
            not_null: false,
            default: None,
        }
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualified_name("public", "Order"), "\"public\".\"Order\"");
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
        assert_eq!(quote_literal("back\\slash"), "'back\\slash'");
    }

    #[test]
    fn test_create_table_statement() {
        let mut id = column("id", "bigint", "int8");
        id.not_null = true;
        id.default = Some("nextval('users_id_seq'::regclass)".to_string());
        let email = column("email", "character varying(255)", "varchar");

        let ddl = create_table_statement("\"public\".\"users\"", &[id, email]);
        assert_eq!(
            ddl,
            "CREATE TABLE \"public\".\"users\" (\n  \"id\" bigint NOT NULL DEFAULT nextval('users_id_seq'::regclass),\n  \"email\" character varying(255)\n);\n"
        );
    }

    #[test]
    fn test_select_list_casts_unknown_types_to_text() {
        let cols = vec![
            column("id", "integer", "int4"),
            column("span", "interval", "interval"),
            column("tags", "text[]", "_text"),
        ];
        assert_eq!(
            select_list(&cols),
            "\"id\", \"span\"::text AS \"span\", \"tags\"::text AS \"tags\""
        );
    }

    #[test]
    fn test_values_with_special_forms_are_read_as_text() {
        let cols = vec![
            column("amount", "numeric(12,2)", "numeric"),
            column("payload", "json", "json"),
            column("doc", "jsonb", "jsonb"),
            column("created", "timestamp with time zone", "timestamptz"),
            column("seen", "timestamp without time zone", "timestamp"),
            column("day", "date", "date"),
            column("ratio", "double precision", "float8"),
        ];
        assert_eq!(
            select_list(&cols),
            "\"amount\"::text AS \"amount\", \"payload\"::text AS \"payload\", \"doc\"::text AS \"doc\", \
             \"created\"::text AS \"created\", \"seen\"::text AS \"seen\", \"day\"::text AS \"day\", \"ratio\""
        );
        for udt in ["numeric", "json", "jsonb", "timestamptz", "timestamp", "date"] {
            assert!(!is_native(udt), "{} must not be decoded natively", udt);
        }
    }

    #[test]
    fn test_insert_prefix() {
        let cols = vec![column("a", "integer", "int4"), column("b", "text", "text")];
        assert_eq!(
            insert_prefix("\"s\".\"t\"", &cols),
            "INSERT INTO \"s\".\"t\" (\"a\", \"b\") VALUES ("
        );
    }

    #[test]
    fn test_trim_definition_and_floats() {
        assert_eq!(trim_definition(" SELECT 1;\n"), " SELECT 1");
        assert_eq!(float_literal(1.5), "1.5");
        assert_eq!(float_literal(f64::NAN), "'NaN'");
        assert_eq!(float_literal(f64::NEG_INFINITY), "'-Infinity'");
    }
}
