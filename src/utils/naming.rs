// pgvault/src/utils/naming.rs
//! File naming for backup artifacts.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::catalog::DatabaseObject;
use crate::export::FormatOptions;

/// Timestamp embedded in every backup and manifest file name.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H_%M_%S";

/// Keeps `[A-Za-z0-9_.-]`; everything else becomes `_`.
pub fn sanitize(identifier: &str) -> String {
    identifier
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Leading hex digits of the run id that go into backup file names.
const RUN_SUFFIX_LEN: usize = 8;

fn run_suffix(run_id: Uuid) -> String {
    let mut simple = run_id.simple().to_string();
    simple.truncate(RUN_SUFFIX_LEN);
    simple
}

/// `<kind>_<sanitised id>_<timestamp>_<run>.<ext>`
///
/// The run suffix keeps two runs started within the same second apart.
pub fn backup_file_name(
    object: &DatabaseObject,
    options: &FormatOptions,
    at: DateTime<Utc>,
    run_id: Uuid,
) -> String {
    format!(
        "{}_{}_{}_{}.{}",
        object.kind,
        sanitize(object.id.as_str()),
        at.format(TIMESTAMP_FORMAT),
        run_suffix(run_id),
        options.file_extension_for(object.kind)
    )
}

pub fn manifest_file_name(run_id: Uuid, at: DateTime<Utc>) -> String {
    format!("backup_run_{}_{}.json", at.format(TIMESTAMP_FORMAT), run_id.simple())
}

/// Unique per run; part of every temp file name the run creates.
pub fn temp_tag(run_id: Uuid) -> String {
    run_id.simple().to_string()
}

/// `<anything>_<timestamp>[_<run suffix or full run id>].<extension>`; the
/// greedy prefix makes the last timestamp in the name win.
static TIMESTAMP_IN_NAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^[^.].*_(\d{4}-\d{2}-\d{2}_\d{2}_\d{2}_\d{2})(?:_[0-9a-f]{8}|_[0-9a-f]{32})?\.[A-Za-z0-9.]+$",
    )
    .ok()
});

/// Recovers the timestamp from a name produced by [`backup_file_name`] or
/// [`manifest_file_name`].
pub fn parse_timestamp(file_name: &str) -> Option<DateTime<Utc>> {
    let captures = TIMESTAMP_IN_NAME.as_ref()?.captures(file_name)?;
    NaiveDateTime::parse_from_str(captures.get(1)?.as_str(), TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
