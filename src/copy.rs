//! CSV payloads for PostgreSQL `COPY ... FROM STDIN`.
//!
//! Byte columns are written as `bytea` hex literals (`\x0a1b...`) inside a quoted field,
//! with the quote and escape characters escaped, so arbitrary bytes survive the loader.

use crate::model::StorageDiff;

pub const STORAGE_DIFF_TABLE: &str = "storage_diff";
pub const STORAGE_DIFF_COLUMNS: [&str; 4] = ["height", "contract_id", "key", "value"];

const DELIMITER: char = ',';
const QUOTE: char = '"';
const ESCAPE: char = '\\';

/// Rows ready to stream into the loader together with the matching `COPY` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyPayload {
    pub body: String,
    pub command: String,
}

impl CopyPayload {
    pub fn as_bytes(&self) -> &[u8] {
        self.body.as_bytes()
    }
}

/// Encodes storage diffs for bulk loading. `None` when there is nothing to load.
pub fn storage_diffs_copy(diffs: &[StorageDiff]) -> Option<CopyPayload> {
    if diffs.is_empty() {
        return None;
    }

    let mut body = String::with_capacity(diffs.len() * 160);
    for diff in diffs {
        body.push_str(&diff.height.to_string());
        body.push(DELIMITER);
        body.push_str(&diff.contract_id.to_string());
        body.push(DELIMITER);
        write_bytes(&mut body, diff.key.bytes());
        body.push(DELIMITER);
        write_bytes(&mut body, diff.value.bytes());
        body.push('\n');
    }

    Some(CopyPayload {
        body,
        command: copy_command(STORAGE_DIFF_TABLE, &STORAGE_DIFF_COLUMNS),
    })
}

pub fn copy_command(table: &str, columns: &[&str]) -> String {
    format!(
        "COPY {table} ({}) FROM STDIN WITH (FORMAT csv, ESCAPE '{ESCAPE}', QUOTE '{QUOTE}', DELIMITER '{DELIMITER}')",
        columns.join(", ")
    )
}

fn write_bytes(out: &mut String, bytes: &[u8]) {
    write_quoted(out, &format!("\\x{}", hex::encode(bytes)));
}

fn write_quoted(out: &mut String, text: &str) {
    out.push(QUOTE);
    for c in text.chars() {
        if c == QUOTE || c == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out.push(QUOTE);
}
