//! Human-readable error log formatting (spec §4.4 step 5). Not a stable
//! machine-readable format: one header line per failed table id, its error
//! message, then a blank line before the next entry.

use common::TableId;

pub struct ErrorEntry {
    pub table_id: TableId,
    pub error: anyhow::Error,
}

pub fn format_error_log(entries: &[ErrorEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&format!("Table {}\n", entry.table_id));
        out.push_str(&format!("{:#}\n", entry.error));
        out.push('\n');
    }
    out
}
