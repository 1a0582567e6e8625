//! Bordered tabular report, totals footer, and failed-tables appendix,
//! written to `reporter/<op_type>_<timestamp>.out` (spec §4.13, §6).

use crate::state::RunState;
use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use std::path::{Path, PathBuf};

pub fn report_path(cwd: &Path, op_type: &str, timestamp: &str) -> PathBuf {
    cwd.join("reporter").join(format!("{op_type}_{timestamp}.out"))
}

pub fn render(run_state: &RunState, op_type: &str) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Table",
            "Rows",
            "Uncompressed",
            "Compressed",
            "Remote",
            "Partitions",
            "Elapsed (s)",
            "Status",
        ]);

    for t in &run_state.tables {
        table.add_row(vec![
            t.table.clone(),
            t.rows.to_string(),
            format_readable_size(t.uncompressed_bytes),
            format_readable_size(t.compressed_bytes),
            format_readable_size(t.remote_bytes),
            t.partitions.to_string(),
            format!("{:.1}", t.elapsed.as_secs_f64()),
            t.outcome.to_string(),
        ]);
    }

    let totals = run_state.totals();
    let mut out = format!("cluster-backup {op_type} report\n\n{table}\n\n");
    out += &format!(
        "TOTAL: {} rows, {} uncompressed, {} compressed, {} remote, {} partitions, {:.1}s, {}\n",
        totals.rows,
        format_readable_size(totals.uncompressed_bytes),
        format_readable_size(totals.compressed_bytes),
        format_readable_size(totals.remote_bytes),
        totals.partitions,
        totals.elapsed.as_secs_f64(),
        totals.outcome,
    );

    let failed = run_state.failed();
    if !failed.is_empty() {
        out += "\nFailed Tables:\n";
        for t in failed {
            out += &format!(
                "  - {}: {}\n",
                t.table,
                t.cause.as_deref().unwrap_or("unknown cause")
            );
        }
    }

    out
}

pub fn write_report(cwd: &Path, op_type: &str, timestamp: &str, run_state: &RunState) -> Result<PathBuf> {
    let path = report_path(cwd, op_type, timestamp);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating report directory `{}`", parent.display()))?;
    }
    std::fs::write(&path, render(run_state, op_type))
        .with_context(|| format!("writing report to `{}`", path.display()))?;
    Ok(path)
}

fn format_readable_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}{}", UNITS[unit])
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TableState;

    #[test]
    fn readable_size_formats_across_thresholds() {
        assert_eq!(format_readable_size(512), "512B");
        assert_eq!(format_readable_size(2048), "2.00KB");
        assert_eq!(format_readable_size(5 * 1024 * 1024), "5.00MB");
    }

    #[test]
    fn render_includes_failed_tables_appendix() {
        let mut state = RunState::default();
        let mut t = TableState::new("default.t");
        t.mark_failure("verification miss");
        state.tables.push(t);

        let rendered = render(&state, "backup");
        assert!(rendered.contains("Failed Tables:"));
        assert!(rendered.contains("verification miss"));
    }
}
