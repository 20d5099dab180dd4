//! Text and NDJSON rendering of summaries, diffs and referrer trees.

use crate::diff::ObjectDiff;
use crate::refbrowser::{Child, Node};
use crate::summary::{Diff, Row, Summary};
use std::cmp::Ordering;
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use thiserror::Error;

pub const SUMMARY_FORMAT: &str = "heapwatch-summary";
pub const DIFF_FORMAT: &str = "heapwatch-diff";
pub const NDJSON_VERSION: &str = "1.0";

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// Column a summary table is sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    Type,
    Count,
    #[default]
    Size,
}

impl FromStr for SortBy {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "type" => Ok(SortBy::Type),
            "count" | "#" => Ok(SortBy::Count),
            "size" => Ok(SortBy::Size),
            other => Err(RenderError::InvalidArgument(format!(
                "invalid sort '{}', should be one of type, count, size",
                other
            ))),
        }
    }
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortBy::Type => "type",
            SortBy::Count => "count",
            SortBy::Size => "size",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    Ascending,
    #[default]
    Descending,
}

impl FromStr for Order {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ascending" | "asc" => Ok(Order::Ascending),
            "descending" | "desc" => Ok(Order::Descending),
            other => Err(RenderError::InvalidArgument(format!(
                "invalid order '{}', should be one of ascending, descending",
                other
            ))),
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Order::Ascending => "ascending",
            Order::Descending => "descending",
        })
    }
}

/// How a summary table is laid out.
#[derive(Debug, Clone)]
pub struct SummaryOptions {
    /// Maximum number of rows shown.
    pub limit: usize,
    pub sort: SortBy,
    pub order: Order,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            limit: 15,
            sort: SortBy::Size,
            order: Order::Descending,
        }
    }
}

/// Rows of `summary` sorted and limited according to `options`.
///
/// Sorting is stable: rows comparing equal keep their summary order.
pub fn sorted_rows<'a>(summary: &'a Summary, options: &SummaryOptions) -> Vec<&'a Row> {
    let mut rows: Vec<&Row> = summary.iter().collect();
    rows.sort_by(|a, b| {
        let ord: Ordering = match options.sort {
            SortBy::Type => a.type_key.cmp(&b.type_key),
            SortBy::Count => a.count.cmp(&b.count),
            SortBy::Size => a.total_size.cmp(&b.total_size),
        };
        match options.order {
            Order::Ascending => ord,
            Order::Descending => ord.reverse(),
        }
    });
    rows.truncate(options.limit);
    rows
}

const HEADER: [&str; 3] = ["types", "# objects", "total size"];
const PADDING: usize = 1;

/// Render a summary or diff as a right-justified table:
///
/// ```text
///   types |   # objects |   total size
/// ======= | =========== | ============
///     str |           2 |          100
/// ```
pub fn format_summary(summary: &Summary, options: &SummaryOptions) -> String {
    let mut table: Vec<[String; 3]> = vec![HEADER.map(String::from)];
    for row in sorted_rows(summary, options) {
        table.push([
            row.type_key.to_string(),
            row.count.to_string(),
            row.total_size.to_string(),
        ]);
    }

    let mut widths = [0usize; 3];
    for cells in &table {
        for (width, cell) in widths.iter_mut().zip(cells) {
            *width = (*width).max(cell.chars().count() + 2 * PADDING);
        }
    }

    let mut out = String::new();
    for (i, cells) in table.iter().enumerate() {
        let line: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:>width$}", cell, width = width))
            .collect();
        out.push_str(&line.join(" | "));
        out.push('\n');

        if i == 0 {
            let border: Vec<String> = widths.iter().map(|w| "=".repeat(*w)).collect();
            out.push_str(&border.join(" | "));
            out.push('\n');
        }
    }
    out
}

/// Draw a referrer tree with `-`, `+` and `|` connectors:
///
/// ```text
/// str 0x2-+-module 0x1
///         +-list 0x3--module 0x1 (already included, id=0x1)
/// ```
///
/// Levels below `max_depth` are cut off.
pub fn format_tree(node: &Node, max_depth: Option<usize>) -> String {
    let mut lines = Vec::new();
    draw(
        &mut lines,
        &node.label,
        &node.children,
        0,
        max_depth,
        String::new(),
        String::new(),
    );

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// `prefix` is the start of the current line; `carryon` continues the
/// vertical connectors of open branches on the lines below it.
fn draw(
    lines: &mut Vec<String>,
    label: &str,
    children: &[Child],
    level: usize,
    max_depth: Option<usize>,
    mut prefix: String,
    mut carryon: String,
) {
    prefix.push_str(label);
    carryon.push_str(&" ".repeat(label.chars().count()));

    if children.is_empty() || max_depth == Some(level) {
        lines.push(prefix);
        return;
    }

    prefix.push('-');
    carryon.push(' ');
    if children.len() > 1 {
        prefix.push('+');
        carryon.push('|');
    }
    prefix.push('-');
    carryon.push(' ');

    let last = children.len() - 1;
    for (i, child) in children.iter().enumerate() {
        // carryon holds only spaces and connectors, so byte offsets are safe
        let stem = &carryon[..carryon.len() - 2];
        let line_prefix = if i == 0 {
            prefix.clone()
        } else {
            format!("{}+-", stem)
        };
        if i == last && i > 0 {
            carryon = format!("{}  ", stem);
        }

        let grandchildren: &[Child] = match child {
            Child::Node(node) => &node.children,
            Child::Seen(_) => &[],
        };
        draw(
            lines,
            child.label(),
            grandchildren,
            level + 1,
            max_depth,
            line_prefix,
            carryon.clone(),
        );

        if i == last && i > 0 {
            if carryon.trim_matches(' ').is_empty() {
                return;
            }
            lines.push(carryon[..carryon.len() - 2].trim_end().to_string());
        }
    }
}

/// Write a summary as NDJSON: a header record followed by one record per row.
pub fn write_summary_ndjson<W: Write>(mut writer: W, summary: &Summary, source: &str) -> Result<()> {
    let header = serde_json::json!({
        "type": "header",
        "format": SUMMARY_FORMAT,
        "version": NDJSON_VERSION,
        "source": source,
        "types": summary.len(),
        "objects": summary.total_count(),
        "size": summary.total_size()
    });
    writeln!(writer, "{}", serde_json::to_string(&header)?)?;

    for row in summary {
        let record = serde_json::json!({
            "type": "row",
            "type_name": row.type_key,
            "count": row.count,
            "total_size": row.total_size
        });
        writeln!(writer, "{}", serde_json::to_string(&record)?)?;
    }

    Ok(())
}

/// Write a diff as NDJSON: a header, one `growth` record per changed type and,
/// when given, `added`/`removed` records for individual objects.
pub fn write_diff_ndjson<W: Write>(
    mut writer: W,
    diff: &Diff,
    objects: Option<&ObjectDiff>,
    baseline: &str,
    target: &str,
) -> Result<()> {
    let header = serde_json::json!({
        "type": "header",
        "format": DIFF_FORMAT,
        "version": NDJSON_VERSION,
        "baseline": baseline,
        "target": target,
        "count_delta": diff.total_count(),
        "size_delta": diff.total_size()
    });
    writeln!(writer, "{}", serde_json::to_string(&header)?)?;

    for row in diff {
        let record = serde_json::json!({
            "type": "growth",
            "type_name": row.type_key,
            "count_delta": row.count,
            "size_delta": row.total_size
        });
        writeln!(writer, "{}", serde_json::to_string(&record)?)?;
    }

    if let Some(objects) = objects {
        for (kind, ids) in [("added", &objects.added), ("removed", &objects.removed)] {
            for id in ids {
                let record = serde_json::json!({ "type": kind, "id": id });
                writeln!(writer, "{}", serde_json::to_string(&record)?)?;
            }
        }
    }

    Ok(())
}
