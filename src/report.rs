use std::fmt::Write;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{GradeRow, ImportContext, ImportSummary};

const PREVIEW_ROWS: usize = 10;

pub fn build_report(
    context: &ImportContext,
    summary: &ImportSummary,
    rows: &[GradeRow],
    import_id: Option<Uuid>,
    generated_at: DateTime<Utc>,
) -> String {
    let mut output = String::new();
    let target = context.target_id.as_deref().unwrap_or("unassigned");

    let _ = writeln!(output, "# Grade Import Report");
    let _ = writeln!(
        output,
        "Generated for {} `{}` at {}",
        context.grade_type,
        target,
        generated_at.format("%Y-%m-%d %H:%M UTC")
    );
    if let Some(import_id) = import_id {
        let _ = writeln!(output, "Import id: {import_id}");
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Summary");
    let _ = writeln!(output, "- Rows: {}", summary.row_count);
    let _ = writeln!(output, "- Missing marks: {}", summary.null_marks);
    let _ = writeln!(
        output,
        "- Rescaled marks: {} (target max {})",
        summary.rescaled, summary.target_max
    );
    match summary.mean_marks {
        Some(mean) => {
            let _ = writeln!(output, "- Mean mark: {mean:.2}");
        }
        None => {
            let _ = writeln!(output, "- Mean mark: n/a");
        }
    }

    let missing: Vec<&GradeRow> = rows
        .iter()
        .filter(|row| row.marks_obtained.is_none())
        .collect();
    let _ = writeln!(output);
    let _ = writeln!(output, "## Students Without Marks");

    if missing.is_empty() {
        let _ = writeln!(output, "Every student has a mark.");
    } else {
        for row in missing {
            let _ = writeln!(
                output,
                "- {}{}",
                row.student_id,
                row.comments
                    .as_deref()
                    .map(|note| format!(": {note}"))
                    .unwrap_or_default()
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## First Rows");

    if rows.is_empty() {
        let _ = writeln!(output, "No grade rows parsed.");
    } else {
        for row in rows.iter().take(PREVIEW_ROWS) {
            let _ = writeln!(output, "- {}", format_row(row));
        }
    }

    output
}

pub fn format_row(row: &GradeRow) -> String {
    let marks = row
        .marks_obtained
        .map(|value| format!("{value}"))
        .unwrap_or_else(|| "-".to_string());

    match row.comments.as_deref() {
        Some(comment) => format!("{} {} ({})", row.student_id, marks, comment),
        None => format!("{} {}", row.student_id, marks),
    }
}
