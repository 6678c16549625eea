use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::models::GradeRow;

/// Parses pasted `studentId,marks[,comments]` lines.
///
/// Malformed input never fails: blank lines and rows without a student id are
/// dropped, unreadable marks become `None`.
pub fn parse_pasted(text: &str) -> Vec<GradeRow> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ',');
            let student_id = parts.next().unwrap_or_default();
            let marks = parts.next();
            let comments = parts.next();
            normalize_row(student_id, marks, comments)
        })
        .collect()
}

/// Coerces raw mark text, returning `None` for blanks, `null` and anything non-numeric.
pub fn parse_marks(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
        return None;
    }

    trimmed.parse::<f64>().ok().filter(|value| value.is_finite())
}

fn normalize_row(student_id: &str, marks: Option<&str>, comments: Option<&str>) -> Option<GradeRow> {
    let student_id = student_id.trim();
    if student_id.is_empty() {
        return None;
    }

    let comments = comments
        .map(str::trim)
        .filter(|comment| !comment.is_empty())
        .map(str::to_string);

    Some(GradeRow {
        student_id: student_id.to_string(),
        marks_obtained: marks.and_then(parse_marks),
        comments,
    })
}

pub fn read_csv(csv_path: &Path) -> anyhow::Result<Vec<GradeRow>> {
    #[derive(Deserialize)]
    struct CsvRow {
        #[serde(alias = "studentId")]
        student_id: Option<String>,
        #[serde(default, alias = "marksObtained")]
        marks: Option<String>,
        #[serde(default)]
        comments: Option<String>,
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .flexible(true)
        .from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut rows = Vec::new();

    for result in reader.deserialize::<CsvRow>() {
        let row = result.with_context(|| format!("failed to read {}", csv_path.display()))?;
        let student_id = row.student_id.unwrap_or_default();
        if let Some(grade) =
            normalize_row(&student_id, row.marks.as_deref(), row.comments.as_deref())
        {
            rows.push(grade);
        }
    }

    Ok(rows)
}

pub fn write_csv(rows: &[GradeRow], out: &Path) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(out)
        .with_context(|| format!("failed to create {}", out.display()))?;
    writer.write_record(["student_id", "marks", "comments"])?;

    for row in rows {
        let marks = row
            .marks_obtained
            .map(|value| value.to_string())
            .unwrap_or_default();
        writer.write_record([
            row.student_id.as_str(),
            marks.as_str(),
            row.comments.as_deref().unwrap_or(""),
        ])?;
    }

    writer.flush()?;
    Ok(())
}
