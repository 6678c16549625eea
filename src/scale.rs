use crate::models::{GradeRow, ImportSummary};

pub const DEFAULT_TARGET_MAX: f64 = 100.0;

/// Explicit assessment maximum wins over the configured default.
pub fn resolve_target_max(explicit: Option<f64>, default_max: f64) -> f64 {
    explicit
        .filter(|value| value.is_finite() && *value > 0.0)
        .unwrap_or(default_max)
}

/// Reads a mark as a fraction (<= 1), a percentage (<= 100 when the target
/// is not 100) or a literal score, in that order.
pub fn rescale_mark(mark: f64, target_max: f64) -> f64 {
    round2(scale_rule(mark, target_max).unwrap_or(mark))
}

/// Unrounded result of the fraction or percentage rule, `None` for literal scores.
fn scale_rule(mark: f64, target_max: f64) -> Option<f64> {
    if mark <= 1.0 {
        Some(mark * target_max)
    } else if target_max != 100.0 && mark <= 100.0 {
        Some(mark / 100.0 * target_max)
    } else {
        None
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Applies [`rescale_mark`] to every non-null mark when `scale_to_max` is set.
/// Returns how many marks were read as a fraction or percentage.
pub fn rescale_rows(rows: &mut [GradeRow], target_max: f64, scale_to_max: bool) -> usize {
    if !scale_to_max {
        return 0;
    }

    let mut rescaled = 0usize;
    for row in rows.iter_mut() {
        if let Some(mark) = row.marks_obtained {
            if scale_rule(mark, target_max).is_some() {
                rescaled += 1;
            }
            row.marks_obtained = Some(rescale_mark(mark, target_max));
        }
    }

    rescaled
}

pub fn summarize(rows: &[GradeRow], target_max: f64, rescaled: usize) -> ImportSummary {
    let marks: Vec<f64> = rows.iter().filter_map(|row| row.marks_obtained).collect();
    let mean_marks = if marks.is_empty() {
        None
    } else {
        Some(marks.iter().sum::<f64>() / marks.len() as f64)
    };

    ImportSummary {
        row_count: rows.len(),
        null_marks: rows.len() - marks.len(),
        rescaled,
        mean_marks,
        target_max,
    }
}
