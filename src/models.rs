use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRow {
    pub student_id: String,
    pub marks_obtained: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum GradeType {
    Exam,
    Assignment,
    Test,
}

impl GradeType {
    /// Body field that carries the import target for this grade type.
    pub fn target_field(self) -> &'static str {
        match self {
            GradeType::Exam => "examScheduleId",
            GradeType::Assignment => "assignmentId",
            GradeType::Test => "testName",
        }
    }
}

impl fmt::Display for GradeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GradeType::Exam => "exam",
            GradeType::Assignment => "assignment",
            GradeType::Test => "test",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct ImportContext {
    pub grade_type: GradeType,
    pub school_id: String,
    pub subject_id: Option<String>,
    pub section_id: Option<String>,
    pub term_id: Option<String>,
    pub academic_year_id: Option<String>,
    pub target_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportSummary {
    pub row_count: usize,
    pub null_marks: usize,
    pub rescaled: usize,
    pub mean_marks: Option<f64>,
    pub target_max: f64,
}

/// Grade record as returned by the grade list endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub student_id: String,
    #[serde(default)]
    pub student_name: Option<String>,
    #[serde(default)]
    pub marks_obtained: Option<f64>,
    #[serde(default)]
    pub comments: Option<String>,
}
