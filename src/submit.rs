use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::models::{GradeRecord, GradeRow, GradeType, ImportContext};

const USER_AGENT: &str = concat!("grade-import/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("no valid grade rows to submit")]
    NoRows,

    #[error("missing required field: {0}")]
    MissingContext(&'static str),

    /// Server-provided message, shown as-is.
    #[error("{message}")]
    Server { status: u16, message: String },

    #[error("network error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitState {
    Idle,
    Validating,
    Submitting,
    Success,
    Error,
}

/// Batch request body shared by the three grade endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBatch<'a> {
    pub grades: &'a [GradeRow],
    pub subject_id: &'a str,
    pub section_id: Option<&'a str>,
    pub term_id: &'a str,
    pub academic_year_id: &'a str,
    #[serde(skip)]
    pub target_field: &'static str,
    #[serde(skip)]
    pub target_id: &'a str,
}

impl GradeBatch<'_> {
    pub fn to_json(&self) -> Value {
        let mut body = json!(self);
        if let Value::Object(map) = &mut body {
            map.insert(self.target_field.to_string(), json!(self.target_id));
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GradeList {
    Wrapped { grades: Vec<GradeRecord> },
    Bare(Vec<GradeRecord>),
}

#[derive(Debug)]
pub struct SubmitOutcome {
    pub import_id: Uuid,
    pub message: String,
    pub submitted: usize,
    /// `None` when the refresh request failed.
    pub refreshed: Option<Vec<GradeRecord>>,
}

/// Checks the context and rows and builds the request body without touching the network.
pub fn build_batch<'a>(
    context: &'a ImportContext,
    rows: &'a [GradeRow],
) -> Result<GradeBatch<'a>, SubmitError> {
    if rows.is_empty() {
        return Err(SubmitError::NoRows);
    }

    let subject_id = required(&context.subject_id, "subjectId")?;
    let term_id = required(&context.term_id, "termId")?;
    let academic_year_id = required(&context.academic_year_id, "academicYearId")?;
    let target_field = context.grade_type.target_field();
    let target_id = required(&context.target_id, target_field)?;

    Ok(GradeBatch {
        grades: rows,
        subject_id,
        section_id: optional(&context.section_id),
        term_id,
        academic_year_id,
        target_field,
        target_id,
    })
}

fn optional(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, SubmitError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(SubmitError::MissingContext(field))
}

pub fn grades_path(school_id: &str, grade_type: GradeType, target_id: &str) -> String {
    match grade_type {
        GradeType::Exam => format!("/api/schools/{school_id}/exam-schedules/{target_id}/grades"),
        GradeType::Assignment => {
            format!("/api/schools/{school_id}/assignments/{target_id}/grades")
        }
        GradeType::Test => format!("/api/schools/{school_id}/grades/tests"),
    }
}

pub struct Dispatcher {
    http_client: reqwest::Client,
    base_url: String,
    state: SubmitState,
}

impl Dispatcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SubmitError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| SubmitError::Transport(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            state: SubmitState::Idle,
        })
    }

    pub fn state(&self) -> SubmitState {
        self.state
    }

    fn transition(&mut self, next: SubmitState) {
        debug!(from = ?self.state, to = ?next, "submission state");
        self.state = next;
    }

    /// Validates, posts the batch and refreshes the grade list.
    ///
    /// Always returns with the dispatcher back in [`SubmitState::Idle`].
    pub async fn submit(
        &mut self,
        context: &ImportContext,
        rows: &[GradeRow],
    ) -> Result<SubmitOutcome, SubmitError> {
        let import_id = Uuid::new_v4();
        let span = tracing::info_span!("submit", %import_id, grade_type = %context.grade_type);

        let result = self
            .run(context, rows, import_id)
            .instrument(span.clone())
            .await;
        let _guard = span.enter();
        match &result {
            Ok(outcome) => {
                self.transition(SubmitState::Success);
                info!(rows = outcome.submitted, "{}", outcome.message);
            }
            Err(SubmitError::Server { status, message }) => {
                self.transition(SubmitState::Error);
                warn!(status, "server rejected submission: {message}");
            }
            Err(e) => {
                self.transition(SubmitState::Error);
                warn!("submission failed: {e}");
            }
        }
        self.transition(SubmitState::Idle);
        result
    }

    async fn run(
        &mut self,
        context: &ImportContext,
        rows: &[GradeRow],
        import_id: Uuid,
    ) -> Result<SubmitOutcome, SubmitError> {
        self.transition(SubmitState::Validating);
        let batch = build_batch(context, rows)?;
        let path = grades_path(&context.school_id, context.grade_type, batch.target_id);

        self.transition(SubmitState::Submitting);
        let response = self
            .http_client
            .post(format!("{}{}", self.base_url, path))
            .json(&batch.to_json())
            .send()
            .await
            .map_err(|e| SubmitError::Transport(e.to_string()))?;

        let message = read_message(response).await?;

        let refreshed = match self.fetch_grades(&path, context.grade_type, &batch).await {
            Ok(grades) => Some(grades),
            Err(e) => {
                warn!("grade list refresh failed: {e}");
                None
            }
        };

        Ok(SubmitOutcome {
            import_id,
            message,
            submitted: rows.len(),
            refreshed,
        })
    }

    async fn fetch_grades(
        &self,
        path: &str,
        grade_type: GradeType,
        batch: &GradeBatch<'_>,
    ) -> Result<Vec<GradeRecord>, SubmitError> {
        let mut query = vec![
            ("subjectId", batch.subject_id),
            ("termId", batch.term_id),
            ("academicYearId", batch.academic_year_id),
        ];
        if let Some(section_id) = batch.section_id {
            query.push(("sectionId", section_id));
        }
        if grade_type == GradeType::Test {
            query.push(("testName", batch.target_id));
        }

        let response = self
            .http_client
            .get(format!("{}{}", self.base_url, path))
            .query(&query)
            .send()
            .await
            .map_err(|e| SubmitError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SubmitError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(server_error(status, &body));
        }

        let list: GradeList =
            serde_json::from_str(&body).map_err(|e| SubmitError::Decode(e.to_string()))?;
        Ok(match list {
            GradeList::Wrapped { grades } => grades,
            GradeList::Bare(grades) => grades,
        })
    }

    /// Asks the backend to rebuild class rankings for the section and term.
    pub async fn recompute_rankings(&self, context: &ImportContext) -> Result<String, SubmitError> {
        let term_id = required(&context.term_id, "termId")?;
        let academic_year_id = required(&context.academic_year_id, "academicYearId")?;
        let url = format!(
            "{}/api/schools/{}/rankings/recompute",
            self.base_url, context.school_id
        );

        let response = self
            .http_client
            .post(url)
            .json(&json!({
                "sectionId": optional(&context.section_id),
                "termId": term_id,
                "academicYearId": academic_year_id,
            }))
            .send()
            .await
            .map_err(|e| SubmitError::Transport(e.to_string()))?;

        read_message(response).await
    }
}

async fn read_message(response: reqwest::Response) -> Result<String, SubmitError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| SubmitError::Transport(e.to_string()))?;

    if !status.is_success() {
        return Err(server_error(status, &body));
    }

    let message = serde_json::from_str::<ApiMessage>(&body)
        .ok()
        .and_then(|parsed| parsed.message)
        .unwrap_or_else(|| "Grades saved".to_string());
    Ok(message)
}

fn server_error(status: reqwest::StatusCode, body: &str) -> SubmitError {
    let parsed = serde_json::from_str::<ApiMessage>(body).ok();
    let message = parsed
        .and_then(|api| api.error.or(api.message))
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });

    SubmitError::Server {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode;
    use axum::routing::{post, MethodRouter};
    use axum::{Json, Router};

    use super::*;
    use crate::parse::parse_pasted;

    #[derive(Clone, Default)]
    struct Recorded {
        posts: Arc<Mutex<Vec<(String, Value)>>>,
        gets: Arc<Mutex<Vec<std::collections::HashMap<String, String>>>>,
    }

    fn context(grade_type: GradeType) -> ImportContext {
        ImportContext {
            grade_type,
            school_id: "north".to_string(),
            subject_id: Some("math".to_string()),
            section_id: Some("7a".to_string()),
            term_id: Some("t1".to_string()),
            academic_year_id: Some("2026".to_string()),
            target_id: Some("es-1".to_string()),
        }
    }

    fn grades_route(reject: bool) -> MethodRouter<Recorded> {
        post(
            move |State(recorded): State<Recorded>,
                  Path(target): Path<String>,
                  Json(body): Json<Value>| async move {
                recorded.posts.lock().unwrap().push((target, body));
                if reject {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({ "error": "Student s9 is not enrolled in this section" })),
                    )
                } else {
                    (StatusCode::OK, Json(json!({ "message": "Saved 2 grades" })))
                }
            },
        )
        .get(
            |State(recorded): State<Recorded>,
             Query(query): Query<std::collections::HashMap<String, String>>| async move {
                recorded.gets.lock().unwrap().push(query);
                Json(json!({
                    "grades": [
                        { "studentId": "s1", "studentName": "Avery Lee", "marksObtained": 50.0 },
                        { "studentId": "s2", "marksObtained": null, "comments": "note" }
                    ]
                }))
            },
        )
    }

    fn test_grades_route(reject: bool) -> MethodRouter<Recorded> {
        post(
            move |State(recorded): State<Recorded>, Json(body): Json<Value>| async move {
                recorded
                    .posts
                    .lock()
                    .unwrap()
                    .push(("tests".to_string(), body));
                if reject {
                    (StatusCode::BAD_REQUEST, Json(json!({ "error": "Test is closed" })))
                } else {
                    (StatusCode::OK, Json(json!({ "message": "Saved 1 grade" })))
                }
            },
        )
        .get(
            |State(recorded): State<Recorded>,
             Query(query): Query<std::collections::HashMap<String, String>>| async move {
                recorded.gets.lock().unwrap().push(query);
                Json(json!([{ "studentId": "s1", "marksObtained": 8.5 }]))
            },
        )
    }

    async fn spawn_server(reject: bool) -> (String, Recorded) {
        let recorded = Recorded::default();
        let app = Router::new()
            .route(
                "/api/schools/north/exam-schedules/{target}/grades",
                grades_route(reject),
            )
            .route(
                "/api/schools/north/assignments/{target}/grades",
                grades_route(reject),
            )
            .route("/api/schools/north/grades/tests", test_grades_route(reject))
            .route(
                "/api/schools/north/rankings/recompute",
                post(
                    |State(recorded): State<Recorded>, Json(body): Json<Value>| async move {
                        recorded
                            .posts
                            .lock()
                            .unwrap()
                            .push(("rankings".to_string(), body));
                        Json(json!({ "message": "Rankings recomputed" }))
                    },
                ),
            )
            .with_state(recorded.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}"), recorded)
    }

    #[test]
    fn empty_rows_are_rejected_before_any_request() {
        let ctx = context(GradeType::Exam);
        assert!(matches!(build_batch(&ctx, &[]), Err(SubmitError::NoRows)));
    }

    #[test]
    fn missing_context_names_the_field() {
        let rows = parse_pasted("s1,50");
        let mut ctx = context(GradeType::Assignment);
        ctx.target_id = None;
        assert!(matches!(
            build_batch(&ctx, &rows),
            Err(SubmitError::MissingContext("assignmentId"))
        ));

        let mut ctx = context(GradeType::Exam);
        ctx.term_id = Some("  ".to_string());
        assert!(matches!(
            build_batch(&ctx, &rows),
            Err(SubmitError::MissingContext("termId"))
        ));
    }

    #[test]
    fn body_carries_target_field_per_grade_type() {
        let rows = parse_pasted("s1,50\ns2,,note");
        let mut ctx = context(GradeType::Test);
        ctx.target_id = Some("Unit quiz".to_string());
        ctx.section_id = None;

        let body = build_batch(&ctx, &rows).unwrap().to_json();
        assert_eq!(body["testName"], "Unit quiz");
        assert_eq!(body["sectionId"], Value::Null);
        assert_eq!(body["grades"][0], json!({ "studentId": "s1", "marksObtained": 50.0 }));
        assert_eq!(
            body["grades"][1],
            json!({ "studentId": "s2", "marksObtained": null, "comments": "note" })
        );
        assert!(body.get("examScheduleId").is_none());
    }

    #[test]
    fn paths_follow_grade_type() {
        assert_eq!(
            grades_path("north", GradeType::Exam, "es-1"),
            "/api/schools/north/exam-schedules/es-1/grades"
        );
        assert_eq!(
            grades_path("north", GradeType::Assignment, "as-3"),
            "/api/schools/north/assignments/as-3/grades"
        );
        assert_eq!(
            grades_path("north", GradeType::Test, "Quiz 1"),
            "/api/schools/north/grades/tests"
        );
    }

    #[test]
    fn server_error_prefers_error_field_then_body() {
        let err = server_error(reqwest::StatusCode::CONFLICT, r#"{"error":"Term is locked"}"#);
        assert_eq!(err.to_string(), "Term is locked");

        let err = server_error(reqwest::StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(err.to_string(), "upstream down");

        let err = server_error(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "");
        assert_eq!(err.to_string(), "Internal Server Error");
    }

    #[tokio::test]
    async fn submits_exam_batch_and_refreshes() {
        let (base_url, recorded) = spawn_server(false).await;
        let mut dispatcher = Dispatcher::new(&base_url, Duration::from_secs(5)).unwrap();
        let rows = parse_pasted("s1,50\ns2,,note");

        let outcome = dispatcher
            .submit(&context(GradeType::Exam), &rows)
            .await
            .unwrap();

        assert_eq!(outcome.message, "Saved 2 grades");
        assert_eq!(outcome.submitted, 2);
        assert_eq!(outcome.refreshed.as_ref().map(Vec::len), Some(2));
        assert_eq!(dispatcher.state(), SubmitState::Idle);

        let posts = recorded.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        let (target, body) = &posts[0];
        assert_eq!(target, "es-1");
        assert_eq!(body["examScheduleId"], "es-1");
        assert_eq!(body["subjectId"], "math");
        assert_eq!(body["grades"].as_array().map(Vec::len), Some(2));

        let gets = recorded.gets.lock().unwrap();
        assert_eq!(gets[0].get("sectionId").map(String::as_str), Some("7a"));
    }

    #[tokio::test]
    async fn server_error_is_surfaced_verbatim() {
        let (base_url, recorded) = spawn_server(true).await;
        let mut dispatcher = Dispatcher::new(&base_url, Duration::from_secs(5)).unwrap();
        let mut ctx = context(GradeType::Assignment);
        ctx.target_id = Some("as-3".to_string());

        let err = dispatcher
            .submit(&ctx, &parse_pasted("s9,12"))
            .await
            .unwrap_err();

        match err {
            SubmitError::Server { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Student s9 is not enrolled in this section");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(dispatcher.state(), SubmitState::Idle);
        assert!(recorded.gets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_submission_makes_no_request() {
        let (base_url, recorded) = spawn_server(false).await;
        let mut dispatcher = Dispatcher::new(&base_url, Duration::from_secs(5)).unwrap();

        let err = dispatcher
            .submit(&context(GradeType::Exam), &parse_pasted("\n,50\n"))
            .await
            .unwrap_err();

        assert!(matches!(err, SubmitError::NoRows));
        assert!(recorded.posts.lock().unwrap().is_empty());
        assert_eq!(dispatcher.state(), SubmitState::Idle);
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut dispatcher =
            Dispatcher::new(&format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        let err = dispatcher
            .submit(&context(GradeType::Exam), &parse_pasted("s1,50"))
            .await
            .unwrap_err();

        assert!(matches!(err, SubmitError::Transport(_)));
        assert_eq!(dispatcher.state(), SubmitState::Idle);
    }

    #[tokio::test]
    async fn recompute_rankings_posts_section_and_term() {
        let (base_url, recorded) = spawn_server(false).await;
        let dispatcher = Dispatcher::new(&base_url, Duration::from_secs(5)).unwrap();

        let message = dispatcher
            .recompute_rankings(&context(GradeType::Exam))
            .await
            .unwrap();

        assert_eq!(message, "Rankings recomputed");
        let posts = recorded.posts.lock().unwrap();
        let (label, body) = &posts[0];
        assert_eq!(label, "rankings");
        assert_eq!(
            body,
            &json!({ "sectionId": "7a", "termId": "t1", "academicYearId": "2026" })
        );
    }

    #[tokio::test]
    async fn test_batch_carries_label_in_body_and_refresh_query() {
        let (base_url, recorded) = spawn_server(false).await;
        let mut dispatcher = Dispatcher::new(&base_url, Duration::from_secs(5)).unwrap();
        let mut ctx = context(GradeType::Test);
        ctx.target_id = Some("Unit quiz".to_string());

        let outcome = dispatcher
            .submit(&ctx, &parse_pasted("s1,8.5"))
            .await
            .unwrap();

        assert_eq!(outcome.message, "Saved 1 grade");
        assert_eq!(outcome.refreshed.as_ref().map(Vec::len), Some(1));

        let posts = recorded.posts.lock().unwrap();
        let (label, body) = &posts[0];
        assert_eq!(label, "tests");
        assert_eq!(body["testName"], "Unit quiz");
        assert!(body.get("examScheduleId").is_none());

        let gets = recorded.gets.lock().unwrap();
        assert_eq!(gets[0].get("testName").map(String::as_str), Some("Unit quiz"));
        assert_eq!(gets[0].get("subjectId").map(String::as_str), Some("math"));
    }

    #[tokio::test]
    async fn blank_section_is_sent_as_null_everywhere() {
        let (base_url, recorded) = spawn_server(false).await;
        let mut dispatcher = Dispatcher::new(&base_url, Duration::from_secs(5)).unwrap();
        let mut ctx = context(GradeType::Exam);
        ctx.section_id = Some("   ".to_string());

        dispatcher.submit(&ctx, &parse_pasted("s1,50")).await.unwrap();
        dispatcher.recompute_rankings(&ctx).await.unwrap();

        let posts = recorded.posts.lock().unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].1["sectionId"], Value::Null);
        assert_eq!(posts[1].0, "rankings");
        assert_eq!(posts[1].1["sectionId"], Value::Null);

        let gets = recorded.gets.lock().unwrap();
        assert!(gets[0].get("sectionId").is_none());
    }
}
