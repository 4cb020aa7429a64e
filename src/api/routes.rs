//! REST endpoints for chat, scheduling, feedback and status.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::error;

use crate::error::{Error, SchedulerError};
use crate::workflow::CoachEngine;

/// Shared state for coach routes.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<CoachEngine>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    #[serde(default)]
    pub coach_id: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct RunNowRequest {
    pub user_id: String,
    #[serde(default)]
    pub coach_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub user_id: String,
    #[serde(default)]
    pub coach_id: String,
    /// `HH:MM`, 24-hour.
    pub time: String,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub user_id: String,
    #[serde(default)]
    pub coach_id: String,
    pub feedback: String,
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct GoalsRequest {
    pub user_id: String,
    pub goals: String,
}

#[derive(Debug, Deserialize)]
pub struct InstructionRequest {
    pub user_id: String,
    #[serde(default)]
    pub coach_id: String,
    pub prompt: String,
}

fn message(text: impl Into<String>) -> Response {
    Json(serde_json::json!({ "message": text.into() })).into_response()
}

fn bad_request(text: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": text.into() })),
    )
        .into_response()
}

/// Map an engine error to a response. Rejected requests are 400s.
fn error_response(e: Error) -> Response {
    match e {
        Error::Workflow(e) => bad_request(e.to_string()),
        Error::Scheduler(e @ SchedulerError::InvalidTime { .. }) => bad_request(e.to_string()),
        other => {
            error!(error = %other, "Request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

/// Strict `HH:MM` parse for the schedule endpoint.
fn parse_hh_mm(time: &str) -> Option<(u32, u32)> {
    let (hour, minute) = time.trim().split_once(':')?;
    if minute.len() != 2 {
        return None;
    }
    Some((hour.parse().ok()?, minute.parse().ok()?))
}

async fn root() -> impl IntoResponse {
    message("Habit coach is running. POST /chat to talk to your coach.")
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "habit-coach"
    }))
}

/// POST /chat
async fn chat(State(state): State<ApiState>, Json(req): Json<ChatRequest>) -> Response {
    let reply = state
        .engine
        .handle_event(&req.user_id, &req.coach_id, &req.message)
        .await;
    message(reply)
}

/// POST /run-now
///
/// Runs the workflow as if a timer fired.
async fn run_now(State(state): State<ApiState>, Json(req): Json<RunNowRequest>) -> Response {
    let reply = state.engine.handle_event(&req.user_id, &req.coach_id, "").await;
    message(reply)
}

/// POST /schedule
async fn schedule(State(state): State<ApiState>, Json(req): Json<ScheduleRequest>) -> Response {
    let Some((hour, minute)) = parse_hh_mm(&req.time) else {
        return bad_request(format!("time must be HH:MM, got '{}'", req.time));
    };
    match state
        .engine
        .schedule(&req.user_id, &req.coach_id, hour, minute)
        .await
    {
        Ok(reply) => message(reply),
        Err(e) => error_response(e),
    }
}

/// DELETE /schedule?user_id=...
async fn cancel_schedule(State(state): State<ApiState>, Query(q): Query<UserQuery>) -> Response {
    match state.engine.cancel_schedule(&q.user_id).await {
        Ok(true) => message(format!("Schedule cancelled for user {}.", q.user_id)),
        Ok(false) => message(format!("No schedule was set for user {}.", q.user_id)),
        Err(e) => error_response(e),
    }
}

/// POST /feedback
///
/// 400 when no exercise has been sent yet.
async fn feedback(State(state): State<ApiState>, Json(req): Json<FeedbackRequest>) -> Response {
    match state
        .engine
        .record_feedback(&req.user_id, &req.coach_id, &req.feedback)
        .await
    {
        Ok(reply) => message(reply),
        Err(e) => error_response(e),
    }
}

/// GET /status?user_id=...
async fn status(State(state): State<ApiState>, Query(q): Query<UserQuery>) -> Response {
    match state.engine.status(&q.user_id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /reset
async fn reset(State(state): State<ApiState>, Json(req): Json<RunNowRequest>) -> Response {
    match state.engine.reset(&req.user_id).await {
        Ok(()) => message("Session reset"),
        Err(e) => error_response(e),
    }
}

/// POST /goals
async fn goals(State(state): State<ApiState>, Json(req): Json<GoalsRequest>) -> Response {
    match state.engine.set_goals(&req.user_id, &req.goals).await {
        Ok(()) => message("Goals updated"),
        Err(e) => error_response(e),
    }
}

/// PUT /instruction
async fn instruction(
    State(state): State<ApiState>,
    Json(req): Json<InstructionRequest>,
) -> Response {
    match state
        .engine
        .set_instruction(&req.user_id, &req.coach_id, &req.prompt)
        .await
    {
        Ok(flags) => Json(serde_json::json!({ "flags": flags })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Build the coach REST routes.
pub fn coach_routes(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/run-now", post(run_now))
        .route("/schedule", post(schedule).delete(cancel_schedule))
        .route("/feedback", post(feedback))
        .route("/status", get(status))
        .route("/reset", post(reset))
        .route("/goals", post(goals))
        .route("/instruction", put(instruction))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoachConfig;
    use crate::llm::UnconfiguredGenerator;
    use crate::personalization::UnavailableSource;
    use crate::session::InMemorySessionStore;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    fn app() -> Router {
        let (engine, ticks) = CoachEngine::new(
            CoachConfig::default(),
            InMemorySessionStore::new(),
            Arc::new(UnavailableSource),
            Arc::new(UnconfiguredGenerator),
        );
        coach_routes(ApiState {
            engine: engine.start(ticks),
        })
    }

    async fn call(app: &Router, method: Method, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[test]
    fn hh_mm_parsing() {
        assert_eq!(parse_hh_mm("14:00"), Some((14, 0)));
        assert_eq!(parse_hh_mm(" 7:05 "), Some((7, 5)));
        assert_eq!(parse_hh_mm("7pm"), None);
        assert_eq!(parse_hh_mm("14:5"), None);
    }

    #[tokio::test]
    async fn feedback_before_dispatch_is_400() {
        let app = app();
        let (status, body) = call(
            &app,
            Method::POST,
            "/feedback",
            serde_json::json!({"user_id": "u1", "feedback": "done"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("u1"));
    }

    #[tokio::test]
    async fn schedule_rejects_bad_time() {
        let app = app();
        let (status, _) = call(
            &app,
            Method::POST,
            "/schedule",
            serde_json::json!({"user_id": "u1", "time": "noon"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            Method::POST,
            "/schedule",
            serde_json::json!({"user_id": "u1", "time": "25:00"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn run_now_then_status() {
        let app = app();
        let (status, body) = call(
            &app,
            Method::POST,
            "/run-now",
            serde_json::json!({"user_id": "u1"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].as_str().unwrap().contains("Do 10 push-ups"));

        let (status, body) = call(&app, Method::GET, "/status?user_id=u1", serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "awaiting_feedback");
        assert_eq!(body["pending_reminders"].as_array().unwrap().len(), 3);
    }
}
