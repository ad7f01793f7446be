use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::errors::AppError;
use crate::export::{export_filename, ExportFormat};
use crate::models::SettingsPatch;
use crate::service::chat_service::ChatService;

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

// ── Conversations ─────────────────────────────────────────────────────────────

/// GET `/api/conversations?q=`: most recently updated first, optionally filtered
pub async fn list_conversations_handler(
    State(svc): State<ChatService>,
    Query(query): Query<SearchQuery>,
) -> impl IntoResponse {
    Json(svc.search(&query.q).await)
}

/// POST `/api/conversations`: new empty conversation, selected
pub async fn create_conversation_handler(State(svc): State<ChatService>) -> impl IntoResponse {
    (StatusCode::CREATED, Json(svc.create_conversation().await))
}

/// GET `/api/conversations/{id}`
pub async fn get_conversation_handler(
    Path(id): Path<String>,
    State(svc): State<ChatService>,
) -> Response {
    match svc.get_conversation(&id).await {
        Ok(conversation) => Json(conversation).into_response(),
        Err(e) => error_response(&e),
    }
}

/// DELETE `/api/conversations/{id}`: also reports the new selection
pub async fn delete_conversation_handler(
    Path(id): Path<String>,
    State(svc): State<ChatService>,
) -> Response {
    match svc.delete_conversation(&id).await {
        Ok(deleted) => Json(json!({
            "deleted": deleted,
            "selected": svc.current_conversation().map(|c| c.id),
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/conversations/{id}/select`
pub async fn select_conversation_handler(
    Path(id): Path<String>,
    State(svc): State<ChatService>,
) -> Response {
    match svc.select_conversation(&id).await {
        Ok(conversation) => Json(conversation).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/conversations/{id}/export/{format}`: `markdown` or `json`, as a download
pub async fn export_conversation_handler(
    Path((id, format)): Path<(String, String)>,
    State(svc): State<ChatService>,
) -> Response {
    let format: ExportFormat = match format.parse() {
        Ok(format) => format,
        Err(message) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response(),
    };
    let conversation = match svc.get_conversation(&id).await {
        Ok(conversation) => conversation,
        Err(e) => return error_response(&e),
    };
    match format.render(&conversation) {
        Ok(body) => {
            let filename = export_filename(&conversation.title, Utc::now().date_naive(), format);
            (
                [
                    (header::CONTENT_TYPE, format.content_type().to_string()),
                    (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
                ],
                body,
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

// ── Turns ─────────────────────────────────────────────────────────────────────

/// POST `/api/chat/cancel`: stop the active turn, keeping its partial reply
pub async fn cancel_turn_handler(State(svc): State<ChatService>) -> impl IntoResponse {
    Json(json!({ "cancelled": svc.cancel_turn().await }))
}

// ── Settings & models ─────────────────────────────────────────────────────────

/// GET `/api/settings`
pub async fn get_settings_handler(State(svc): State<ChatService>) -> impl IntoResponse {
    Json(svc.settings().await)
}

/// PATCH `/api/settings`: partial update
pub async fn update_settings_handler(
    State(svc): State<ChatService>,
    Json(patch): Json<SettingsPatch>,
) -> Response {
    match svc.update_settings(patch).await {
        Ok(settings) => Json(settings).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/models`
pub async fn list_models_handler(State(svc): State<ChatService>) -> Response {
    match svc.list_models().await {
        Ok(models) => Json(models).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/health`
pub async fn health_handler(State(svc): State<ChatService>) -> impl IntoResponse {
    Json(json!({
        "connected": svc.check_connection().await,
        "phase": svc.turn_phase().await,
        "unsaved_changes": svc.has_unsaved_changes().await,
    }))
}

// ── Helper ────────────────────────────────────────────────────────────────────

pub(crate) fn error_status(err: &AppError) -> StatusCode {
    if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_conflict() {
        StatusCode::CONFLICT
    } else if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else if err.is_agent_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else if err.is_transport() {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn error_response(err: &AppError) -> Response {
    (error_status(err), Json(json!({ "error": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_error_families_to_status_codes() {
        assert_eq!(
            error_status(&AppError::ConversationNotFound { id: "x".into() }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&AppError::TurnInProgress { conversation_id: "x".into() }),
            StatusCode::CONFLICT
        );
        assert_eq!(error_status(&AppError::empty_field("message")), StatusCode::BAD_REQUEST);
        assert_eq!(
            error_status(&AppError::OllamaUnavailable { host: "h".into() }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(error_status(&AppError::inference("boom")), StatusCode::BAD_GATEWAY);
        assert_eq!(
            error_status(&AppError::Unexpected("?".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
