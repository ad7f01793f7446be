pub mod api_routes;
pub mod ws_routes;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::service::chat_service::ChatService;
use api_routes::{
    cancel_turn_handler, create_conversation_handler, delete_conversation_handler,
    export_conversation_handler, get_conversation_handler, get_settings_handler, health_handler,
    list_conversations_handler, list_models_handler, select_conversation_handler,
    update_settings_handler,
};
use ws_routes::ws_chat_handler;

/// All HTTP and WebSocket routes, sharing one `ChatService`.
pub fn router(service: ChatService) -> Router {
    Router::new()
        .route(
            "/api/conversations",
            get(list_conversations_handler).post(create_conversation_handler),
        )
        .route(
            "/api/conversations/{id}",
            get(get_conversation_handler).delete(delete_conversation_handler),
        )
        .route("/api/conversations/{id}/select", post(select_conversation_handler))
        .route("/api/conversations/{id}/export/{format}", get(export_conversation_handler))
        .route("/api/chat/cancel", post(cancel_turn_handler))
        .route("/api/settings", get(get_settings_handler).patch(update_settings_handler))
        .route("/api/models", get(list_models_handler))
        .route("/api/health", get(health_handler))
        .route("/ws/chat", get(ws_chat_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}
