use thiserror::Error;

/// Top-level application error.
///
/// Variants fall into three families: validation (rejected synchronously, no
/// state change), transport (the token source failed) and persistence (a store
/// write or read failed). All variants carry a human-readable message.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Validation errors ────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("Setting '{field_name}' must be between {min} and {max} (actual: {actual})")]
    OutOfRange { field_name: String, min: f64, max: f64, actual: f64 },

    #[error("A turn is already active for conversation '{conversation_id}'")]
    TurnInProgress { conversation_id: String },

    #[error("Cannot {operation} conversation '{conversation_id}' while the turn is {phase}")]
    InvalidTransition {
        operation: &'static str,
        conversation_id: String,
        phase: &'static str,
    },

    #[error("Conversation '{id}' not found")]
    ConversationNotFound { id: String },

    // ── Token source errors ──────────────────────────────────────────────────
    #[error("Ollama service unavailable at {host}")]
    OllamaUnavailable { host: String },

    #[error("Model '{model_name}' not found in Ollama")]
    ModelNotFound { model_name: String },

    #[error("Inference error: {message}")]
    InferenceError { message: String },

    // ── Persistence errors ───────────────────────────────────────────────────
    #[error("Database connection failed: {0}")]
    DatabaseConnectionFailed(#[source] sqlx::Error),

    #[error("Database migration failed: {0}")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),

    #[error("Database query failed: {message}")]
    DatabaseQueryFailed {
        message: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to persist '{key}': {message}")]
    PersistenceFailed { key: String, message: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Invalid configuration for {key}: {message}")]
    InvalidConfig { key: String, message: String },

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn db_query(message: impl Into<String>, source: sqlx::Error) -> Self {
        AppError::DatabaseQueryFailed { message: message.into(), source }
    }

    pub fn empty_field(field_name: impl Into<String>) -> Self {
        AppError::EmptyField { field_name: field_name.into() }
    }

    pub fn inference(message: impl Into<String>) -> Self {
        AppError::InferenceError { message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::ConversationNotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AppError::EmptyField { .. }
                | AppError::OutOfRange { .. }
                | AppError::TurnInProgress { .. }
                | AppError::InvalidTransition { .. }
                | AppError::ConversationNotFound { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            AppError::TurnInProgress { .. } | AppError::InvalidTransition { .. }
        )
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AppError::OllamaUnavailable { .. }
                | AppError::ModelNotFound { .. }
                | AppError::InferenceError { .. }
        )
    }

    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            AppError::DatabaseConnectionFailed(_)
                | AppError::MigrationFailed(_)
                | AppError::DatabaseQueryFailed { .. }
                | AppError::PersistenceFailed { .. }
                | AppError::Serialization(_)
        )
    }

    pub fn is_agent_unavailable(&self) -> bool {
        matches!(self, AppError::OllamaUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_error_families() {
        let busy = AppError::TurnInProgress { conversation_id: "c1".into() };
        assert!(busy.is_validation());
        assert!(busy.is_conflict());
        assert!(!busy.is_transport());

        let down = AppError::OllamaUnavailable { host: "http://localhost:11434".into() };
        assert!(down.is_transport());
        assert!(down.is_agent_unavailable());
        assert!(!down.is_persistence());

        let quota = AppError::PersistenceFailed {
            key: "ollama-conversations".into(),
            message: "quota exceeded".into(),
        };
        assert!(quota.is_persistence());
        assert!(!quota.is_validation());
    }

    #[test]
    fn messages_name_the_offending_field() {
        let err = AppError::OutOfRange {
            field_name: "temperature".into(),
            min: 0.0,
            max: 2.0,
            actual: 3.5,
        };
        assert_eq!(
            err.to_string(),
            "Setting 'temperature' must be between 0 and 2 (actual: 3.5)"
        );
        assert_eq!(
            AppError::empty_field("message").to_string(),
            "Field 'message' cannot be empty"
        );
    }
}
