use std::str::FromStr;

use crate::errors::AppError;

const DEFAULT_DATABASE_URL: &str = "sqlite://ollama-chat.db?mode=rwc";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSourceKind {
    Ollama,
    Mock,
}

impl FromStr for TokenSourceKind {
    type Err = AppError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(TokenSourceKind::Ollama),
            "mock" => Ok(TokenSourceKind::Mock),
            other => Err(AppError::InvalidConfig {
                key: "TOKEN_SOURCE".to_string(),
                message: format!("expected 'ollama' or 'mock', got '{other}'"),
            }),
        }
    }
}

/// Process configuration, read from the environment (and `.env`, if loaded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database_url: String,
    pub ollama_base_url: String,
    pub token_source: TokenSourceKind,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let token_source = match lookup("TOKEN_SOURCE") {
            Some(value) => value.parse::<TokenSourceKind>()?,
            None => TokenSourceKind::Mock,
        };
        let port = match lookup("PORT") {
            Some(value) => value.parse::<u16>().map_err(|e| AppError::InvalidConfig {
                key: "PORT".to_string(),
                message: format!("'{value}' is not a port number: {e}"),
            })?,
            None => DEFAULT_PORT,
        };
        Ok(Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            ollama_base_url: lookup("OLLAMA_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            token_source,
            port,
        })
    }
}
