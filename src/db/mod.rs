pub mod conversation_repository;
pub mod kv_store;
pub mod settings_repository;
