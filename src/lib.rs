//! Library crate for undercover-back, exposing modules for the binary and integration tests.

/// Runtime configuration.
pub mod config;
/// Storage layer.
pub mod dao;
/// Wire payloads.
pub mod dto;
/// Service and HTTP errors.
pub mod error;
/// HTTP and WebSocket routes.
pub mod routes;
/// Room logic and background flows.
pub mod services;
/// Shared state and domain rules.
pub mod state;
