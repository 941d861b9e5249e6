/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Fan-out of outbound messages to live channels.
pub mod notifier;
/// Timed speaking and voting phases of a playing room.
pub mod phase_orchestrator;
/// Broadcast helpers for room and presence events.
pub mod room_events;
/// Room operations executed under the per-room lock.
pub mod room_service;
/// WebSocket connection and message handling service.
pub mod websocket_service;
