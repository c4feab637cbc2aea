//! HTTP surface: health, participant status and the WebSocket upgrade

pub mod routes;

pub use routes::build_router;
