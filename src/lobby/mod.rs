//! Lobby: waiting room and session assignment

pub mod queue;
pub mod service;

pub use service::{LobbyConfig, LobbyService};
