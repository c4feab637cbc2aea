//! WebSocket transport: wire protocol, connection hub and upgrade handler

pub mod handler;
pub mod hub;
pub mod protocol;
