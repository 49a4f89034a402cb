//! HTTP surface: routing, response framing and wire bodies

pub mod protocol;
pub mod response;
pub mod server;

pub use server::{AppState, HttpServer};
