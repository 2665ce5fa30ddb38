// DriftSee API Library
//
// HTTP control surface and device WebSocket endpoint

pub mod http;

pub use http::{create_router, AppState};
