pub mod engine;
pub mod handlers;
pub mod redact;
pub mod routes;
pub mod state_machine;
