//! Asynchronous GitHub repository analysis service.
//!
//! Repositories are submitted over HTTP, analyzed stage by stage on a
//! bounded worker pool, and streamed back to clients as server-sent
//! events. Finished analyses can be queried in natural language through a
//! chat-completion backend.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod errors;
pub mod fetcher;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod qa;
pub mod server;
pub mod stages;
