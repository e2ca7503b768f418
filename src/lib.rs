//! Chat relay - streams generated replies to a client as they are produced
//!
//! One shared, process-lifetime conversation. Each request appends the user's
//! turn, streams the upstream reply fragment by fragment over a chunked HTTP
//! response, and commits the assistant's turn only once the reply is whole.

pub mod api;
pub mod bridge;
pub mod client;
pub mod config;
pub mod llm;
pub mod relay;
pub mod transcript;
