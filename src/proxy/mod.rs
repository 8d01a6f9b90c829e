//! HTTP front end.
//!
//! This module provides the OpenAI-compatible HTTP API that accepts
//! requests, routes them to a cluster or provider, and streams the answer
//! back.

mod handlers;
mod server;
pub mod stream;
pub mod types;

pub use handlers::{REASON_HEADER, REQUEST_ID_HEADER, TARGET_HEADER};
pub use server::{create_router, run_server, AppState, RequestId, DRAIN_TIMEOUT};
pub use types::{
    ensure_stream_options, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    Message, Role, StreamOptions,
};
