//! llm-router - cost- and health-aware routing of LLM inference
//!
//! This library routes chat, completion and embedding requests across
//! self-hosted inference clusters and hosted model providers, choosing a
//! backend per request from live health and cost data.

pub mod config;
pub mod cost;
pub mod error;
pub mod forward;
pub mod health;
pub mod metrics;
pub mod providers;
pub mod proxy;
pub mod router;

pub use config::Config;
pub use error::{Error, Result};
