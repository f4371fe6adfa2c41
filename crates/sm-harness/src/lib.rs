//! Harness: the execution layer under one node dispatch.
//!
//! Everything between "this node is eligible" and "its record is terminal":
//! - Stop conditions evaluated against streamed output
//! - Three-bucket rate limiter and usage/budget governor
//! - Middleware pipeline with retry/backoff and result validation
//! - Process spawning (real and scripted)
//! - The invocation runner that owns a node's ExecutionRecord
//! - Cooperative stop signalling for a run

pub mod budget;
pub mod middleware;
pub mod process;
pub mod rate_limiter;
pub mod runner;
pub mod shutdown;
pub mod stop_condition;
