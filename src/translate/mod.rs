//! Request and response shaping between clients and backends.
//!
//! Clients and backends speak the same wire dialect, so translation is mostly
//! model-id rewriting plus validation and error normalization. All functions
//! here are pure (no I/O).

pub mod openai_types;
pub mod request;
pub mod response;
pub mod sse;
