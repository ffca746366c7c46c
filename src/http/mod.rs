//! HTTP transport layer for the bridge
//!
//! Provides the SSE session endpoint, the fire-and-forget message submit
//! endpoint, and the health probe.

pub mod handlers;
