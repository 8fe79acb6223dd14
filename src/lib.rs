// Encrypted credential storage
pub mod credentials;

// Access-token lifecycle (single-flight refresh)
pub mod token;

// Provider quota tracking
pub mod rate_limit;

// Per-provider failure isolation
pub mod circuit_breaker;

// Outbound provider calls
pub mod gateway;
pub mod provider;

// OAuth authorization code flow
pub mod oauth;

// Deauthorization webhooks
pub mod webhook;

// HTTP API
pub mod api;
pub mod identity;

pub mod config;
pub mod error;
pub mod sanitize;
