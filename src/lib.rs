//! Halberd - browser-driven web vulnerability scanner
//!
//! Drives pooled browsers against a target through an intercepting proxy,
//! fuzzes query parameters and cookies with payload sets and inspects the
//! correlated responses for evidence of vulnerabilities.

pub mod browser;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod http;
pub mod models;
pub mod payloads;
pub mod plugins;
pub mod proxy;
pub mod report;
pub mod target;
