//! SMS Relay — rule-driven message forwarding daemon.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod store;
