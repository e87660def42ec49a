//! AM relayer
//!
//! Anchors blocks of managed chains, extracts the authenticated messages
//! (AM) their cross-chain contracts emit, routes the SDP messages those AMs
//! carry, and commits them to locally served destination chains in
//! session order.

pub mod anchor;
pub mod api;
pub mod cache;
pub mod chain;
pub mod codec;
pub mod committer;
pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod models;
pub mod network;
pub mod processor;
pub mod runner;
pub mod types;

#[cfg(test)]
pub mod test_utils;
