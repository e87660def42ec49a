//! Block anchoring: polling, sync and notify stages per managed chain
//!
//! ```text
//! polling ──► sync ──► BlockQueue ──► notify ──► workers ──► message pool
//! ```
//!
//! Every stage keeps its own watermark. `notify(type) <= sync` always
//! holds; `sync` may briefly trail `polling` and never runs more than
//! `max_diff_between_sync_and_notify` blocks ahead of the cross-chain
//! message notify watermark.

pub mod heights;
pub mod notify;
pub mod polling;
pub mod queue;
pub mod sync;
pub mod worker;

pub use heights::WatermarkCache;
pub use notify::BlockNotifyTask;
pub use polling::BlockPollingTask;
pub use queue::BlockQueue;
pub use sync::BlockSyncTask;
pub use worker::{BlockWorker, CrossChainMessageWorker};
