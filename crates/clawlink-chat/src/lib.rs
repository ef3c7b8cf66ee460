//! Chat state for the clawlink client.
//!
//! - `StreamReconciler` - merges the incremental generation stream into a
//!   stable draft and decides which events belong to the active run
//! - `ConversationCache` - per-agent history kept across switches and
//!   reconnects
//! - `ChatController` - glues the gateway event stream to both and emits
//!   render updates for an external UI

pub mod cache;
pub mod controller;
pub mod reconciler;

pub use cache::ConversationCache;
pub use controller::{ChatController, ChatUpdate, StatusSnapshot};
pub use reconciler::{StreamEffect, StreamReconciler, STREAM_WATCHDOG};
