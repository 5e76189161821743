pub mod app;
pub mod config;
pub mod diff_review;
pub mod editor;
pub mod event_bridge;
pub mod http;
pub mod lockfile;
pub mod nvim_rpc;
pub mod protocol;
pub mod router;
pub mod scratch;
pub mod tools;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigManager};
pub use diff_review::{DiffReviewEngine, Outcome, ReviewError};
pub use editor::{Editor, EditorClient, EditorError};
pub use event_bridge::EventBridge;
pub use router::{SessionRouter, ToolHandler, ToolRegistry};
pub use tracker::{OpenFileTracker, TrackedFile};
