pub mod client;
pub mod discover;
pub mod quota;
pub mod sse;

pub use client::UpstreamClient;
pub use discover::discover_project;
pub use sse::{SseFrameParser, UpstreamDelta, deltas};
