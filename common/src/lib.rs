pub mod cache;
pub mod config;
pub mod frame;

pub use cache::{CacheSnapshot, LatestFrameCache, StalenessPolicy};
pub use frame::Frame;
