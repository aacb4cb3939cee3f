mod adapter;
pub mod clock;
mod timed;
mod watcher;

pub use adapter::{Adapter, Document};
pub use timed::{DbTime, TimedEntry, TimedIndex};
pub use watcher::{RecentSession, Watcher};
