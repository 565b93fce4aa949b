//! Run execution: enrollment, the graph-walk loop and retry policy.

mod retry;
mod walker;

pub use retry::{BackoffType, RetryPolicy};
pub use walker::Engine;
