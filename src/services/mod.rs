//! External collaborators used by node executors.
//!
//! Executors never talk to a mail provider or the list store directly; they
//! go through these traits so that workers can be wired with real services
//! and tests with in-memory ones.

mod lists;
mod sender;

pub use lists::ContactLists;
pub use sender::{HttpMessageSender, LogSender, MessageSender, OutboundMessage};
