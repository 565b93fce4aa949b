//! What moves contacts through automations.
//!
//! - `TriggerMatcher`: reacts to activity events and enrolls contacts
//! - `Scheduler`: resumes suspended runs once they are due

mod matcher;
mod scheduler;

pub use matcher::{trigger_matches, TriggerMatcher};
pub use scheduler::{PollSummary, Scheduler};
