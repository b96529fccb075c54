//! Deferred actions keyed by job
//!
//! Used for job start schedules and job expirations: an action is registered
//! under a key with a [`JobSchedule`] and can be cancelled until it fires.

pub mod job;
pub mod handler;

// Re-export commonly used items
pub use handler::ScheduleHandler;
pub use job::JobSchedule;
