pub mod cron;
pub mod events;

pub use cron::SweepCron;
pub use events::{BankConnectionUpdated, EventHandler, EventSummary, UpdateType};
