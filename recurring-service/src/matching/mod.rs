//! Expectation generation, reconciliation and the missed lifecycle.

pub mod drift;
pub mod generator;
pub mod matcher;
pub mod scorer;
pub mod sweep;
pub mod transition;

pub use drift::{DriftCorrector, DriftOutcome};
pub use generator::Generator;
pub use matcher::{AccountSummary, Matcher, RecurringOutcome};
pub use sweep::{MissedSweep, SweepSummary};
pub use transition::{AccountTransitionMatcher, TransitionOutcome};
