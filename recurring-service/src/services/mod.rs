//! Services module for recurring-service.

pub mod audit;
pub mod database;
pub mod experiment;
pub mod inference;
pub mod ledger;
pub mod metrics;
pub mod notifications;
pub mod replica;
pub mod repository;

pub use audit::{AuditLog, AuditRecord};
pub use database::Database;
pub use experiment::{ExperimentArm, ExperimentGate, GateDecision};
pub use inference::{HttpScheduleInference, InferredSchedule, ScheduleInference};
pub use ledger::{Ledger, QueryOptions};
pub use metrics::{
    get_metrics, init_metrics, record_drift, record_error, record_generated, record_match,
    record_missed, record_missed_alert,
};
pub use notifications::{HttpNotifier, Notification, Notifier, notify};
pub use replica::{ReplicaGate, ReplicaLagProbe};
pub use repository::{DataSource, Repository};
