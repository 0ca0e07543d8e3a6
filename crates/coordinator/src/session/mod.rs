//! Session state: the participant directory and snapshot reconciliation

pub mod directory;
pub mod reconcile;

pub use directory::{DirectoryChange, ParticipantDirectory};
pub use reconcile::ReconcileScheduler;
