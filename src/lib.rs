//! Event-driven reconciliation of account access assignments.
//!
//! Links declare which principal should hold which permission set across a
//! scope of accounts. Lifecycle events on links, principals, permission sets
//! and the organization are turned into single-account create/delete
//! requests, executed against the assignment service, and confirmed into a
//! provisioned-assignment ledger.

pub mod assignment;
pub mod catalog;
pub mod cli;
pub mod clients;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod expand;
pub mod ledger;
pub mod link;
pub mod notify;
pub mod pipeline;
pub mod telemetry;
pub mod tracker;
pub mod triggers;
