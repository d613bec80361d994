//! parkd — a multi-tenant parking-reservation service.
//!
//! Each tenant gets an isolated in-memory booking ledger backed by an
//! append-only WAL. Conflict detection, first-fit assignment, no-show
//! auto-release, weekly recurrence expansion and a FIFO waitlist all
//! live in [`engine`]; [`http`] is the REST surface over it.

pub mod config;
pub mod engine;
pub mod expander;
pub mod http;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sweeper;
pub mod tenant;
pub mod wal;
