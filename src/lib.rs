//! A durable background job queue for shell commands.
//!
//! Jobs live in an embedded SQLite store shared by the admin surface,
//! a supervisor and its worker processes; workers claim jobs through an
//! atomic lease, run them with output capture and a timeout, and feed
//! failures through an exponential-backoff retry policy into a
//! dead-letter queue.

pub mod error;
pub mod executor;
pub mod retry;
pub mod store;
pub mod supervisor;
pub mod types;
pub mod worker;
