//! The `persistence` module provides the durable overflow queues that topics
//! and channels spill into once their in-memory bound is exceeded.
//!
//! Each queue is a `sled` tree of append-only records keyed by a monotonic
//! sequence number. Consuming a record removes it in the same operation, so
//! the lowest remaining key is the persisted read cursor and a restart
//! resumes draining exactly where the previous run stopped.
//!
//! Durability boundary: `sled` flushes on its own timer and on `sync()`.
//! Records appended after the last flush may be lost on a crash, which makes
//! delivery at-least-once (never exactly-once) across crashes.

pub mod sled_store;

pub use sled_store::{DiskQueue, Persistence};
