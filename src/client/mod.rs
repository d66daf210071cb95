//! The `client` module defines what a channel knows about one subscribed
//! connection: its identity, the sending side of its delivery queue, and the
//! credit it has granted.

pub mod pubsub_client;
pub use pubsub_client::{Client, ClientId};

#[cfg(test)]
mod tests;
