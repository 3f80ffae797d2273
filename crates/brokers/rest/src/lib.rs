//! REST broker adapter.
//!
//! Talks to a broker's execution API over HTTPS using HMAC-signed JSON
//! requests. One request per call; retry policy lives in the caller.

pub mod api;
pub mod client;

pub use client::{sign, RestBroker, RestBrokerConfig};
