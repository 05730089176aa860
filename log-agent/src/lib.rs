//! Access-log shipping agent.
//!
//! Tails an nginx-style access log, parses each appended line into a [`record::Record`] and
//! writes batches to InfluxDB, exposing live counters over HTTP.

pub mod config;
pub mod error;
pub mod metrics;
pub mod parsers;
pub mod pipeline;
pub mod record;
pub mod runner;
pub mod server;
pub mod sink;
pub mod tailer;
