//! # PPPP Node
//!
//! A runnable replication node. It hosts one [`Note`](demo::Note) store,
//! dials the configured peers, measures their latency periodically and shuts
//! down on SIGINT or SIGTERM.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod demo;
pub mod observability;
pub mod runner;
