//! Logging setup for the node binary.

mod logging;

pub use logging::{default_directives, init_logging, LogFormat};
