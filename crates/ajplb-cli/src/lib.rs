//! # ajplb CLI
//!
//! Command-line tools around the ajplb connector.
//!
//! - `ajplb ping`: CPING/CPONG round trip against one container
//! - `ajplb forward`: send a single request over AJP13 and print the reply
//! - `ajplb route`: dry-run balancer selections from a configuration file
//! - `ajplb status`: run a status command against a configured connector
//!
//! The binary parses arguments with `argh` and calls into [`commands`],
//! which holds the testable parts.

pub mod commands;
