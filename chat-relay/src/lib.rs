//! Line-oriented TCP chat relay and its reconnecting terminal client.
//!
//! Clients announce a display name with `NAME:<name>`, send chat with
//! `MSG:<text>`, and receive `FROM:<name>:<text>` and `SYS:<text>` lines.
//! The relay forwards every chat message to every named client, the sender
//! included.
//!
//! - [`codec`] encodes and decodes the text protocol and reassembles lines.
//! - [`registry`] tracks connections, names, and outbound queues.
//! - [`server`] runs the single-task relay loop.
//! - [`client`] keeps a client connected, reconnecting with [`backoff`].
//! - [`config`] and [`cli`] build settings from JSON files and flags.
//! - [`display`] renders both sides on the terminal.

pub mod backoff;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod display;
pub mod error;
pub mod registry;
pub mod server;
pub mod shutdown;
