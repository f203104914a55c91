//! Challenge lifecycle harness.
//!
//! Drives a remote challenge platform through complete flows (standard,
//! first-to-finish, topgear, design), one ordered step at a time, and streams
//! what happened to observers as [`events::RunEvent`]s.

pub mod cancel;
pub mod config;
pub mod controller;
pub mod errors;
pub mod events;
pub mod flows;
pub mod names;
pub mod platform;
pub mod poller;
pub mod recorder;
pub mod server;
pub mod snapshot;
pub mod step;
pub mod ui;
