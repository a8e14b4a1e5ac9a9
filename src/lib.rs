#![forbid(unsafe_code)]

//! `usb-warden` keeps a usbguard-style enforcement daemon's configuration
//! correct, consistent, and recoverable.
//!
//! - `policy`: daemon config discovery + transactional rule-file management
//! - `protocol`: JSON batch policy-change protocol (manual and preset modes)
//! - `guard`: narrow capability interface to the enforcement daemon
//! - `systemd`: unit-lifecycle control with bounded confirmation polling
//! - `store`: persistent device-permission and mount-point records
//! - `migrations`: schema bootstrap for the SQLite store

pub mod guard;
pub mod migrations;
pub mod policy;
pub mod protocol;
pub mod store;
pub mod systemd;

pub use usb_warden_core::{Error, Result};
