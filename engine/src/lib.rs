//! Headless playback agent for single-board players.
//!
//! One scheduler task owns the playback state and drives the media backend.
//! The remote channel, the framebuffer panel and the loopback status API only
//! ever see published [`model::Snapshot`]s.

pub mod backend;
pub mod cache;
pub mod config;
pub mod display;
pub mod error;
pub mod model;
pub mod remote;
pub mod scheduler;
pub mod selftest;
pub mod status_api;
pub mod store;
