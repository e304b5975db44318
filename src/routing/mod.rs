//! Content-addressed routing of jobs to supervisors.
//!
//! A [`Client`] holds one [`Channel`] per channel name. Each channel maps a
//! job identity onto one of its `host:port/channel` targets, so any two
//! clients built from the same [`DeskSpec`] list route identically.

pub mod channel;
pub mod client;
pub mod spec;

pub use channel::Channel;
pub use client::{Client, Signature};
pub use spec::{DeskSpec, DEFAULT_HOST};
