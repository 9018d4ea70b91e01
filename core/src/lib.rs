//! Core control-plane and data-plane types for the load-generation swarm.
//!
//! Three tiers, leaves first:
//!
//! - [`report`] — the statistics monoid every tier merges into.
//! - [`bus`] — the request/reply transport Colonies and Overminds speak.
//! - [`hatchling`] — the per-virtual-user task scheduler and HTTP client mixin.
//! - [`colony`] and [`overmind`] — the two coordinator tiers built on top.
//! - [`partition`], [`settings`], [`subprocess`] — supporting machinery.

pub mod bus;
pub mod colony;
pub mod error;
pub mod hatchling;
pub mod overmind;
pub mod partition;
pub mod report;
pub mod settings;
pub mod subprocess;

pub use error::{SwarmError, SwarmResult};
