//! # pcp
//!
//! Typed access to metrics served by a Performance Co-Pilot daemon.
//!
//! The daemon's client protocol is loosely typed: a metric descriptor carries
//! a type tag, and every fetched value must be extracted with that tag. This
//! crate models the tags as [`ValueType`] and decoded values as [`Atom`], so
//! a value can never be read with the wrong width or signedness.
//!
//! [`MetricsClient`] owns one connection and turns a metric name into a map
//! from instance id to [`Atom`]. [`MetricsClientCell`] hands out a single
//! shared client, connecting lazily on first use.

mod api;
mod atom;
mod client;
mod error;
pub mod libpcp;
mod memory_context;

pub use api::*;
pub use atom::*;
pub use client::*;
pub use error::*;
pub use libpcp::{LibPcp, LibPcpFetch, DEFAULT_LIBRARY};
pub use memory_context::*;
