//! driftsync - keeps an object-metadata index consistent with files written
//! directly to the POSIX volume backing it.
//!
//! # Architecture
//!
//! Three independent capture backends observe filesystem mutations that
//! bypassed the index service's own write path:
//!
//! - [`capture::changelog`]: tails an ordered, ack-able change log
//! - [`capture::watch`]: live filesystem notifications, published to a broker
//! - [`capture::crawl`]: periodic filesystem-vs-index diff
//!
//! Each backend classifies mutations with the stateless [`classify`]
//! predicates (so the index service's own writes are never re-indexed),
//! builds complete update records with [`builder`], and hands them off:
//! either through the durable on-disk [`queue`] or across the [`broker`] to
//! the out-of-process [`consumer`]. The [`supervisor`] composes whichever
//! backends are enabled; they share nothing mutable.

pub mod broker;
pub mod builder;
pub mod capture;
pub mod classify;
pub mod consumer;
pub mod index_client;
pub mod queue;
pub mod reconcile;
pub mod resolve;
pub mod supervisor;

pub use capture::{CaptureBackend, ChangeEvent, Ident, SourceTag};
