//! Booking Recovery Server - event ingestion and recovery email dispatch.
//!
//! This crate provides the server component of Booking Recovery, responsible for:
//! - Receiving abandonment and completion events from the tracking snippet
//! - Resolving the owning website from a public tracking identifier
//! - Persisting booking records
//! - Scheduling and sending delayed recovery emails
//!
//! # Architecture
//!
//! Events flow from [`routes`] through [`ingest`] into the [`store`]. An
//! abandonment with a captured email is planned by the [`scheduler`] and
//! written together with its booking. The scheduler's dispatch loop later
//! claims due sends from the store, renders them with [`template`] and hands
//! them to an [`email`] transport. Pending sends are durable, so a restart
//! loses nothing that was accepted.

pub mod auth;
pub mod config;
pub mod email;
pub mod error;
pub mod ingest;
pub mod rate_limit;
pub mod routes;
pub mod scheduler;
pub mod store;
pub mod template;
pub mod types;
