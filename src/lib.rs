//! Middleware for composite queries against a remote genomic-region
//! engine.
//!
//! The engine answers named remote procedures with `[status, payload]`
//! replies; region-processing commands are asynchronous and answer a
//! request identifier to be polled. This crate models composed queries
//! as immutable operation DAGs, memoizes every materialized query and
//! result by structural key, and orchestrates the multi-stage overlap
//! and enrichment pipelines on top, reporting progress through pollable
//! request trackers.
//!
//! Construct a [`manager::Manager`] with a transport and an engine
//! configuration; it owns the connected gateway, the cache-aware query
//! service, and the registry of running pipelines.

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod enrichment;
pub mod gateway;
pub mod manager;
pub mod operations;
pub mod pipeline;
pub mod service;
pub mod stats;
pub mod status;
pub mod transport;
