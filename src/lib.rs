//! Odds ingestion, change detection and movement classification.
//!
//! Upstream events flow through the [`ingest::Orchestrator`] into the
//! [`tracker::OddsStateTracker`], which keeps per-outcome price state and
//! records significant moves. Recorded moves are classified by the
//! [`detector::AlertEngine`]. Crowd distributions and volumes are kept by
//! [`collector::CrowdCollector`].

pub mod api;
pub mod collector;
pub mod config;
pub mod db;
pub mod detector;
pub mod error;
pub mod feed;
pub mod fetcher;
pub mod ingest;
pub mod registry;
pub mod tracker;
pub mod types;
