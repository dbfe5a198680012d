//! Scrape-time metrics aggregation proxy.
//!
//! On every request the proxy fetches a Prometheus text exposition from an
//! upstream (optionally every address its hostname resolves to), relabels
//! each sample per configured subset, sums samples whose label sets collapse
//! to the same series, and serves the reduced result.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │    Upstream     │────>│     Scraper     │────>│   HTTP Server   │
//! │  (N addresses)  │     │ (relabel + sum) │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! metric-gate --upstream http://ingress:10254/metrics --resolve --label pod
//! ```
//!
//! # Configuration
//!
//! See [`config::GateConfig`] for configuration options.

pub mod analyze;
pub mod config;
pub mod http;
pub mod relabel;
pub mod render;
pub mod scrape;
pub mod store;

pub use analyze::{Analyzer, Report, analyze_file, analyze_reader, analyze_str};
pub use config::{DEFAULT_SUBSET, GateConfig};
pub use http::HttpServer;
pub use relabel::{Action, RelabelConfig, RelabelPipeline, Subset};
pub use render::render;
pub use scrape::{Resolver, ScrapeError, ScrapeTarget, Scraper, SharedScraper, SystemResolver};
pub use store::{AggregationStore, Series, Snapshot};
