//! Scrape orchestration.
//!
//! A scrape cycle resolves the upstream into targets, fetches every target
//! concurrently, streams each body through the line parser and every subset's
//! relabel pipeline into per-cycle aggregation stores, and finally publishes
//! the stores as one immutable [`Snapshot`].
//!
//! ```text
//! ┌──────────┐     ┌──────────────┐     ┌───────────┐     ┌────────────┐
//! │ Resolver │────>│ target tasks │────>│  Subsets  │────>│   Stores   │
//! │ (DNS)    │     │ (fetch+parse)│     │ (relabel) │     │ (sum-merge)│
//! └──────────┘     └──────────────┘     └───────────┘     └─────┬──────┘
//!                                                               │ publish
//!                                                         ┌─────▼──────┐
//!                                                         │  Snapshot  │
//!                                                         └────────────┘
//! ```
//!
//! Readers only ever see the last published snapshot; a cycle in progress is
//! invisible to them.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use metric_gate_common::{ParseError, current_timestamp_millis, parse_line_bytes};
use reqwest::{StatusCode, Url, header};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::analyze::{Analyzer, Report};
use crate::config::{ConfigError, DEFAULT_SUBSET, GateConfig};
use crate::relabel::Subset;
use crate::render::render;
use crate::store::{AggregationStore, Snapshot};

/// Scrape errors.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("request to {target} failed: {source}")]
    Fetch {
        target: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{target} responded with {status}")]
    Status { target: String, status: StatusCode },

    #[error("invalid response from {target}: {source}")]
    Parse {
        target: String,
        #[source]
        source: ParseError,
    },

    #[error("scrape task failed: {0}")]
    Task(String),

    #[error("Error getting any metrics from upstream:{}", join_causes(.0))]
    AllTargetsFailed(Vec<ScrapeError>),

    #[error("no metrics have been scraped yet for subset '{0}'")]
    SubsetUnavailable(String),

    #[error("no such subset '{0}'")]
    UnknownSubset(String),
}

fn join_causes(errors: &[ScrapeError]) -> String {
    errors.iter().map(|e| format!("\n{}", e)).collect()
}

/// Future returned by [`Resolver::resolve`].
pub type ResolveFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send + 'a>>;

/// Hostname to address resolution.
pub trait Resolver: Send + Sync {
    /// Resolve `host` into its addresses, in resolver order.
    fn resolve<'a>(&'a self, host: &'a str) -> ResolveFuture<'a>;
}

/// Resolver backed by the system DNS configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve<'a>(&'a self, host: &'a str) -> ResolveFuture<'a> {
        Box::pin(async move {
            let mut addrs = Vec::new();
            for addr in tokio::net::lookup_host((host, 0)).await? {
                if !addrs.contains(&addr.ip()) {
                    addrs.push(addr.ip());
                }
            }
            Ok(addrs)
        })
    }
}

/// One endpoint fetched during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeTarget {
    /// URL actually requested.
    pub url: Url,
    /// `Host` header override, set for DNS-expanded targets.
    pub host_header: Option<String>,
}

impl ScrapeTarget {
    /// Target that requests `url` as is.
    pub fn direct(url: Url) -> Self {
        Self {
            url,
            host_header: None,
        }
    }

    /// Target for one resolved address of `upstream`.
    ///
    /// Keeps the upstream scheme, port, path and query, and sends the
    /// original host as `Host` so name-based routing still works.
    pub fn for_address(upstream: &Url, addr: IpAddr) -> Result<Self, ScrapeError> {
        let mut url = upstream.clone();
        url.set_ip_host(addr).map_err(|()| ScrapeError::Resolve {
            host: upstream.host_str().unwrap_or_default().to_string(),
            reason: format!("cannot use address {}", addr),
        })?;

        let host = upstream.host_str().unwrap_or_default();
        let host_header = match upstream.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Self {
            url,
            host_header: Some(host_header),
        })
    }

    fn request(&self, client: &reqwest::Client, timeout: Duration) -> reqwest::RequestBuilder {
        let mut request = client.get(self.url.clone()).timeout(timeout);
        if let Some(host) = &self.host_header {
            request = request.header(header::HOST, host);
        }
        request
    }
}

impl fmt::Display for ScrapeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Reassembles lines from arbitrarily split body chunks.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
    /// Leading bytes of `pending` already known to hold no newline.
    scanned: usize,
}

impl LineBuffer {
    /// Append a chunk and hand every completed line to `f`.
    fn push<F>(&mut self, chunk: &[u8], f: &mut F) -> Result<(), ParseError>
    where
        F: FnMut(&[u8]) -> Result<(), ParseError>,
    {
        self.pending.extend_from_slice(chunk);

        let mut consumed = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.pending[from..].iter().position(|&b| b == b'\n') {
            let end = from + offset;
            f(&self.pending[consumed..end])?;
            consumed = end + 1;
            from = consumed;
        }
        self.pending.drain(..consumed);
        self.scanned = self.pending.len();
        Ok(())
    }

    /// Hand the trailing unterminated line, if any, to `f`.
    fn finish<F>(self, f: &mut F) -> Result<(), ParseError>
    where
        F: FnMut(&[u8]) -> Result<(), ParseError>,
    {
        if self.pending.is_empty() {
            return Ok(());
        }
        f(&self.pending)
    }
}

/// Stream a response body to `f` one line at a time.
///
/// Stops at the first line `f` rejects.
async fn for_each_line<F>(
    mut response: reqwest::Response,
    target: &str,
    mut f: F,
) -> Result<(), ScrapeError>
where
    F: FnMut(&[u8]) -> Result<(), ParseError>,
{
    let parse_error = |source: ParseError| ScrapeError::Parse {
        target: target.to_string(),
        source,
    };

    let mut lines = LineBuffer::default();
    while let Some(chunk) = response.chunk().await.map_err(|e| ScrapeError::Fetch {
        target: target.to_string(),
        source: e,
    })? {
        lines.push(&chunk, &mut f).map_err(parse_error)?;
    }
    lines.finish(&mut f).map_err(parse_error)
}

/// Send a request and reject non-success responses.
async fn fetch(
    request: reqwest::RequestBuilder,
    target: &str,
) -> Result<reqwest::Response, ScrapeError> {
    let response = request.send().await.map_err(|e| ScrapeError::Fetch {
        target: target.to_string(),
        source: e,
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ScrapeError::Status {
            target: target.to_string(),
            status,
        });
    }
    Ok(response)
}

/// Fetch one target and merge its samples into the cycle's stores.
///
/// Returns the number of samples read. A malformed line aborts the rest of
/// this target; samples merged before it stay merged.
async fn ingest_target(
    client: &reqwest::Client,
    target: &ScrapeTarget,
    timeout: Duration,
    subsets: &[Subset],
    stores: &[AggregationStore],
) -> Result<usize, ScrapeError> {
    let name = target.to_string();
    let response = fetch(target.request(client, timeout), &name).await?;

    let mut samples = 0;
    for_each_line(response, &name, |line| {
        let Some(sample) = parse_line_bytes(line)? else {
            return Ok(());
        };
        samples += 1;
        for (subset, store) in subsets.iter().zip(stores) {
            if let Some((metric, key)) = subset.apply(&sample) {
                store.add(metric, key, sample.value, sample.timestamp_ms);
            }
        }
        Ok(())
    })
    .await?;

    Ok(samples)
}

/// Runs scrape cycles and holds the last published snapshot.
pub struct Scraper {
    upstream: Url,
    resolve: bool,
    timeout: Duration,
    subsets: Arc<[Subset]>,
    client: reqwest::Client,
    resolver: Arc<dyn Resolver>,
    published: ArcSwapOption<Snapshot>,
}

/// Create a shareable scraper handle.
pub type SharedScraper = Arc<Scraper>;

impl Scraper {
    /// Create a scraper for a single upstream with a 10 second timeout.
    pub fn new(upstream: Url, subsets: Vec<Subset>) -> Result<Self, ScrapeError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(ScrapeError::Client)?;

        Ok(Self {
            upstream,
            resolve: false,
            timeout: Duration::from_secs(10),
            subsets: subsets.into(),
            client,
            resolver: Arc::new(SystemResolver),
            published: ArcSwapOption::empty(),
        })
    }

    /// Create a scraper from a validated configuration.
    pub fn from_config(config: &GateConfig) -> Result<Self, ScrapeError> {
        let upstream = config.upstream.parsed_url()?;
        let subsets = config.compile_subsets()?;

        Ok(Self::new(upstream, subsets)?
            .with_resolve(config.upstream.resolve)
            .with_timeout(config.upstream.timeout()))
    }

    /// Scrape every address the upstream hostname resolves to.
    pub fn with_resolve(mut self, resolve: bool) -> Self {
        self.resolve = resolve;
        self
    }

    /// Per-target fetch timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the system DNS resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// Names of the configured subsets, default first.
    pub fn subset_names(&self) -> impl Iterator<Item = &str> {
        self.subsets.iter().map(|s| s.name.as_str())
    }

    pub fn has_subset(&self, name: &str) -> bool {
        self.subsets.iter().any(|s| s.name == name)
    }

    /// The last published snapshot, if any cycle has completed.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.published.load_full()
    }

    /// Targets of the next cycle.
    pub async fn targets(&self) -> Result<Vec<ScrapeTarget>, ScrapeError> {
        if !self.resolve {
            return Ok(vec![ScrapeTarget::direct(self.upstream.clone())]);
        }

        let host = self
            .upstream
            .host_str()
            .unwrap_or_default()
            .trim_start_matches('[')
            .trim_end_matches(']');

        let addrs = self
            .resolver
            .resolve(host)
            .await
            .map_err(|e| ScrapeError::Resolve {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        if addrs.is_empty() {
            return Err(ScrapeError::Resolve {
                host: host.to_string(),
                reason: "no addresses found".to_string(),
            });
        }
        debug!(host, addrs = ?addrs, "Resolved upstream");

        addrs
            .into_iter()
            .map(|addr| ScrapeTarget::for_address(&self.upstream, addr))
            .collect()
    }

    /// Run one scrape cycle and publish its result.
    ///
    /// Fails only when target resolution fails or every target fails; the
    /// previously published snapshot is kept in that case.
    pub async fn scrape(&self) -> Result<Arc<Snapshot>, ScrapeError> {
        let start = Instant::now();
        let targets = self.targets().await?;
        let target_count = targets.len();

        let stores: Arc<[AggregationStore]> =
            self.subsets.iter().map(|_| AggregationStore::new()).collect();

        let mut tasks = JoinSet::new();
        for target in targets {
            let client = self.client.clone();
            let subsets = self.subsets.clone();
            let stores = stores.clone();
            let timeout = self.timeout;
            tasks.spawn(async move {
                let result = ingest_target(&client, &target, timeout, &subsets, &stores).await;
                (target, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((target, Ok(samples))) => {
                    debug!(target = %target, samples, "Target scraped");
                }
                Ok((target, Err(e))) => {
                    error!(target = %target, error = %e, "Target scrape failed");
                    failures.push(e);
                }
                Err(e) => {
                    error!(error = %e, "Scrape task failed");
                    failures.push(ScrapeError::Task(e.to_string()));
                }
            }
        }

        debug!(
            took_ms = start.elapsed().as_millis() as u64,
            upstreams = target_count,
            down = failures.len(),
            "Upstream requests done"
        );

        if failures.len() == target_count {
            return Err(ScrapeError::AllTargetsFailed(failures));
        }
        if !failures.is_empty() {
            warn!(
                down = failures.len(),
                upstreams = target_count,
                "Publishing partial scrape"
            );
        }

        let subsets = self
            .subsets
            .iter()
            .zip(stores.iter())
            .map(|(subset, store)| {
                let series = store.take();
                debug!(
                    subset = %subset.name,
                    metrics = series.metric_count(),
                    series = series.len(),
                    "Subset aggregated"
                );
                (subset.name.clone(), series)
            })
            .collect();
        let snapshot = Arc::new(Snapshot::new(subsets, current_timestamp_millis()));
        self.published.store(Some(snapshot.clone()));

        Ok(snapshot)
    }

    /// Run a cycle and render the default subset.
    ///
    /// Series without an explicit timestamp are rendered without one, as the
    /// data is fresh.
    pub async fn scrape_and_render(&self) -> Result<String, ScrapeError> {
        let start = Instant::now();
        let snapshot = self.scrape().await?;
        let series = snapshot
            .subset(DEFAULT_SUBSET)
            .ok_or_else(|| ScrapeError::UnknownSubset(DEFAULT_SUBSET.to_string()))?;

        let body = render(series, None);
        debug!(
            took_ms = start.elapsed().as_millis() as u64,
            series = series.len(),
            "Render metrics done"
        );
        Ok(body)
    }

    /// Render a subset from the last published snapshot without scraping.
    ///
    /// Series without an explicit timestamp get the cycle completion time.
    pub fn render_subset(&self, name: &str) -> Result<String, ScrapeError> {
        if !self.has_subset(name) {
            return Err(ScrapeError::UnknownSubset(name.to_string()));
        }

        let snapshot = self
            .published
            .load_full()
            .ok_or_else(|| ScrapeError::SubsetUnavailable(name.to_string()))?;
        let series = snapshot
            .subset(name)
            .ok_or_else(|| ScrapeError::SubsetUnavailable(name.to_string()))?;

        Ok(render(series, Some(snapshot.completed_at_ms())))
    }

    /// Fetch the upstream URL as is.
    pub async fn fetch_upstream(&self) -> Result<reqwest::Response, ScrapeError> {
        let target = ScrapeTarget::direct(self.upstream.clone());
        fetch(target.request(&self.client, self.timeout), self.upstream.as_str()).await
    }

    /// Build a cardinality report of the upstream response.
    pub async fn analyze_upstream(&self) -> Result<Report, ScrapeError> {
        let response = self.fetch_upstream().await?;

        let mut analyzer = Analyzer::new();
        for_each_line(response, self.upstream.as_str(), |line| {
            if let Some(sample) = parse_line_bytes(line)? {
                analyzer.add(&sample);
            }
            Ok(())
        })
        .await?;

        Ok(analyzer.finish())
    }
}
