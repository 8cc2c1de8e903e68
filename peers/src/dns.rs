use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use reqwest::Url;
use tracing::{debug, warn};

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves peer URL hostnames to IPs up front and keeps the mapping fresh
/// in the background, so per-request DNS latency and resolver flakiness stay
/// out of the hot path. Resolution never blocks or fails a caller: when a
/// lookup has not succeeded, the original URL is used as-is.
pub struct DnsResolver {
    urls: Vec<String>,
    lookup_timeout: Duration,
    resolved: RwLock<HashMap<String, String>>,
    refresh_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DnsResolver {
    /// Resolves each URL's hostname once at construction.
    pub async fn initialize(urls: Vec<String>, lookup_timeout: Duration) -> Arc<Self> {
        let resolver = Arc::new(Self {
            urls,
            lookup_timeout,
            resolved: RwLock::new(HashMap::new()),
            refresh_task: Mutex::new(None),
        });
        resolver.resolve_all().await;
        resolver
    }

    /// The resolved substitute for `url`, or `url` itself when no lookup has
    /// succeeded for it.
    pub fn resolve(&self, url: &str) -> String {
        self.resolved
            .read()
            .expect("resolved lock poisoned")
            .get(url)
            .cloned()
            .unwrap_or_else(|| url.to_string())
    }

    pub fn start_auto_refresh(self: &Arc<Self>, interval: Duration) {
        let resolver = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                resolver.resolve_all().await;
            }
        });
        let mut task = self.refresh_task.lock().expect("task lock poisoned");
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_auto_refresh(&self) {
        if let Some(task) = self
            .refresh_task
            .lock()
            .expect("task lock poisoned")
            .take()
        {
            task.abort();
        }
    }

    async fn resolve_all(&self) {
        for url in &self.urls {
            match resolve_one(url, self.lookup_timeout).await {
                Some(resolved) => {
                    debug!(%url, %resolved, "resolved peer host");
                    self.resolved
                        .write()
                        .expect("resolved lock poisoned")
                        .insert(url.clone(), resolved);
                }
                None => {
                    // Keep any previous resolution; a transient DNS failure
                    // must not degrade an already-working mapping.
                    warn!(%url, "peer host resolution failed, using url as-is");
                }
            }
        }
    }
}

async fn resolve_one(url: &str, timeout: Duration) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_string();
    if host.parse::<IpAddr>().is_ok() {
        return Some(url.to_string());
    }
    let port = parsed.port_or_known_default().unwrap_or(80);

    let lookup = tokio::time::timeout(
        timeout,
        tokio::net::lookup_host((host.as_str(), port)),
    )
    .await
    .ok()?
    .ok()?;

    let address = lookup.map(|addr| addr.ip()).next()?;
    parsed.set_ip_host(address).ok()?;
    Some(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unresolvable_hosts_fall_back_to_the_original_url() {
        let url = "http://no-such-host.invalid:1984";
        let resolver =
            DnsResolver::initialize(vec![url.to_string()], Duration::from_millis(200)).await;
        assert_eq!(resolver.resolve(url), url);
    }

    #[tokio::test]
    async fn ip_urls_pass_through_unchanged() {
        let url = "http://188.166.200.45:1984";
        let resolver =
            DnsResolver::initialize(vec![url.to_string()], DEFAULT_LOOKUP_TIMEOUT).await;
        assert_eq!(resolver.resolve(url), url);
    }

    #[tokio::test]
    async fn unknown_urls_resolve_to_themselves() {
        let resolver = DnsResolver::initialize(Vec::new(), DEFAULT_LOOKUP_TIMEOUT).await;
        assert_eq!(resolver.resolve("http://other"), "http://other");
    }
}
