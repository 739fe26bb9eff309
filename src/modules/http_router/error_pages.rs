//! Prefetched error pages.
//!
//! Each configured URL is fetched once per refresh (GET, redirects
//! followed, bounded size and timeout) and its body plus response headers
//! are cached, keyed by the status codes it replaces. A status code with
//! no cached entry serves an empty body.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use tracing::{debug, warn};

/// Largest error-page body we are willing to cache.
const MAX_PAGE_BYTES: usize = 1024 * 1024;

/// How long a single error-page fetch may take.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// One fetched error page.
#[derive(Debug)]
pub struct CachedPage {
    /// URL the page was fetched from.
    pub url: String,
    /// Response body.
    pub body: Bytes,
    /// All response headers from the fetch, replayed onto proxied
    /// responses that use this page.
    pub headers: HeaderMap,
}

/// Status-code-keyed cache of prefetched pages.
pub struct ErrorPageCache {
    pages: RwLock<HashMap<u16, Arc<CachedPage>>>,
    client: reqwest::Client,
}

impl std::fmt::Debug for ErrorPageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pages = self.pages.read().expect("pages lock poisoned");
        f.debug_struct("ErrorPageCache")
            .field("codes", &pages.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ErrorPageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorPageCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            pages: RwLock::new(HashMap::new()),
            client,
        }
    }

    /// Re-fetch every configured URL and swap the cache.
    ///
    /// URLs are visited in sorted order; when status codes overlap, the
    /// first URL claims them. A failed fetch is logged and its codes are
    /// left without a page until the next refresh.
    pub async fn refresh(&self, mapping: &HashMap<String, Vec<u16>>) {
        let mut fresh: HashMap<u16, Arc<CachedPage>> = HashMap::new();

        let mut urls: Vec<&String> = mapping.keys().collect();
        urls.sort();

        for url in urls {
            let page = match self.fetch(url).await {
                Ok(page) => Arc::new(page),
                Err(e) => {
                    warn!(url = %url, error = %e, "error page fetch failed");
                    continue;
                }
            };

            for &code in &mapping[url] {
                fresh.entry(code).or_insert_with(|| Arc::clone(&page));
            }
        }

        debug!(codes = fresh.len(), "error page cache refreshed");
        *self.pages.write().expect("pages lock poisoned") = fresh;
    }

    /// Fetch one page, bounding the body size.
    async fn fetch(&self, url: &str) -> Result<CachedPage, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("unexpected status {}", response.status()));
        }

        if let Some(len) = response.content_length() {
            if len as usize > MAX_PAGE_BYTES {
                return Err(format!("body too large ({len} bytes)"));
            }
        }

        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        if body.len() > MAX_PAGE_BYTES {
            return Err(format!("body too large ({} bytes)", body.len()));
        }

        Ok(CachedPage {
            url: url.to_string(),
            body,
            headers,
        })
    }

    /// Look up the cached page for a status code.
    #[must_use]
    pub fn get(&self, status: u16) -> Option<Arc<CachedPage>> {
        self.pages
            .read()
            .expect("pages lock poisoned")
            .get(&status)
            .cloned()
    }

    /// Whether any code has a cached page.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.read().expect("pages lock poisoned").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP server that answers every request with a fixed body
    /// and a Last-Modified header.
    async fn page_server(body: &'static str, last_modified: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = conn.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nLast-Modified: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        last_modified,
                        body
                    );
                    let _ = conn.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn refresh_caches_body_and_headers() {
        let addr = page_server("oops", "Tue, 01 Jan 2030 00:00:00 GMT").await;

        let cache = ErrorPageCache::new();
        let mut mapping = HashMap::new();
        mapping.insert(format!("http://{addr}/error"), vec![502, 503]);
        cache.refresh(&mapping).await;

        let page = cache.get(503).expect("page cached");
        assert_eq!(page.body.as_ref(), b"oops");
        assert_eq!(
            page.headers.get("last-modified").unwrap(),
            "Tue, 01 Jan 2030 00:00:00 GMT"
        );
        assert!(cache.get(502).is_some());
        assert!(cache.get(504).is_none());
    }

    #[tokio::test]
    async fn failed_fetch_leaves_code_empty() {
        let cache = ErrorPageCache::new();
        let mut mapping = HashMap::new();
        mapping.insert("http://127.0.0.1:1/error".to_string(), vec![503]);
        cache.refresh(&mapping).await;

        assert!(cache.get(503).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn first_url_wins_overlapping_codes() {
        let addr = page_server("page", "x").await;

        let cache = ErrorPageCache::new();
        let mut mapping = HashMap::new();
        // Same host, so the path decides the sorted visit order.
        mapping.insert(format!("http://{addr}/aaa"), vec![503]);
        mapping.insert(format!("http://{addr}/zzz"), vec![503, 504]);
        cache.refresh(&mapping).await;

        assert_eq!(cache.get(503).unwrap().url, format!("http://{addr}/aaa"));
        assert_eq!(cache.get(504).unwrap().url, format!("http://{addr}/zzz"));
    }
}
