//! Response cache plugin
//!
//! Caches upstream response bodies in an LRU keyed by a chosen request field.
//! A hit is answered directly from the request phase with `X-Cache-Hit: true`
//! and never reaches the upstream. The wrapped response sink captures the
//! bytes of the last `write` call only, so bodies delivered in multiple
//! chunks (streaming responses) are not cached correctly; that limitation is
//! inherited and documented rather than papered over with whole-body
//! buffering.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::HeaderValue;
use hyper::http::request::Parts;
use hyper::StatusCode;

use crate::cache::LruCache;
use crate::config::OptionsMap;
use crate::sink::{HijackError, ResponseSink};

use super::Plugin;

const CACHE_HIT_HEADER: &str = "x-cache-hit";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum KeySource {
    Uri,
    Host,
    Method,
}

impl KeySource {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "uri" => Some(Self::Uri),
            "host" => Some(Self::Host),
            "method" => Some(Self::Method),
            _ => None,
        }
    }

    fn extract(&self, req: &Parts) -> String {
        match self {
            Self::Uri => req
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| req.uri.path().to_string()),
            Self::Host => req
                .headers
                .get(hyper::header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
                .or_else(|| req.uri.authority().map(|a| a.to_string()))
                .unwrap_or_default(),
            Self::Method => req.method.as_str().to_string(),
        }
    }
}

#[derive(Clone)]
struct CacheState {
    cache: Arc<LruCache<Bytes>>,
    ttl: Duration,
    key: KeySource,
}

#[derive(Default)]
pub struct ResponseCache {
    config: OptionsMap,
    state: Option<CacheState>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Plugin for ResponseCache {
    async fn handle_request(
        &self,
        req: &mut Parts,
        sink: &mut dyn ResponseSink,
    ) -> anyhow::Result<bool> {
        let Some(state) = &self.state else {
            return Ok(false);
        };
        let key = state.key.extract(req);
        if let Some(cached) = state.cache.get(&key) {
            sink.headers_mut()
                .insert(CACHE_HIT_HEADER, HeaderValue::from_static("true"));
            sink.write(&cached).await?;
            return Ok(true);
        }
        Ok(false)
    }

    fn handle_response(&self, req: &Parts, inner: Box<dyn ResponseSink>) -> Box<dyn ResponseSink> {
        let Some(state) = &self.state else {
            return inner;
        };
        Box::new(CachingSink {
            inner,
            state: state.clone(),
            key: state.key.extract(req),
        })
    }

    fn priority(&self) -> i32 {
        100
    }

    fn config(&self) -> OptionsMap {
        self.config.clone()
    }

    fn validate_and_set_config(&mut self, config: OptionsMap) -> anyhow::Result<()> {
        let size = config
            .get("size")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| anyhow::anyhow!("size must be an integer"))?;
        if size <= 0 {
            anyhow::bail!("size must be a positive integer");
        }
        let ttl = config
            .get("ttl")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| anyhow::anyhow!("ttl must be an integer"))?;
        if ttl <= 0 {
            anyhow::bail!("ttl must be a positive integer");
        }
        let key = config
            .get("key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("key must be a string"))?;
        let key = KeySource::parse(key)
            .ok_or_else(|| anyhow::anyhow!("key must be one of uri, host, method"))?;

        self.state = Some(CacheState {
            cache: Arc::new(LruCache::new(size as usize)),
            ttl: Duration::from_secs(ttl as u64),
            key,
        });
        self.config = config;
        Ok(())
    }

    fn destroy(&self) {
        if let Some(state) = &self.state {
            state.cache.reset();
            state.cache.stop();
        }
    }
}

struct CachingSink {
    inner: Box<dyn ResponseSink>,
    state: CacheState,
    key: String,
}

#[async_trait]
impl ResponseSink for CachingSink {
    fn headers_mut(&mut self) -> &mut hyper::header::HeaderMap {
        self.inner.headers_mut()
    }

    async fn write_header(&mut self, status: StatusCode) {
        self.inner
            .headers_mut()
            .insert(CACHE_HIT_HEADER, HeaderValue::from_static("false"));
        self.inner.write_header(status).await;
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        // Last write wins. Correct for single-shot bodies; streaming bodies
        // are explicitly not cacheable through this plugin.
        self.state
            .cache
            .set(&self.key, Bytes::copy_from_slice(data), Some(self.state.ttl));
        self.inner.write(data).await
    }

    fn hijack(&mut self) -> Result<hyper::upgrade::OnUpgrade, HijackError> {
        self.inner.hijack()
    }
}
