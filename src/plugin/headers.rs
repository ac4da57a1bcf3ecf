//! Header mutator plugin
//!
//! Stamps `X-<key>: <value>` request headers from its options and marks
//! responses it has passed through. Mostly useful for smoke-testing a plugin
//! chain end to end.

use async_trait::async_trait;
use hyper::header::{HeaderName, HeaderValue};
use hyper::http::request::Parts;
use hyper::StatusCode;
use tracing::warn;

use crate::config::OptionsMap;
use crate::sink::{HijackError, ResponseSink};

use super::Plugin;

const RESPONSE_MARKER: &str = "x-header-mutator";

#[derive(Default)]
pub struct HeaderMutator {
    config: OptionsMap,
}

impl HeaderMutator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Plugin for HeaderMutator {
    async fn handle_request(
        &self,
        req: &mut Parts,
        _sink: &mut dyn ResponseSink,
    ) -> anyhow::Result<bool> {
        for (key, value) in &self.config {
            let Some(value) = value.as_str() else { continue };
            let name = match HeaderName::from_bytes(format!("x-{key}").as_bytes()) {
                Ok(name) => name,
                Err(_) => {
                    warn!(key, "Skipping option that is not a valid header name");
                    continue;
                }
            };
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    req.headers.insert(name, value);
                }
                Err(_) => warn!(key, "Skipping option that is not a valid header value"),
            }
        }
        Ok(false)
    }

    fn handle_response(&self, _req: &Parts, inner: Box<dyn ResponseSink>) -> Box<dyn ResponseSink> {
        Box::new(MarkedSink { inner })
    }

    fn priority(&self) -> i32 {
        100
    }

    fn config(&self) -> OptionsMap {
        self.config.clone()
    }

    fn validate_and_set_config(&mut self, config: OptionsMap) -> anyhow::Result<()> {
        for (key, value) in &config {
            if value.as_str().is_none() {
                anyhow::bail!("option '{key}' must be a string value");
            }
        }
        self.config = config;
        Ok(())
    }

    fn destroy(&self) {}
}

struct MarkedSink {
    inner: Box<dyn ResponseSink>,
}

#[async_trait]
impl ResponseSink for MarkedSink {
    fn headers_mut(&mut self) -> &mut hyper::header::HeaderMap {
        self.inner.headers_mut()
    }

    async fn write_header(&mut self, status: StatusCode) {
        self.inner
            .headers_mut()
            .insert(RESPONSE_MARKER, HeaderValue::from_static("processed"));
        self.inner.write_header(status).await;
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.inner.write(data).await
    }

    fn hijack(&mut self) -> Result<hyper::upgrade::OnUpgrade, HijackError> {
        self.inner.hijack()
    }
}
