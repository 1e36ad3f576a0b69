//! REST executor
//!
//! The only way a request leaves the process: every call passes the global
//! throttle, then its route's bucket, and settles the bucket from the
//! response before returning.

use super::bucket::BucketSnapshot;
use super::global::GlobalThrottle;
use super::headers::{RateLimitHeaders, RateLimited};
use super::registry::BucketRegistry;
use super::route::CompiledRoute;
use crate::config::{RestSettings, Token};
use crate::error::RestError;
use crate::shard::Backoff;

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const AUDIT_LOG_REASON: &str = "x-audit-log-reason";

/// Body, query and audit-log reason of one request
#[derive(Debug, Clone, Default)]
pub struct RequestPayload {
    pub body: Option<serde_json::Value>,
    pub query: Vec<(String, String)>,
    pub reason: Option<String>,
}

impl RequestPayload {
    pub fn json(body: serde_json::Value) -> Self {
        Self {
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A 2xx response
#[derive(Debug, Clone)]
pub struct RestResponse {
    route: String,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RestResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RestError> {
        serde_json::from_slice(&self.body).map_err(|source| RestError::Decode {
            route: self.route.clone(),
            source,
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

pub struct RestExecutor {
    http: Client,
    settings: RestSettings,
    base_url: Url,
    authorization: Option<HeaderValue>,
    global: GlobalThrottle,
    registry: Arc<BucketRegistry>,
    gc: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl RestExecutor {
    pub fn new(settings: RestSettings, token: Option<Token>) -> Result<Self, RestError> {
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(RestError::ClientBuild)?;

        let base_url = Url::parse(settings.base_url.trim_end_matches('/'))?;
        let authorization = token
            .map(|token| {
                let mut value = HeaderValue::from_str(&token.authorization())
                    .map_err(|_| RestError::InvalidToken)?;
                value.set_sensitive(true);
                Ok::<_, RestError>(value)
            })
            .transpose()?;

        info!(
            base_url = %base_url,
            global_rate_limit = settings.global_rate_limit,
            max_attempts = settings.max_attempts,
            "REST executor created"
        );

        Ok(Self {
            http,
            global: GlobalThrottle::new(settings.global_rate_limit),
            registry: Arc::new(BucketRegistry::new(settings.max_rate_limit, settings.bucket_capacity)),
            settings,
            base_url,
            authorization,
            gc: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Send one request through both rate-limit gates.
    ///
    /// Transport failures and 5xx are retried with backoff and 429s are
    /// waited out; none of that is visible to the caller except as latency.
    pub async fn execute(
        &self,
        route: &CompiledRoute,
        payload: &RequestPayload,
    ) -> Result<RestResponse, RestError> {
        self.ensure_gc();
        let url = self.url_for(route, payload)?;
        let template = route.route().template();
        let mut backoff = Backoff::new(self.settings.retry_base_delay, self.settings.retry_max_delay);
        let mut failures = 0u32;
        let mut rate_limits = 0u32;

        loop {
            self.global.acquire().await;
            let permit = self.registry.acquire(route).await.map_err(|wait| {
                crate::metrics::record_rate_limited(false);
                RestError::RateLimited {
                    route: route.to_string(),
                    retry_after: wait,
                    global: false,
                }
            })?;
            crate::metrics::record_bucket_wait(template, permit.waited());

            let started = Instant::now();
            let reply = match self.send(route, &url, payload).await {
                Ok(reply) => reply,
                Err(source) => {
                    drop(permit);
                    failures += 1;
                    crate::metrics::record_rest_request(template, 0, started.elapsed());
                    let error = RestError::Transport {
                        route: route.to_string(),
                        source,
                    };
                    if failures >= self.settings.max_attempts {
                        return Err(RestError::RetryExhausted {
                            route: route.to_string(),
                            attempts: failures,
                            last: Box::new(error),
                        });
                    }
                    let delay = backoff.next_delay();
                    warn!(route = %route, attempt = failures, delay_ms = delay.as_millis() as u64, error = %error, "REST transport failure, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = reply.status.as_u16();
            crate::metrics::record_rest_request(template, status, started.elapsed());
            let limits = RateLimitHeaders::parse(&reply.headers);
            debug!(route = %route, status, bucket = ?limits.bucket, remaining = ?limits.remaining, "REST response");

            if reply.status == StatusCode::TOO_MANY_REQUESTS {
                let limited = RateLimited::from_response(&limits, &reply.body);
                rate_limits += 1;
                crate::metrics::record_rate_limited(limited.global);

                if limited.global {
                    self.global.throttle(limited.retry_after);
                    self.registry.update(route, permit, &limits, false);
                } else {
                    self.registry.throttle(route, permit, &limits, limited.retry_after);
                }

                if limited.retry_after > self.settings.max_rate_limit
                    || rate_limits > self.settings.max_rate_limit_retries
                {
                    return Err(RestError::RateLimited {
                        route: route.to_string(),
                        retry_after: limited.retry_after,
                        global: limited.global,
                    });
                }
                warn!(
                    route = %route,
                    global = limited.global,
                    scope = ?limits.scope,
                    retry_after_ms = limited.retry_after.as_millis() as u64,
                    "Rate limited, waiting for retry"
                );
                continue;
            }

            self.registry.update(route, permit, &limits, reply.status.is_success());

            if reply.status.is_server_error() {
                failures += 1;
                if failures >= self.settings.max_attempts {
                    return Err(RestError::ServerError {
                        route: route.to_string(),
                        status,
                        body: String::from_utf8_lossy(&reply.body).into_owned(),
                        attempts: failures,
                    });
                }
                let delay = backoff.next_delay();
                warn!(route = %route, status, attempt = failures, delay_ms = delay.as_millis() as u64, "REST server error, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }

            if !reply.status.is_success() {
                return Err(RestError::ClientError {
                    route: route.to_string(),
                    status,
                    body: String::from_utf8_lossy(&reply.body).into_owned(),
                });
            }

            return Ok(RestResponse {
                route: route.to_string(),
                status,
                headers: reply.headers,
                body: reply.body,
            });
        }
    }

    async fn send(
        &self,
        route: &CompiledRoute,
        url: &Url,
        payload: &RequestPayload,
    ) -> Result<Reply, reqwest::Error> {
        let mut request = self.http.request(route.method().clone(), url.clone());
        if let Some(authorization) = &self.authorization {
            request = request.header(AUTHORIZATION, authorization.clone());
        }
        if let Some(reason) = &payload.reason {
            request = request.header(AUDIT_LOG_REASON, urlencoding(reason));
        }
        if let Some(body) = &payload.body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(Reply { status, headers, body })
    }

    fn url_for(&self, route: &CompiledRoute, payload: &RequestPayload) -> Result<Url, RestError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url.as_str().trim_end_matches('/'), route.path()))?;
        if !payload.query.is_empty() {
            url.query_pairs_mut().extend_pairs(payload.query.iter());
        }
        Ok(url)
    }

    /// Start bucket GC on first use, from inside the runtime.
    fn ensure_gc(&self) {
        let mut gc = self.gc.lock();
        if gc.is_none() && !self.shutdown.is_cancelled() {
            *gc = Some(self.registry.spawn_gc(
                self.settings.gc_period,
                self.settings.gc_expire_after,
                self.shutdown.child_token(),
            ));
        }
    }

    /// Stop background bucket GC.
    pub fn close(&self) {
        self.shutdown.cancel();
        if let Some(gc) = self.gc.lock().take() {
            gc.abort();
        }
        info!("REST executor closed");
    }

    pub fn settings(&self) -> &RestSettings {
        &self.settings
    }

    pub fn registry(&self) -> &BucketRegistry {
        &self.registry
    }

    pub fn global(&self) -> &GlobalThrottle {
        &self.global
    }

    /// Bucket state for a route, if one exists yet
    pub fn bucket(&self, route: &CompiledRoute) -> Option<BucketSnapshot> {
        self.registry.snapshot(route)
    }
}

impl Drop for RestExecutor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Percent-encode an audit log reason; header values must be visible ASCII.
fn urlencoding(reason: &str) -> String {
    url::form_urlencoded::byte_serialize(reason.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::route::{GET_CHANNEL_MESSAGES, GET_GATEWAY_BOT};

    fn executor(base_url: &str) -> RestExecutor {
        RestExecutor::new(
            RestSettings {
                base_url: base_url.to_string(),
                ..RestSettings::default()
            },
            Some(Token::new("secret")),
        )
        .unwrap()
    }

    #[test]
    fn url_joins_base_path_and_query() {
        let executor = executor("https://discord.test/api/v10/");
        let route = GET_CHANNEL_MESSAGES.compile(&[("channel_id", "42")]).unwrap();
        let url = executor
            .url_for(&route, &RequestPayload::default().query("limit", 50).query("before", "7"))
            .unwrap();
        assert_eq!(url.as_str(), "https://discord.test/api/v10/channels/42/messages?limit=50&before=7");

        let url = executor.url_for(&GET_GATEWAY_BOT.compile(&[]).unwrap(), &RequestPayload::default()).unwrap();
        assert_eq!(url.path(), "/api/v10/gateway/bot");
    }

    #[test]
    fn audit_reason_is_percent_encoded() {
        assert_eq!(urlencoding("spam & abuse"), "spam%20%26%20abuse");
        assert_eq!(urlencoding("ok"), "ok");
    }

    #[test]
    fn authorization_header_is_sensitive() {
        let executor = executor("https://discord.test/api/v10");
        let header = executor.authorization.as_ref().unwrap();
        assert!(header.is_sensitive());
        assert_eq!(header.to_str().unwrap(), "Bot secret");
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let result = RestExecutor::new(
            RestSettings {
                base_url: "not a url".to_string(),
                ..RestSettings::default()
            },
            None,
        );
        assert!(matches!(result, Err(RestError::InvalidUrl(_))));
    }
}
