use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, RETRY_AFTER, USER_AGENT};
use tokio::sync::Semaphore;
use url::Url;

use crate::config::RetrievalConfig;
use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::protocol::{Action, Form};

/// Sends one form-encoded request to the comments endpoint and returns the
/// raw response body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_form(&self, action: Action, form: Form) -> Result<Bytes>;
}

#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    endpoint: Url,
    extra_query: Arc<Vec<(String, String)>>,
    user_agents: Arc<Vec<String>>,
    next_agent: Arc<AtomicUsize>,
    semaphore: Arc<Semaphore>,
    progress: Option<Arc<Progress>>,
}

impl Fetcher {
    pub fn new(config: &RetrievalConfig, progress: Option<Arc<Progress>>) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(config.request_timeout)
            .build()
            .context("build reqwest client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            extra_query: Arc::new(config.extra_query.clone()),
            user_agents: Arc::new(config.user_agents.clone()),
            next_agent: Arc::new(AtomicUsize::new(0)),
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            progress,
        })
    }

    fn user_agent(&self) -> Option<&str> {
        if self.user_agents.is_empty() {
            return None;
        }
        let n = self.next_agent.fetch_add(1, Ordering::Relaxed);
        Some(self.user_agents[n % self.user_agents.len()].as_str())
    }

    async fn send_with_backoff(
        &self,
        action: Action,
        form: &[(&'static str, String)],
    ) -> Result<Bytes> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| Error::network(action, format!("acquire request permit: {e}")))?;

        let mut backoff = Duration::from_millis(250);
        let max_attempts = 5usize;

        for attempt in 1..=max_attempts {
            let mut request = self
                .client
                .post(self.endpoint.clone())
                .query(self.extra_query.as_slice())
                .form(&form);
            if let Some(agent) = self.user_agent() {
                request = request.header(USER_AGENT, agent);
            }

            let resp = request
                .send()
                .await
                .map_err(|e| Error::network(action, format!("POST {}: {e}", self.endpoint)))?;

            let status = resp.status();
            let headers = resp.headers().clone();

            if status.is_success() {
                return resp
                    .bytes()
                    .await
                    .map_err(|e| Error::network(action, format!("read response body: {e}")));
            }

            if status.as_u16() == 429 || status.as_u16() == 503 {
                let wait = retry_after_duration(&headers).unwrap_or(backoff);
                tracing::warn!(
                    %status,
                    %action,
                    attempt,
                    wait_ms = wait.as_millis(),
                    "throttled; backing off"
                );
                if let Some(p) = &self.progress {
                    p.http_throttled(action, status.as_u16(), wait);
                }
                tokio::time::sleep(wait).await;
                backoff = (backoff * 2).min(Duration::from_secs(10));
                continue;
            }

            return Err(Error::network(
                action,
                format!("POST {} failed with status {}", self.endpoint, status),
            ));
        }

        Err(Error::network(
            action,
            format!("POST {} failed after retries", self.endpoint),
        ))
    }
}

#[async_trait]
impl Transport for Fetcher {
    async fn post_form(&self, action: Action, form: Form) -> Result<Bytes> {
        let mut body = Vec::with_capacity(form.len() + 1);
        body.push(("action", action.as_str().to_string()));
        body.extend(form);

        if let Some(p) = &self.progress {
            p.http_start(action);
        }
        tracing::debug!(%action, "request");

        let res = self.send_with_backoff(action, &body).await;
        if let Some(p) = &self.progress {
            match &res {
                Ok(bytes) => p.http_ok(action, bytes.len()),
                Err(_) => p.http_err(action),
            }
        }
        res
    }
}

fn retry_after_duration(headers: &HeaderMap) -> Option<Duration> {
    let v = headers.get(RETRY_AFTER)?;
    let s = v.to_str().ok()?.trim();
    let seconds: u64 = s.parse().ok()?;
    Some(Duration::from_secs(seconds))
}
