use std::future::Future;
use std::io::Write;
use std::pin::Pin;

use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};

use lpcache_api::batch::Batch;
use lpcache_api::delivery::{DeliveryClient, Outcome};
use lpcache_api::error::CacheError;

use crate::config::InfluxDbConfig;

/// Longest slice of an error response body kept in an outcome reason.
const MAX_REASON_BODY: usize = 512;

/// InfluxDB v2 write API client.
///
/// One `deliver` is one `POST /api/v2/write` carrying the whole batch.
/// The request either completes or times out; it is never abandoned
/// half-way by the caller.
pub struct InfluxDbClient {
    http: reqwest::Client,
    name: String,
    write_url: String,
    org: String,
    bucket: String,
    token: String,
    precision: &'static str,
    gzip: bool,
}

impl InfluxDbClient {
    pub fn new(config: &InfluxDbConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .build()
            .map_err(|e| CacheError::config(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            name: config.display_name(),
            write_url: write_url(&config.url),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
            precision: config.precision.as_str(),
            gzip: config.gzip,
        })
    }

    fn encode(&self, batch: &Batch) -> std::io::Result<Vec<u8>> {
        let body = batch.to_body();
        if !self.gzip {
            return Ok(body);
        }
        let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 4), Compression::default());
        encoder.write_all(&body)?;
        encoder.finish()
    }

    async fn send(&self, batch: &Batch) -> Outcome {
        let body = match self.encode(batch) {
            Ok(body) => body,
            Err(e) => return Outcome::RejectedTransient(format!("gzip: {e}")),
        };

        let mut request = self
            .http
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", self.precision),
            ])
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(ACCEPT, "application/json");
        if !self.token.is_empty() {
            request = request.header(AUTHORIZATION, format!("Token {}", self.token));
        }
        if self.gzip {
            request = request.header(CONTENT_ENCODING, "gzip");
        }

        let response = match request.body(body).send().await {
            Ok(response) => response,
            Err(e) => return Outcome::NetworkFailure(describe(&e)),
        };

        let status = response.status();
        if status.is_success() {
            return Outcome::Accepted;
        }
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return Outcome::NetworkFailure(format!("{status}: reading response: {}", describe(&e))),
        };
        classify_status(status, &text)
    }
}

impl DeliveryClient for InfluxDbClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver<'a>(&'a self, batch: &'a Batch) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let outcome = self.send(batch).await;
            tracing::debug!(
                destination = %self.name,
                first_offset = batch.first_offset(),
                records = batch.len(),
                bytes = batch.byte_size(),
                outcome = outcome.label(),
                "write attempt finished"
            );
            outcome
        })
    }
}

/// Map a non-network response to an outcome.
///
/// Only statuses that blame the payload are permanent. Authentication and
/// missing bucket/org errors are configuration problems that an operator
/// can fix without losing the batch, so they stay transient.
pub fn classify_status(status: StatusCode, body: &str) -> Outcome {
    if status.is_success() {
        return Outcome::Accepted;
    }

    let reason = format!("{status}: {}", truncate(body.trim(), MAX_REASON_BODY));
    match status.as_u16() {
        400 | 413 | 422 => Outcome::RejectedPermanent(reason),
        401 | 403 | 404 => Outcome::RejectedTransient(format!("{reason} (check token, org and bucket)")),
        _ => Outcome::RejectedTransient(reason),
    }
}

fn write_url(base: &str) -> String {
    format!("{}/api/v2/write", base.trim_end_matches('/'))
}

fn describe(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("timeout: {e}")
    } else if e.is_connect() {
        format!("connect: {e}")
    } else {
        e.to_string()
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
