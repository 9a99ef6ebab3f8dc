//! Delivery of heartbeats to the ingestion API.
//!
//! A transport never fails as a whole: every heartbeat handed to
//! [`Transport::send`] comes back as exactly one [`Outcome`], in order.
//! Whole-request failures are spread over the batch as per-heartbeat
//! outcomes so queueing decisions stay uniform.

use crate::adapters::credentials::ApiKeyResolver;
use crate::core::heartbeat::Heartbeat;
use crate::core::pipeline::{DeliveryError, DeliveryErrorKind, DeliveryStatus, Outcome};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;

/// Maximum heartbeats per bulk request.
pub const MAX_BULK_SIZE: usize = 25;

/// Delivery collaborator.
pub trait Transport: Send + Sync {
    /// Sends `heartbeats`, returning one outcome per heartbeat in order.
    fn send(&self, heartbeats: &[Heartbeat]) -> Vec<Outcome>;
}

/// Maps HTTP status codes to delivery statuses.
///
/// 2xx is delivered. Codes in the rejected set are permanent refusals and
/// are never retried. Everything else is retried on the next resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPolicy {
    rejected: BTreeSet<u16>,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self::new([400, 413, 422])
    }
}

impl StatusPolicy {
    #[must_use]
    pub fn new(rejected: impl IntoIterator<Item = u16>) -> Self {
        Self {
            rejected: rejected.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn classify(&self, status: u16) -> DeliveryStatus {
        if (200..300).contains(&status) {
            DeliveryStatus::Sent
        } else if self.rejected.contains(&status) {
            DeliveryStatus::Rejected
        } else {
            DeliveryStatus::TransportFailed
        }
    }

    fn outcome(&self, heartbeat: Heartbeat, status: u16, message: impl Into<String>) -> Outcome {
        match self.classify(status) {
            DeliveryStatus::Sent => Outcome::sent(heartbeat),
            DeliveryStatus::Rejected => Outcome::rejected(
                heartbeat,
                DeliveryError::new(DeliveryErrorKind::Rejected, message).with_status(status),
            ),
            _ => Outcome::transport_failed(
                heartbeat,
                DeliveryError::new(DeliveryErrorKind::Transport, message).with_status(status),
            ),
        }
    }
}

/// Settings for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub api_url: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub policy: StatusPolicy,
}

/// Body of a bulk response: one `[body, status]` pair per heartbeat.
#[derive(Debug, Deserialize)]
struct BulkResponse {
    responses: Vec<(serde_json::Value, u16)>,
}

/// Blocking HTTP transport posting to `{api_url}/users/current/heartbeats.bulk`.
pub struct HttpTransport {
    agent: ureq::Agent,
    config: HttpTransportConfig,
    credentials: ApiKeyResolver,
}

impl HttpTransport {
    #[must_use]
    pub fn new(config: HttpTransportConfig, credentials: ApiKeyResolver) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self {
            agent,
            config,
            credentials,
        }
    }

    fn bulk_url(&self) -> String {
        format!(
            "{}/users/current/heartbeats.bulk",
            self.config.api_url.trim_end_matches('/')
        )
    }

    /// Key attached upstream, or the resolver's choice for heartbeats queued
    /// without one.
    fn key_for<'a>(&'a self, heartbeat: &'a Heartbeat) -> Option<&'a str> {
        heartbeat
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.credentials.key_for(heartbeat))
    }

    fn post_chunk(&self, api_key: &str, chunk: &[Heartbeat]) -> Vec<Outcome> {
        let url = self.bulk_url();
        let span = tracing::debug_span!("bulk_request", count = chunk.len());
        let _entered = span.enter();

        let body: Vec<Heartbeat> = chunk.iter().map(Heartbeat::without_api_key).collect();
        let response = self
            .agent
            .post(&url)
            .set("Accept", "application/json")
            .set("Authorization", &format!("Bearer {api_key}"))
            .set("User-Agent", &self.config.user_agent)
            .send_json(&body);

        match response {
            Ok(response) => {
                let status = response.status();
                match response.into_json::<BulkResponse>() {
                    Ok(body) => self.per_item_outcomes(chunk, &body),
                    Err(err) => {
                        tracing::warn!(status, error = %err, "unparsable bulk response");
                        let error = DeliveryError::new(
                            DeliveryErrorKind::Transport,
                            format!("unparsable response: {err}"),
                        )
                        .with_status(status);
                        Outcome::all_transport_failed(chunk.to_vec(), &error)
                    }
                }
            }
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                tracing::warn!(status, body = %truncate(&body, 200), "bulk request refused");
                let message = format!("api responded with status {status}");
                chunk
                    .iter()
                    .cloned()
                    .map(|h| self.config.policy.outcome(h, status, message.clone()))
                    .collect()
            }
            Err(ureq::Error::Transport(err)) => {
                tracing::warn!(error = %err, "bulk request failed");
                let error = DeliveryError::new(DeliveryErrorKind::Transport, err.to_string());
                Outcome::all_transport_failed(chunk.to_vec(), &error)
            }
        }
    }

    fn per_item_outcomes(&self, chunk: &[Heartbeat], body: &BulkResponse) -> Vec<Outcome> {
        if body.responses.len() != chunk.len() {
            tracing::warn!(
                expected = chunk.len(),
                actual = body.responses.len(),
                "bulk response length mismatch"
            );
        }
        chunk
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, heartbeat)| match body.responses.get(i) {
                Some((item, status)) => {
                    let message = item
                        .get("error")
                        .and_then(serde_json::Value::as_str)
                        .map_or_else(|| format!("status {status}"), ToString::to_string);
                    self.config.policy.outcome(heartbeat, *status, message)
                }
                None => Outcome::transport_failed(
                    heartbeat,
                    DeliveryError::new(DeliveryErrorKind::Transport, "missing item in response"),
                ),
            })
            .collect()
    }
}

impl Transport for HttpTransport {
    fn send(&self, heartbeats: &[Heartbeat]) -> Vec<Outcome> {
        let mut slots: Vec<Option<Outcome>> = vec![None; heartbeats.len()];

        // Group positions by credential, keeping first-seen order.
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (idx, heartbeat) in heartbeats.iter().enumerate() {
            match self.key_for(heartbeat) {
                Some(key) => match groups.iter_mut().find(|(k, _)| k.as_str() == key) {
                    Some((_, positions)) => positions.push(idx),
                    None => groups.push((key.to_string(), vec![idx])),
                },
                None => {
                    slots[idx] = Some(Outcome::transport_failed(
                        heartbeat.clone(),
                        DeliveryError::new(DeliveryErrorKind::Transport, "no api key configured"),
                    ));
                }
            }
        }

        for (key, positions) in groups {
            for chunk_positions in positions.chunks(MAX_BULK_SIZE) {
                let chunk: Vec<Heartbeat> = chunk_positions
                    .iter()
                    .map(|&i| heartbeats[i].clone())
                    .collect();
                let outcomes = self.post_chunk(&key, &chunk);
                for (&idx, outcome) in chunk_positions.iter().zip(outcomes) {
                    slots[idx] = Some(outcome);
                }
            }
        }

        slots
            .into_iter()
            .zip(heartbeats)
            .map(|(slot, heartbeat)| {
                slot.unwrap_or_else(|| {
                    Outcome::transport_failed(
                        heartbeat.clone(),
                        DeliveryError::new(DeliveryErrorKind::Transport, "not sent"),
                    )
                })
            })
            .collect()
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
