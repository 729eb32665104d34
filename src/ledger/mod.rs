// C1: Ledger Adapter. Typed read/write interface to the on-ledger escrow
// and registry contracts, plus event subscription (spec §4.1). All writes
// are signed with a single oracle key provisioned at startup; if it's
// absent, writes are disabled and every write call reports an
// availability error rather than attempting a signature with nothing.

pub mod events;

use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::domain::{AidRequest, FulfillerClass};
use crate::error::classify_reqwest_error;
use events::LedgerEvent;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger writes disabled: oracle signing key not provisioned")]
    WritesDisabled,
    #[error("ledger unavailable after retries: {0}")]
    Unavailable(String),
    #[error("ledger rejected transaction: {0}")]
    Reverted(String),
    #[error("request not found")]
    NotFound,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub tx_hash: String,
    pub block: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolStats {
    pub deposited: u64,
    pub escrowed: u64,
    pub paid_out: u64,
    pub available: u64,
}

const RETRY_DELAYS: [Duration; 3] = [Duration::from_millis(500), Duration::from_secs(2), Duration::from_secs(8)];

pub struct HttpLedgerAdapter {
    http: reqwest::Client,
    base_url: String,
    oracle_key: Option<SigningKey>,
    rpc_timeout: Duration,
}

impl HttpLedgerAdapter {
    pub fn new(base_url: String, oracle_key: Option<[u8; 32]>, rpc_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder().timeout(rpc_timeout).build().expect("http client"),
            base_url,
            oracle_key: oracle_key.map(|bytes| SigningKey::from_bytes(&bytes)),
            rpc_timeout,
        }
    }

    fn require_oracle_key(&self) -> Result<&SigningKey, LedgerError> {
        self.oracle_key.as_ref().ok_or(LedgerError::WritesDisabled)
    }

    // ---- reads ----

    pub async fn get_request(&self, id: u64) -> Result<AidRequest, LedgerError> {
        self.retry_read(|| self.http.get(format!("{}/requests/{id}", self.base_url)).send()).await
    }

    pub async fn get_user_requests(&self, addr: &str) -> Result<Vec<u64>, LedgerError> {
        self.retry_read(|| self.http.get(format!("{}/requests/user/{addr}", self.base_url)).send()).await
    }

    pub async fn get_request_count(&self) -> Result<u64, LedgerError> {
        self.retry_read(|| self.http.get(format!("{}/requests/count", self.base_url)).send()).await
    }

    pub async fn is_identity_verified(&self, addr: &str) -> Result<bool, LedgerError> {
        self.retry_read(|| self.http.get(format!("{}/identity/{addr}/verified", self.base_url)).send()).await
    }

    pub async fn get_pool_stats(&self) -> Result<PoolStats, LedgerError> {
        self.retry_read(|| self.http.get(format!("{}/pool/stats", self.base_url)).send()).await
    }

    /// Resolved from the ledger's approved-fulfiller set (Open Question
    /// resolution in DESIGN.md — production reads this from chain, not a
    /// hard-coded in-process registry).
    pub async fn get_approved_fulfillers(&self) -> Result<Vec<(FulfillerClass, String)>, LedgerError> {
        #[derive(Deserialize)]
        struct Entry {
            class: u8,
            address: String,
        }
        let entries: Vec<Entry> =
            self.retry_read(|| self.http.get(format!("{}/fulfillers/approved", self.base_url)).send()).await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| Some((FulfillerClass::from_wire(e.class)?, e.address)))
            .collect())
    }

    // ---- writes ----

    #[instrument(skip(self))]
    pub async fn submit_verification(&self, request_id: u64, gnss_digest: [u8; 32], event_digest: [u8; 32]) -> Result<WriteReceipt, LedgerError> {
        #[derive(Serialize)]
        struct Body {
            request_id: u64,
            gnss_digest: String,
            event_digest: String,
        }
        let body = Body {
            request_id,
            gnss_digest: crate::digest::hex_encode(&gnss_digest),
            event_digest: crate::digest::hex_encode(&event_digest),
        };
        self.signed_write("verify", &body).await
    }

    #[instrument(skip(self))]
    pub async fn submit_consensus(
        &self,
        request_id: u64,
        approved: bool,
        consensus_digest: [u8; 32],
        chosen_aid_class: Option<u8>,
        chosen_fulfiller_class: Option<u8>,
        cost: Option<u64>,
        node_count: usize,
        approval_count: usize,
    ) -> Result<WriteReceipt, LedgerError> {
        #[derive(Serialize)]
        struct Body {
            request_id: u64,
            approved: bool,
            consensus_digest: String,
            chosen_aid_class: Option<u8>,
            chosen_fulfiller_class: Option<u8>,
            cost: Option<u64>,
            node_count: usize,
            approval_count: usize,
        }
        let body = Body {
            request_id,
            approved,
            consensus_digest: crate::digest::hex_encode(&consensus_digest),
            chosen_aid_class,
            chosen_fulfiller_class,
            cost,
            node_count,
            approval_count,
        };
        self.signed_write("consensus", &body).await
    }

    #[instrument(skip(self))]
    pub async fn assign_fulfiller(&self, request_id: u64, fulfiller_address: &str, escrow_amount: u64) -> Result<WriteReceipt, LedgerError> {
        #[derive(Serialize)]
        struct Body<'a> {
            request_id: u64,
            fulfiller_address: &'a str,
            escrow_amount: u64,
        }
        self.signed_write("assign_fulfiller", &Body { request_id, fulfiller_address, escrow_amount }).await
    }

    #[instrument(skip(self))]
    pub async fn verify_delivery(&self, request_id: u64, verification_digest: [u8; 32], verified: bool) -> Result<WriteReceipt, LedgerError> {
        #[derive(Serialize)]
        struct Body {
            request_id: u64,
            verification_digest: String,
            verified: bool,
        }
        let body = Body { request_id, verification_digest: crate::digest::hex_encode(&verification_digest), verified };
        self.signed_write("verify_delivery", &body).await
    }

    #[instrument(skip(self))]
    pub async fn release_payout(&self, request_id: u64) -> Result<WriteReceipt, LedgerError> {
        #[derive(Serialize)]
        struct Body {
            request_id: u64,
        }
        self.signed_write("release_payout", &Body { request_id }).await
    }

    #[instrument(skip(self))]
    pub async fn timeout_request(&self, request_id: u64) -> Result<WriteReceipt, LedgerError> {
        #[derive(Serialize)]
        struct Body {
            request_id: u64,
        }
        self.signed_write("timeout", &Body { request_id }).await
    }

    async fn signed_write<B: Serialize>(&self, op: &str, body: &B) -> Result<WriteReceipt, LedgerError> {
        let key = self.require_oracle_key()?;
        let payload = serde_json::to_vec(body).map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        let signature = key.sign(&payload);

        self.retry(|| {
            self.http
                .post(format!("{}/tx/{op}", self.base_url))
                .header("X-Oracle-Signature", crate::digest::hex_encode(&signature.to_bytes()))
                .body(payload.clone())
                .send()
        })
        .await
    }

    /// Bounded exponential backoff: 3 attempts, 500ms → 2s → 8s (spec
    /// §4.1). Non-transient failures (HTTP 4xx/revert) surface immediately.
    async fn retry<F, Fut, T>(&self, mut make_request: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
        T: serde::de::DeserializeOwned,
    {
        let mut last_err = String::new();
        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(RETRY_DELAYS).enumerate() {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match make_request().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp.json::<T>().await.map_err(|e| LedgerError::Unavailable(e.to_string()));
                }
                Ok(resp) if resp.status().is_client_error() => {
                    return Err(LedgerError::Reverted(format!("HTTP {}", resp.status())));
                }
                Ok(resp) => {
                    last_err = format!("HTTP {}", resp.status());
                    warn!(attempt, status = %resp.status(), "ledger_write_transient_failure");
                }
                Err(e) if classify_reqwest_error(&e) => {
                    last_err = e.to_string();
                    warn!(attempt, error = %e, "ledger_write_transient_failure");
                }
                Err(e) => return Err(LedgerError::Reverted(e.to_string())),
            }
        }
        Err(LedgerError::Unavailable(last_err))
    }

    async fn retry_read<F, Fut, T>(&self, make_request: F) -> Result<T, LedgerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
        T: serde::de::DeserializeOwned,
    {
        self.retry(make_request).await
    }

    /// Polls `[last_seen_block+1, current_block]` for typed events,
    /// persisting the cursor after each successful batch so a restart
    /// backfills from where it left off (spec §4.1).
    pub async fn poll_events(&self, cursor_path: String, poll_interval: Duration, on_event: impl Fn(LedgerEvent) + Send + Sync + 'static) {
        let mut cursor = events::load_cursor(&cursor_path);
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            interval.tick().await;
            match self.fetch_events_since(cursor).await {
                Ok((new_events, head)) => {
                    for event in new_events {
                        on_event(event);
                    }
                    if head > cursor {
                        cursor = head;
                        if let Err(e) = events::save_cursor(&cursor_path, cursor) {
                            warn!(error = %e, "cursor_persist_failed");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "ledger_poll_failed"),
            }
        }
    }

    async fn fetch_events_since(&self, cursor: u64) -> Result<(Vec<LedgerEvent>, u64), LedgerError> {
        #[derive(Deserialize)]
        struct Page {
            events: Vec<LedgerEvent>,
            head_block: u64,
        }
        let page: Page = self
            .retry_read(|| self.http.get(format!("{}/events?from={}", self.base_url, cursor + 1)).send())
            .await?;
        info!(from = cursor + 1, to = page.head_block, count = page.events.len(), "ledger_events_polled");
        Ok((page.events, page.head_block))
    }
}
