use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

#[derive(Clone, Debug, Serialize)]
pub struct Stake {
  pub address: String,
  pub amount: i64,
}

#[derive(Debug, Error)]
pub enum LedgerError {
  #[error("transient ledger error: {0}")]
  Transient(String),
  #[error("ledger rejected request: {0}")]
  Permanent(String),
}

impl LedgerError {
  pub fn is_transient(&self) -> bool {
    matches!(self, LedgerError::Transient(_))
  }
}

#[async_trait]
pub trait Ledger: Send + Sync {
  async fn transfer_stakes(&self, transfers: &[Stake], memo: &str) -> Result<(), LedgerError>;
}

#[async_trait]
pub trait BalanceQuery: Send + Sync {
  /// Micro-unit balance net of the initial onboarding grant.
  async fn get_balance(&self, address: &str) -> Result<i64, LedgerError>;
}

#[derive(Serialize)]
struct TransferRequest<'a> {
  transfers: &'a [Stake],
  memo: &'a str,
}

/// Broadcasts transfers through the ledger node's REST endpoint. Transient
/// failures are retried in place with capped exponential backoff.
#[derive(Clone)]
pub struct BroadcastClient {
  client: reqwest::Client,
  node_url: String,
}

impl BroadcastClient {
  pub fn new(node_url: String, timeout_ms: u64) -> Self {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_millis(timeout_ms))
      .build()
      .expect("client build");
    Self { client, node_url }
  }
}

#[async_trait]
impl Ledger for BroadcastClient {
  async fn transfer_stakes(&self, transfers: &[Stake], memo: &str) -> Result<(), LedgerError> {
    let mut attempt = 0u32;
    loop {
      let res = self.client.post(&self.node_url)
        .json(&TransferRequest { transfers, memo })
        .send()
        .await;
      match res {
        Ok(resp) if resp.status().is_success() => return Ok(()),
        Ok(resp) if resp.status().is_client_error() && resp.status() != StatusCode::TOO_MANY_REQUESTS => {
          let status = resp.status();
          let body = resp.text().await.unwrap_or_default();
          return Err(LedgerError::Permanent(format!("status={} body={}", status, body)));
        }
        Ok(resp) => {
          let status = resp.status();
          warn!("transfer broadcast failed status={} memo={}", status, memo);
          if attempt >= 5 {
            return Err(LedgerError::Transient(format!("status={}", status)));
          }
          sleep(Duration::from_millis(backoff_ms(attempt))).await;
        }
        Err(err) => {
          warn!("transfer broadcast error: {}", err);
          if attempt >= 5 {
            return Err(LedgerError::Transient(err.to_string()));
          }
          sleep(Duration::from_millis(backoff_ms(attempt))).await;
        }
      }
      attempt += 1;
    }
  }
}

#[derive(Deserialize)]
struct TokenBalance {
  balance: String,
}

#[derive(Deserialize)]
struct TokenResponse {
  result: TokenBalance,
}

/// Queries an account's token balance from the ledger REST gateway.
#[derive(Clone)]
pub struct BalanceClient {
  client: reqwest::Client,
  rest_url: String,
}

impl BalanceClient {
  pub fn new(rest_url: String, timeout_ms: u64) -> Self {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_millis(timeout_ms))
      .build()
      .expect("client build");
    Self { client, rest_url }
  }
}

#[async_trait]
impl BalanceQuery for BalanceClient {
  async fn get_balance(&self, address: &str) -> Result<i64, LedgerError> {
    let url = format!("{}/token/balance/{}", self.rest_url.trim_end_matches('/'), address);
    let resp = self.client.get(&url)
      .send()
      .await
      .map_err(|err| LedgerError::Transient(err.to_string()))?;
    if !resp.status().is_success() {
      let status = resp.status();
      if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        return Err(LedgerError::Permanent(format!("status={}", status)));
      }
      return Err(LedgerError::Transient(format!("status={}", status)));
    }
    let body: TokenResponse = resp.json().await.map_err(|err| LedgerError::Transient(err.to_string()))?;
    balance_in_micro(&body.result.balance)
  }
}

/// The node reports a decimal token balance that includes the initial 1-token
/// grant. Convert to micro units net of that grant.
pub fn balance_in_micro(raw: &str) -> Result<i64, LedgerError> {
  let tokens: f64 = raw.trim().parse()
    .map_err(|_| LedgerError::Permanent(format!("bad balance value: {}", raw)))?;
  Ok(((tokens - 1.0) * 1e6).round() as i64)
}

fn backoff_ms(attempt: u32) -> u64 {
  let base = 500u64;
  let max = 30_000u64;
  let pow = 2u64.saturating_pow(attempt.min(6));
  (base * pow).min(max)
}
