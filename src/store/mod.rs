pub mod postgres;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Request {
  pub owner: String,
  pub email: String,
  pub address: String,
  pub code: String,
  pub created_at: DateTime<Utc>,
  pub confirmed_at: Option<DateTime<Utc>>,
  pub own_referral_code: String,
  pub registration_referral_code: Option<String>,
  pub referral_banned: bool,
}

#[derive(Clone, Debug)]
pub struct NewRequest {
  pub owner: String,
  pub email: String,
  pub address: String,
  pub code: String,
  pub own_referral_code: String,
  pub registration_referral_code: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferralStatus {
  Registered,
  Installed,
  Confirmed,
}

impl ReferralStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      ReferralStatus::Registered => "registered",
      ReferralStatus::Installed => "installed",
      ReferralStatus::Confirmed => "confirmed",
    }
  }

  pub fn parse(raw: &str) -> Option<Self> {
    match raw {
      "registered" => Some(ReferralStatus::Registered),
      "installed" => Some(ReferralStatus::Installed),
      "confirmed" => Some(ReferralStatus::Confirmed),
      _ => None,
    }
  }
}

#[derive(Clone, Debug)]
pub struct ReferralTracking {
  pub sender: String,
  pub receiver: String,
  pub status: ReferralStatus,
  pub registered_at: DateTime<Utc>,
  pub installed_at: Option<DateTime<Utc>>,
  pub confirmed_at: Option<DateTime<Utc>>,
  pub sender_reward: Option<i64>,
  pub receiver_reward: Option<i64>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ReferralTrackingStats {
  pub registered: i64,
  pub installed: i64,
  pub confirmed: i64,
  pub reward: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RegisterStats {
  pub date: NaiveDate,
  pub value: i64,
}

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("not found")]
  NotFound,
  #[error("address is already taken")]
  AddressTaken,
  #[error("referral tracking already exists")]
  ReferralTrackingExists,
  #[error("referral code not found")]
  ReferralCodeNotFound,
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type TxFn = Box<dyn for<'a> FnOnce(&'a dyn RecordStore) -> BoxFuture<'a, anyhow::Result<()>> + Send>;

#[async_trait]
pub trait RecordStore: Send + Sync {
  async fn get_request_by_owner(&self, owner: &str) -> Result<Request, StoreError>;
  async fn get_request_by_address(&self, address: &str) -> Result<Request, StoreError>;
  async fn get_request_by_referral_code(&self, code: &str) -> Result<Request, StoreError>;
  async fn upsert_request(&self, request: &NewRequest) -> Result<(), StoreError>;
  async fn set_confirmed(&self, owner: &str) -> Result<(), StoreError>;

  async fn create_referral_tracking(&self, receiver: &str, referral_code: &str) -> Result<(), StoreError>;
  async fn get_referral_tracking_by_receiver(&self, receiver: &str) -> Result<ReferralTracking, StoreError>;
  async fn transition_tracking_to_installed(&self, receiver: &str) -> Result<(), StoreError>;
  async fn transition_tracking_to_confirmed(
    &self,
    receiver: &str,
    sender_reward: i64,
    receiver_reward: i64,
  ) -> Result<(), StoreError>;
  async fn get_confirmed_referral_count(&self, sender: &str) -> Result<i64, StoreError>;
  async fn get_installed_trackings_older_than(&self, days: u32) -> Result<Vec<ReferralTracking>, StoreError>;
  async fn get_referral_tracking_stats(&self, sender: &str) -> Result<Vec<ReferralTrackingStats>, StoreError>;

  async fn has_fraud_domain(&self, email: &str) -> Result<bool, StoreError>;

  async fn get_confirmed_registrations_total(&self) -> Result<i64, StoreError>;
  async fn get_confirmed_registrations_stats(&self) -> Result<Vec<RegisterStats>, StoreError>;

  async fn in_tx(&self, f: TxFn) -> anyhow::Result<()>;
}
