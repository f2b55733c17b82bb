use chrono::{Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{info, warn};

use crate::error::ServiceError;
use crate::ledger::{Ledger, Stake};
use crate::mail::Notifier;
use crate::store::{
  NewRequest, RecordStore, ReferralStatus, ReferralTrackingStats, RegisterStats, Request, StoreError,
};

const CODE_BYTES: usize = 3;
const REFERRAL_CODE_LEN: usize = 8;
const RESEND_THROTTLE_SECS: i64 = 60;

pub struct Service<S, L, N> {
  store: S,
  ledger: L,
  notifier: N,
  initial_stakes: i64,
  initial_memo: String,
}

impl<S, L, N> Service<S, L, N>
where
  S: RecordStore,
  L: Ledger,
  N: Notifier,
{
  pub fn new(store: S, ledger: L, notifier: N, initial_stakes: i64, initial_memo: String) -> Self {
    Self { store, ledger, notifier, initial_stakes, initial_memo }
  }

  pub async fn register(
    &self,
    email: &str,
    address: &str,
    referral_code: Option<&str>,
  ) -> Result<(), ServiceError> {
    let owner = owner_hash(email);
    self.check_conflicts(email, address, &owner).await?;

    if self.store.has_fraud_domain(&email.to_lowercase()).await? {
      warn!("registration rejected for fraud domain address={}", address);
      return Err(ServiceError::FraudEmail);
    }

    if let Some(code) = referral_code {
      match self.store.get_request_by_referral_code(code).await {
        Ok(referrer) if referrer.referral_banned => {
          warn!("registration with banned referrer code={}", code);
          return Err(ServiceError::ReferralCodeNotFound);
        }
        Ok(_) => {}
        Err(StoreError::ReferralCodeNotFound) => return Err(ServiceError::ReferralCodeNotFound),
        Err(err) => return Err(err.into()),
      }
    }

    let code = random_code();
    let request = NewRequest {
      owner,
      email: email.to_string(),
      address: address.to_string(),
      code: code.clone(),
      own_referral_code: generate_referral_code(),
      registration_referral_code: referral_code.map(str::to_string),
    };
    match self.store.upsert_request(&request).await {
      Ok(()) => {}
      Err(StoreError::AddressTaken) => return Err(ServiceError::AlreadyExists),
      Err(err) => return Err(err.into()),
    }

    self.notifier.send_verification_code(email, &code);
    info!("registration requested address={}", address);
    Ok(())
  }

  async fn check_conflicts(&self, email: &str, address: &str, owner: &str) -> Result<(), ServiceError> {
    let existing = match self.store.get_request_by_address(address).await {
      Ok(r) => Some(r),
      Err(StoreError::NotFound) => match self.store.get_request_by_owner(owner).await {
        Ok(r) => Some(r),
        Err(StoreError::NotFound) => None,
        Err(err) => return Err(err.into()),
      },
      Err(err) => return Err(err.into()),
    };
    let Some(existing) = existing else { return Ok(()) };
    if existing.email != email {
      return Err(ServiceError::AlreadyExists);
    }
    if existing.confirmed_at.is_some() {
      return Err(ServiceError::AlreadyConfirmed);
    }
    if existing.created_at + Duration::seconds(RESEND_THROTTLE_SECS) > Utc::now() {
      return Err(ServiceError::TooManyAttempts);
    }
    Ok(())
  }

  pub async fn confirm(&self, email: &str, code: &str) -> Result<(), ServiceError> {
    let owner = owner_hash(email);
    let request = match self.store.get_request_by_owner(&owner).await {
      Ok(r) => r,
      Err(StoreError::NotFound) => return Err(ServiceError::NotFound),
      Err(err) => return Err(err.into()),
    };
    if request.confirmed_at.is_some() {
      return Err(ServiceError::AlreadyConfirmed);
    }
    if request.code != code {
      return Err(ServiceError::NotFound);
    }

    let stakes = [Stake { address: request.address.clone(), amount: self.initial_stakes }];
    self.ledger.transfer_stakes(&stakes, &self.initial_memo).await?;

    self.store.set_confirmed(&owner).await?;
    self.notifier.send_welcome(&request.email);

    if let Some(referral_code) = &request.registration_referral_code {
      match self.store.create_referral_tracking(&request.address, referral_code).await {
        Ok(()) => info!("referral tracking created receiver={}", request.address),
        Err(StoreError::ReferralTrackingExists) => {
          warn!("referral tracking already exists receiver={}", request.address)
        }
        Err(StoreError::ReferralCodeNotFound) => {
          warn!("referral code no longer valid code={}", referral_code)
        }
        Err(err) => return Err(err.into()),
      }
    }

    info!("registration confirmed address={}", request.address);
    Ok(())
  }

  pub async fn track_installation(&self, address: &str) -> Result<(), ServiceError> {
    let tracking = match self.store.get_referral_tracking_by_receiver(address).await {
      Ok(t) => t,
      Err(StoreError::NotFound) => return Err(ServiceError::TrackingNotFound),
      Err(err) => return Err(err.into()),
    };
    if tracking.status != ReferralStatus::Registered {
      return Err(ServiceError::InvalidTrackingStatus);
    }
    self.store.transition_tracking_to_installed(address).await?;
    info!("installation tracked receiver={}", address);
    Ok(())
  }

  pub async fn own_referral_code(&self, address: &str) -> Result<String, ServiceError> {
    let request = self.request_by_address(address).await?;
    Ok(request.own_referral_code)
  }

  pub async fn registration_referral_code(&self, address: &str) -> Result<String, ServiceError> {
    let request = self.request_by_address(address).await?;
    request.registration_referral_code.ok_or(ServiceError::NotFound)
  }

  pub async fn referral_tracking_stats(&self, address: &str) -> Result<Vec<ReferralTrackingStats>, ServiceError> {
    self.request_by_address(address).await?;
    Ok(self.store.get_referral_tracking_stats(address).await?)
  }

  pub async fn register_stats(&self) -> Result<(i64, Vec<RegisterStats>), ServiceError> {
    let total = self.store.get_confirmed_registrations_total().await?;
    let mut stats = self.store.get_confirmed_registrations_stats().await?;
    transform_stats_as_growth(&mut stats, total);
    Ok((total, stats))
  }

  async fn request_by_address(&self, address: &str) -> Result<Request, ServiceError> {
    match self.store.get_request_by_address(address).await {
      Ok(r) => Ok(r),
      Err(StoreError::NotFound) => Err(ServiceError::NotFound),
      Err(err) => Err(err.into()),
    }
  }
}

/// Per-day confirmation counts become cumulative totals, newest day equal to
/// the all-time total.
fn transform_stats_as_growth(stats: &mut [RegisterStats], mut total: i64) {
  for entry in stats.iter_mut().rev() {
    let value = entry.value;
    entry.value = total;
    total -= value;
  }
}

/// Lowercases the address and strips `+suffix` tagging from the local part,
/// so tagged variants of one mailbox hash to the same owner.
pub fn normalize_email(email: &str) -> String {
  let email = email.trim().to_lowercase();
  match email.split_once('@') {
    Some((local, domain)) => {
      let local = local.split('+').next().unwrap_or(local);
      format!("{}@{}", local, domain)
    }
    None => email,
  }
}

pub fn owner_hash(email: &str) -> String {
  let digest = blake3::hash(normalize_email(email).as_bytes());
  hex::encode(digest.as_bytes())
}

fn random_code() -> String {
  let mut bytes = [0u8; CODE_BYTES];
  rand::thread_rng().fill(&mut bytes);
  hex::encode(bytes)
}

fn generate_referral_code() -> String {
  rand::thread_rng()
    .sample_iter(&Alphanumeric)
    .take(REFERRAL_CODE_LEN)
    .map(char::from)
    .collect()
}
