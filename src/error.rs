use crate::ledger::LedgerError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
  #[error("email or address is already taken")]
  AlreadyExists,
  #[error("request is already confirmed")]
  AlreadyConfirmed,
  #[error("request not found")]
  NotFound,
  #[error("too many attempts, try again later")]
  TooManyAttempts,
  #[error("referral code not found")]
  ReferralCodeNotFound,
  #[error("referral tracking not found")]
  TrackingNotFound,
  #[error("tracking status is installed or confirmed")]
  InvalidTrackingStatus,
  #[error("email domain is not allowed")]
  FraudEmail,
  #[error("store error: {0}")]
  Store(#[from] StoreError),
  #[error("ledger error: {0}")]
  Ledger(#[from] LedgerError),
}
