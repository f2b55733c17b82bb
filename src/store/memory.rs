use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::{Arc, Mutex};

use super::{
  NewRequest, RecordStore, ReferralStatus, ReferralTracking, ReferralTrackingStats, RegisterStats, Request,
  StoreError, TxFn,
};

/// In-memory store mirroring the Postgres semantics closely enough for
/// service and rewarder tests. `in_tx` snapshots state and restores it when
/// the closure fails.
#[derive(Clone, Default)]
pub struct MemStore {
  state: Arc<Mutex<State>>,
}

#[derive(Clone, Default)]
struct State {
  requests: Vec<Request>,
  trackings: Vec<ReferralTracking>,
  fraud_domains: Vec<String>,
}

impl MemStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_fraud_domain(&self, domain: &str) {
    self.state.lock().unwrap().fraud_domains.push(domain.to_string());
  }

  pub fn backdate_request(&self, owner: &str, by: Duration) {
    let mut state = self.state.lock().unwrap();
    if let Some(r) = state.requests.iter_mut().find(|r| r.owner == owner) {
      r.created_at -= by;
    }
  }

  pub fn backdate_registration(&self, receiver: &str, by: Duration) {
    let mut state = self.state.lock().unwrap();
    if let Some(t) = state.trackings.iter_mut().find(|t| t.receiver == receiver) {
      t.registered_at -= by;
    }
  }

  pub fn backdate_installation(&self, receiver: &str, by: Duration) {
    let mut state = self.state.lock().unwrap();
    if let Some(t) = state.trackings.iter_mut().find(|t| t.receiver == receiver) {
      if let Some(at) = t.installed_at.as_mut() {
        *at -= by;
      }
    }
  }

  pub fn set_referral_banned(&self, address: &str, banned: bool) {
    let mut state = self.state.lock().unwrap();
    if let Some(r) = state.requests.iter_mut().find(|r| r.address == address) {
      r.referral_banned = banned;
    }
  }

  pub fn request(&self, address: &str) -> Option<Request> {
    self.state.lock().unwrap().requests.iter().find(|r| r.address == address).cloned()
  }

  pub fn tracking(&self, receiver: &str) -> Option<ReferralTracking> {
    self.state.lock().unwrap().trackings.iter().find(|t| t.receiver == receiver).cloned()
  }

  pub fn insert_request(&self, request: Request) {
    self.state.lock().unwrap().requests.push(request);
  }

  pub fn insert_tracking(&self, tracking: ReferralTracking) {
    self.state.lock().unwrap().trackings.push(tracking);
  }
}

#[async_trait]
impl RecordStore for MemStore {
  async fn get_request_by_owner(&self, owner: &str) -> Result<Request, StoreError> {
    self
      .state
      .lock()
      .unwrap()
      .requests
      .iter()
      .find(|r| r.owner == owner)
      .cloned()
      .ok_or(StoreError::NotFound)
  }

  async fn get_request_by_address(&self, address: &str) -> Result<Request, StoreError> {
    self
      .state
      .lock()
      .unwrap()
      .requests
      .iter()
      .find(|r| r.address == address)
      .cloned()
      .ok_or(StoreError::NotFound)
  }

  async fn get_request_by_referral_code(&self, code: &str) -> Result<Request, StoreError> {
    self
      .state
      .lock()
      .unwrap()
      .requests
      .iter()
      .find(|r| r.own_referral_code == code)
      .cloned()
      .ok_or(StoreError::ReferralCodeNotFound)
  }

  async fn upsert_request(&self, request: &NewRequest) -> Result<(), StoreError> {
    let mut state = self.state.lock().unwrap();
    let taken = state.requests.iter().any(|r| {
      r.email != request.email && (r.address == request.address || r.owner == request.owner)
    });
    if taken {
      return Err(StoreError::AddressTaken);
    }
    if let Some(existing) = state.requests.iter_mut().find(|r| r.email == request.email) {
      existing.address = request.address.clone();
      existing.code = request.code.clone();
      existing.created_at = Utc::now();
      existing.registration_referral_code = request.registration_referral_code.clone();
      return Ok(());
    }
    state.requests.push(Request {
      owner: request.owner.clone(),
      email: request.email.clone(),
      address: request.address.clone(),
      code: request.code.clone(),
      created_at: Utc::now(),
      confirmed_at: None,
      own_referral_code: request.own_referral_code.clone(),
      registration_referral_code: request.registration_referral_code.clone(),
      referral_banned: false,
    });
    Ok(())
  }

  async fn set_confirmed(&self, owner: &str) -> Result<(), StoreError> {
    let mut state = self.state.lock().unwrap();
    let request = state.requests.iter_mut().find(|r| r.owner == owner).ok_or(StoreError::NotFound)?;
    request.confirmed_at = Some(Utc::now());
    Ok(())
  }

  async fn create_referral_tracking(&self, receiver: &str, referral_code: &str) -> Result<(), StoreError> {
    let mut state = self.state.lock().unwrap();
    let sender = state
      .requests
      .iter()
      .find(|r| r.own_referral_code == referral_code && !r.referral_banned)
      .map(|r| r.address.clone())
      .ok_or(StoreError::ReferralCodeNotFound)?;
    if state.trackings.iter().any(|t| t.receiver == receiver) {
      return Err(StoreError::ReferralTrackingExists);
    }
    state.trackings.push(ReferralTracking {
      sender,
      receiver: receiver.to_string(),
      status: ReferralStatus::Registered,
      registered_at: Utc::now(),
      installed_at: None,
      confirmed_at: None,
      sender_reward: None,
      receiver_reward: None,
    });
    Ok(())
  }

  async fn get_referral_tracking_by_receiver(&self, receiver: &str) -> Result<ReferralTracking, StoreError> {
    self
      .state
      .lock()
      .unwrap()
      .trackings
      .iter()
      .find(|t| t.receiver == receiver)
      .cloned()
      .ok_or(StoreError::NotFound)
  }

  async fn transition_tracking_to_installed(&self, receiver: &str) -> Result<(), StoreError> {
    let mut state = self.state.lock().unwrap();
    let tracking = state
      .trackings
      .iter_mut()
      .find(|t| t.receiver == receiver && t.status == ReferralStatus::Registered)
      .ok_or(StoreError::NotFound)?;
    tracking.status = ReferralStatus::Installed;
    tracking.installed_at = Some(Utc::now());
    Ok(())
  }

  async fn transition_tracking_to_confirmed(
    &self,
    receiver: &str,
    sender_reward: i64,
    receiver_reward: i64,
  ) -> Result<(), StoreError> {
    let mut state = self.state.lock().unwrap();
    let tracking = state
      .trackings
      .iter_mut()
      .find(|t| t.receiver == receiver && t.status == ReferralStatus::Installed)
      .ok_or(StoreError::NotFound)?;
    tracking.status = ReferralStatus::Confirmed;
    tracking.confirmed_at = Some(Utc::now());
    tracking.sender_reward = Some(sender_reward);
    tracking.receiver_reward = Some(receiver_reward);
    Ok(())
  }

  async fn get_confirmed_referral_count(&self, sender: &str) -> Result<i64, StoreError> {
    let state = self.state.lock().unwrap();
    Ok(state
      .trackings
      .iter()
      .filter(|t| t.sender == sender && t.status == ReferralStatus::Confirmed)
      .count() as i64)
  }

  async fn get_installed_trackings_older_than(&self, days: u32) -> Result<Vec<ReferralTracking>, StoreError> {
    let state = self.state.lock().unwrap();
    let cutoff = Utc::now() - Duration::days(days as i64);
    let banned: Vec<&str> = state
      .requests
      .iter()
      .filter(|r| r.referral_banned)
      .map(|r| r.address.as_str())
      .collect();
    Ok(state
      .trackings
      .iter()
      .filter(|t| {
        t.status == ReferralStatus::Installed
          && t.installed_at.map_or(false, |at| at < cutoff)
          && !banned.contains(&t.sender.as_str())
      })
      .cloned()
      .collect())
  }

  async fn get_referral_tracking_stats(&self, sender: &str) -> Result<Vec<ReferralTrackingStats>, StoreError> {
    let state = self.state.lock().unwrap();
    let cutoff = Utc::now() - Duration::days(30);
    let mut out = Vec::with_capacity(2);
    for all_time in [true, false] {
      let mut stats = ReferralTrackingStats::default();
      for t in state.trackings.iter().filter(|t| t.sender == sender) {
        if !all_time && t.registered_at <= cutoff {
          continue;
        }
        match t.status {
          ReferralStatus::Registered => stats.registered += 1,
          ReferralStatus::Installed => stats.installed += 1,
          ReferralStatus::Confirmed => {
            stats.confirmed += 1;
            stats.reward += t.sender_reward.unwrap_or(0);
          }
        }
      }
      out.push(stats);
    }
    Ok(out)
  }

  async fn has_fraud_domain(&self, email: &str) -> Result<bool, StoreError> {
    let state = self.state.lock().unwrap();
    Ok(state.fraud_domains.iter().any(|domain| {
      email.ends_with(&format!("@{}", domain)) || email.ends_with(&format!(".{}", domain))
    }))
  }

  async fn get_confirmed_registrations_total(&self) -> Result<i64, StoreError> {
    let state = self.state.lock().unwrap();
    Ok(state.requests.iter().filter(|r| r.confirmed_at.is_some()).count() as i64)
  }

  async fn get_confirmed_registrations_stats(&self) -> Result<Vec<RegisterStats>, StoreError> {
    let state = self.state.lock().unwrap();
    let mut by_date: Vec<RegisterStats> = Vec::new();
    for r in &state.requests {
      let Some(at) = r.confirmed_at else { continue };
      let date = at.date_naive();
      match by_date.iter_mut().find(|s| s.date == date) {
        Some(entry) => entry.value += 1,
        None => by_date.push(RegisterStats { date, value: 1 }),
      }
    }
    by_date.sort_by_key(|s| s.date);
    Ok(by_date)
  }

  async fn in_tx(&self, f: TxFn) -> anyhow::Result<()> {
    let snapshot = self.state.lock().unwrap().clone();
    match f(self).await {
      Ok(()) => Ok(()),
      Err(err) => {
        *self.state.lock().unwrap() = snapshot;
        Err(err)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn in_tx_rolls_back_on_error() {
    let store = MemStore::new();
    store
      .upsert_request(&NewRequest {
        owner: "o".into(),
        email: "a@b.c".into(),
        address: "addr".into(),
        code: "123456".into(),
        own_referral_code: "ref1".into(),
        registration_referral_code: None,
      })
      .await
      .unwrap();

    let inner = store.clone();
    let res = inner
      .in_tx(Box::new(|s: &dyn RecordStore| {
        Box::pin(async move {
          s.set_confirmed("o").await?;
          anyhow::bail!("boom")
        })
      }))
      .await;
    assert!(res.is_err());
    assert!(store.request("addr").unwrap().confirmed_at.is_none());

    store
      .in_tx(Box::new(|s: &dyn RecordStore| Box::pin(async move { Ok(s.set_confirmed("o").await?) })))
      .await
      .unwrap();
    assert!(store.request("addr").unwrap().confirmed_at.is_some());
  }
}
