use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::ledger::{BalanceQuery, Ledger, Stake};
use crate::referral::ReferralConfig;
use crate::store::{RecordStore, ReferralTracking};

/// Background reconciliation of installed referrals. Runs one cycle
/// immediately, then once per interval until shutdown is signalled; an
/// in-flight cycle always finishes.
pub struct Rewarder<S, L, B> {
  store: S,
  ledger: L,
  balance: B,
  config: ReferralConfig,
  interval: Duration,
}

impl<S, L, B> Rewarder<S, L, B>
where
  S: RecordStore,
  L: Ledger + Clone + 'static,
  B: BalanceQuery,
{
  pub fn new(store: S, ledger: L, balance: B, config: ReferralConfig, interval: Duration) -> Self {
    Self { store, ledger, balance, config, interval }
  }

  pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
    loop {
      self.cycle().await;
      tokio::select! {
        _ = sleep(self.interval) => {}
        _ = shutdown.changed() => {
          info!("rewarder stopping");
          return;
        }
      }
    }
  }

  pub async fn cycle(&self) {
    let candidates = match self.store.get_installed_trackings_older_than(self.config.dwell_days()).await {
      Ok(candidates) => candidates,
      Err(err) => {
        error!("failed to fetch reward candidates: {}", err);
        return;
      }
    };
    info!("reward cycle candidates={}", candidates.len());
    for tracking in candidates {
      if let Err(err) = self.process(&tracking).await {
        warn!("skipping candidate receiver={}: {}", tracking.receiver, err);
      }
    }
  }

  async fn process(&self, tracking: &ReferralTracking) -> anyhow::Result<()> {
    let balance = self.balance.get_balance(&tracking.receiver).await?;
    if balance <= self.config.threshold() {
      debug!("receiver below threshold receiver={} balance={}", tracking.receiver, balance);
      return Ok(());
    }

    let confirmed = self.store.get_confirmed_referral_count(&tracking.sender).await?;
    let ordinal = confirmed + 1;
    let sender_total = self.config.sender_reward(ordinal) + self.config.sender_bonus(ordinal);
    self.settle(tracking, ordinal, sender_total).await
  }

  async fn settle(&self, tracking: &ReferralTracking, ordinal: i64, sender_total: i64) -> anyhow::Result<()> {
    let ledger = self.ledger.clone();
    let sender = tracking.sender.clone();
    let receiver = tracking.receiver.clone();
    let receiver_reward = self.config.receiver_reward();
    // The memo tags the payout deterministically so a crash between broadcast
    // and commit can be reconciled against the ledger.
    let memo = format!("referral #{} for {}", ordinal, receiver);

    self
      .store
      .in_tx(Box::new(move |s: &dyn RecordStore| {
        Box::pin(async move {
          s.transition_tracking_to_confirmed(&receiver, sender_total, receiver_reward).await?;
          let stakes = [
            Stake { address: sender, amount: sender_total },
            Stake { address: receiver.clone(), amount: receiver_reward },
          ];
          ledger.transfer_stakes(&stakes, &memo).await?;
          Ok(())
        })
      }))
      .await?;

    info!(
      "referral settled receiver={} sender={} sender_reward={} receiver_reward={}",
      tracking.receiver, tracking.sender, sender_total, receiver_reward
    );
    Ok(())
  }
}
