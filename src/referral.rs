use serde::Serialize;

pub const STAKE_DENOM: i64 = 1_000_000;

#[derive(Clone, Debug, Serialize)]
pub struct Bonus {
  pub count: i64,
  pub reward: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct Level {
  pub from: i64,
  pub to: Option<i64>,
  pub reward: i64,
}

/// Reward schedule for confirmed referrals. Built once at startup and shared
/// read-only between the HTTP surface and the rewarder.
#[derive(Clone, Debug, Serialize)]
pub struct ReferralConfig {
  threshold: i64,
  dwell_days: u32,
  receiver_reward: i64,
  bonuses: Vec<Bonus>,
  levels: Vec<Level>,
}

impl ReferralConfig {
  pub fn new(threshold: i64, dwell_days: u32, receiver_reward: i64) -> Self {
    let bonuses = [100i64, 250, 500, 1000]
      .iter()
      .map(|&count| Bonus { count, reward: count * STAKE_DENOM })
      .collect();
    let levels = vec![
      Level { from: 1, to: Some(100), reward: 10 * STAKE_DENOM },
      Level { from: 101, to: Some(250), reward: 12_500_000 },
      Level { from: 251, to: Some(500), reward: 15 * STAKE_DENOM },
      Level { from: 501, to: None, reward: 20 * STAKE_DENOM },
    ];
    Self { threshold, dwell_days, receiver_reward, bonuses, levels }
  }

  pub fn threshold(&self) -> i64 {
    self.threshold
  }

  pub fn dwell_days(&self) -> u32 {
    self.dwell_days
  }

  pub fn receiver_reward(&self) -> i64 {
    self.receiver_reward
  }

  /// Per-referral reward for the sender's n-th confirmed referral.
  pub fn sender_reward(&self, count: i64) -> i64 {
    if count <= 0 {
      return 0;
    }
    for level in &self.levels {
      let upper_ok = level.to.map_or(true, |to| count <= to);
      if count >= level.from && upper_ok {
        return level.reward;
      }
    }
    0
  }

  /// One-off milestone bonus, paid only when the lifetime count lands exactly
  /// on a milestone.
  pub fn sender_bonus(&self, count: i64) -> i64 {
    for bonus in &self.bonuses {
      if bonus.count == count {
        return bonus.reward;
      }
    }
    0
  }
}
