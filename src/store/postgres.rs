use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, Postgres};
use sqlx::{Row, Transaction};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::error;

use super::{
  NewRequest, RecordStore, ReferralStatus, ReferralTracking, ReferralTrackingStats, RegisterStats, Request,
  StoreError, TxFn,
};

/// Postgres-backed record store. Cloning is cheap and shares the pool; a
/// transaction-scoped clone routes every query through the open transaction.
#[derive(Clone)]
pub struct PgRecordStore {
  ext: PgExecutor,
}

#[derive(Clone)]
enum PgExecutor {
  Pool(PgPool),
  Tx(Arc<Mutex<Transaction<'static, Postgres>>>),
}

#[derive(sqlx::FromRow)]
struct TrackingRow {
  sender: String,
  receiver: String,
  status: String,
  registered_at: DateTime<Utc>,
  installed_at: Option<DateTime<Utc>>,
  confirmed_at: Option<DateTime<Utc>>,
  sender_reward: Option<i64>,
  receiver_reward: Option<i64>,
}

impl TrackingRow {
  fn into_tracking(self) -> Result<ReferralTracking, StoreError> {
    let status = ReferralStatus::parse(&self.status).ok_or_else(|| {
      StoreError::Database(sqlx::Error::Decode(
        format!("unknown tracking status {}", self.status).into(),
      ))
    })?;
    Ok(ReferralTracking {
      sender: self.sender,
      receiver: self.receiver,
      status,
      registered_at: self.registered_at,
      installed_at: self.installed_at,
      confirmed_at: self.confirmed_at,
      sender_reward: self.sender_reward,
      receiver_reward: self.receiver_reward,
    })
  }
}

const REQUEST_COLUMNS: &str = "owner, email, address, code, created_at, confirmed_at, own_referral_code, registration_referral_code, referral_banned";
const TRACKING_COLUMNS: &str = "sender, receiver, status, registered_at, installed_at, confirmed_at, sender_reward, receiver_reward";

impl PgRecordStore {
  pub fn new(pool: PgPool) -> Self {
    Self { ext: PgExecutor::Pool(pool) }
  }

  async fn fetch_request(&self, query: &str, arg: &str) -> Result<Request, StoreError> {
    let res = match &self.ext {
      PgExecutor::Pool(pool) => sqlx::query_as::<_, Request>(query).bind(arg).fetch_optional(pool).await?,
      PgExecutor::Tx(tx) => {
        let mut guard = tx.lock().await;
        sqlx::query_as::<_, Request>(query).bind(arg).fetch_optional(&mut **guard).await?
      }
    };
    res.ok_or(StoreError::NotFound)
  }
}

fn translate_unique(err: sqlx::Error) -> StoreError {
  if let sqlx::Error::Database(db) = &err {
    if db.code().as_deref() == Some("23505") {
      match db.constraint() {
        Some("request_address_key") | Some("request_owner_key") => return StoreError::AddressTaken,
        Some("referral_tracking_pkey") => return StoreError::ReferralTrackingExists,
        _ => {}
      }
    }
    // Null sender means the referral-code subselect matched nothing.
    if db.code().as_deref() == Some("23502") {
      return StoreError::ReferralCodeNotFound;
    }
  }
  StoreError::Database(err)
}

#[async_trait]
impl RecordStore for PgRecordStore {
  async fn get_request_by_owner(&self, owner: &str) -> Result<Request, StoreError> {
    let query = format!("SELECT {REQUEST_COLUMNS} FROM request WHERE owner = $1");
    self.fetch_request(&query, owner).await
  }

  async fn get_request_by_address(&self, address: &str) -> Result<Request, StoreError> {
    let query = format!("SELECT {REQUEST_COLUMNS} FROM request WHERE address = $1");
    self.fetch_request(&query, address).await
  }

  async fn get_request_by_referral_code(&self, code: &str) -> Result<Request, StoreError> {
    let query = format!("SELECT {REQUEST_COLUMNS} FROM request WHERE own_referral_code = $1");
    match self.fetch_request(&query, code).await {
      Err(StoreError::NotFound) => Err(StoreError::ReferralCodeNotFound),
      other => other,
    }
  }

  async fn upsert_request(&self, request: &NewRequest) -> Result<(), StoreError> {
    let query = "
      INSERT INTO request (owner, email, address, code, own_referral_code, registration_referral_code)
      VALUES ($1, $2, $3, $4, $5, $6)
      ON CONFLICT (email) DO UPDATE SET
        address = EXCLUDED.address,
        code = EXCLUDED.code,
        created_at = NOW(),
        registration_referral_code = EXCLUDED.registration_referral_code";
    let q = sqlx::query(query)
      .bind(&request.owner)
      .bind(&request.email)
      .bind(&request.address)
      .bind(&request.code)
      .bind(&request.own_referral_code)
      .bind(&request.registration_referral_code);
    let res = match &self.ext {
      PgExecutor::Pool(pool) => q.execute(pool).await,
      PgExecutor::Tx(tx) => {
        let mut guard = tx.lock().await;
        q.execute(&mut **guard).await
      }
    };
    res.map(|_| ()).map_err(translate_unique)
  }

  async fn set_confirmed(&self, owner: &str) -> Result<(), StoreError> {
    let q = sqlx::query("UPDATE request SET confirmed_at = NOW() WHERE owner = $1").bind(owner);
    let res = match &self.ext {
      PgExecutor::Pool(pool) => q.execute(pool).await?,
      PgExecutor::Tx(tx) => {
        let mut guard = tx.lock().await;
        q.execute(&mut **guard).await?
      }
    };
    if res.rows_affected() == 0 {
      return Err(StoreError::NotFound);
    }
    Ok(())
  }

  async fn create_referral_tracking(&self, receiver: &str, referral_code: &str) -> Result<(), StoreError> {
    let query = "
      INSERT INTO referral_tracking (sender, receiver)
      VALUES ((SELECT address FROM request WHERE own_referral_code = $2 AND NOT referral_banned), $1)";
    let q = sqlx::query(query).bind(receiver).bind(referral_code);
    let res = match &self.ext {
      PgExecutor::Pool(pool) => q.execute(pool).await,
      PgExecutor::Tx(tx) => {
        let mut guard = tx.lock().await;
        q.execute(&mut **guard).await
      }
    };
    res.map(|_| ()).map_err(translate_unique)
  }

  async fn get_referral_tracking_by_receiver(&self, receiver: &str) -> Result<ReferralTracking, StoreError> {
    let query = format!("SELECT {TRACKING_COLUMNS} FROM referral_tracking WHERE receiver = $1");
    let q = sqlx::query_as::<_, TrackingRow>(&query).bind(receiver);
    let row = match &self.ext {
      PgExecutor::Pool(pool) => q.fetch_optional(pool).await?,
      PgExecutor::Tx(tx) => {
        let mut guard = tx.lock().await;
        q.fetch_optional(&mut **guard).await?
      }
    };
    row.ok_or(StoreError::NotFound)?.into_tracking()
  }

  async fn transition_tracking_to_installed(&self, receiver: &str) -> Result<(), StoreError> {
    let query = "
      UPDATE referral_tracking SET status = 'installed', installed_at = NOW()
      WHERE receiver = $1 AND status = 'registered'";
    let q = sqlx::query(query).bind(receiver);
    let res = match &self.ext {
      PgExecutor::Pool(pool) => q.execute(pool).await?,
      PgExecutor::Tx(tx) => {
        let mut guard = tx.lock().await;
        q.execute(&mut **guard).await?
      }
    };
    if res.rows_affected() == 0 {
      return Err(StoreError::NotFound);
    }
    Ok(())
  }

  async fn transition_tracking_to_confirmed(
    &self,
    receiver: &str,
    sender_reward: i64,
    receiver_reward: i64,
  ) -> Result<(), StoreError> {
    let query = "
      UPDATE referral_tracking
      SET status = 'confirmed', confirmed_at = NOW(), sender_reward = $2, receiver_reward = $3
      WHERE receiver = $1 AND status = 'installed'";
    let q = sqlx::query(query).bind(receiver).bind(sender_reward).bind(receiver_reward);
    let res = match &self.ext {
      PgExecutor::Pool(pool) => q.execute(pool).await?,
      PgExecutor::Tx(tx) => {
        let mut guard = tx.lock().await;
        q.execute(&mut **guard).await?
      }
    };
    if res.rows_affected() == 0 {
      return Err(StoreError::NotFound);
    }
    Ok(())
  }

  async fn get_confirmed_referral_count(&self, sender: &str) -> Result<i64, StoreError> {
    let query = "SELECT COUNT(*) FROM referral_tracking WHERE sender = $1 AND status = 'confirmed'";
    let q = sqlx::query_scalar::<_, i64>(query).bind(sender);
    let count = match &self.ext {
      PgExecutor::Pool(pool) => q.fetch_one(pool).await?,
      PgExecutor::Tx(tx) => {
        let mut guard = tx.lock().await;
        q.fetch_one(&mut **guard).await?
      }
    };
    Ok(count)
  }

  async fn get_installed_trackings_older_than(&self, days: u32) -> Result<Vec<ReferralTracking>, StoreError> {
    let query = format!(
      "
      SELECT {TRACKING_COLUMNS} FROM referral_tracking
      WHERE status = 'installed'
        AND installed_at < NOW() - make_interval(days => $1)
        AND sender NOT IN (SELECT address FROM request WHERE referral_banned)
      ORDER BY installed_at"
    );
    let q = sqlx::query_as::<_, TrackingRow>(&query).bind(days as i32);
    let rows = match &self.ext {
      PgExecutor::Pool(pool) => q.fetch_all(pool).await?,
      PgExecutor::Tx(tx) => {
        let mut guard = tx.lock().await;
        q.fetch_all(&mut **guard).await?
      }
    };
    rows.into_iter().map(TrackingRow::into_tracking).collect()
  }

  async fn get_referral_tracking_stats(&self, sender: &str) -> Result<Vec<ReferralTrackingStats>, StoreError> {
    let query = "
      SELECT
        COUNT(*) FILTER (WHERE status = 'registered') AS registered,
        COUNT(*) FILTER (WHERE status = 'installed') AS installed,
        COUNT(*) FILTER (WHERE status = 'confirmed') AS confirmed,
        COALESCE(SUM(sender_reward) FILTER (WHERE status = 'confirmed'), 0)::BIGINT AS reward
      FROM referral_tracking
      WHERE sender = $1 AND ($2 OR registered_at > NOW() - INTERVAL '30 days')";
    let mut out = Vec::with_capacity(2);
    for all_time in [true, false] {
      let q = sqlx::query(query).bind(sender).bind(all_time);
      let row = match &self.ext {
        PgExecutor::Pool(pool) => q.fetch_one(pool).await?,
        PgExecutor::Tx(tx) => {
          let mut guard = tx.lock().await;
          q.fetch_one(&mut **guard).await?
        }
      };
      out.push(ReferralTrackingStats {
        registered: row.try_get("registered")?,
        installed: row.try_get("installed")?,
        confirmed: row.try_get("confirmed")?,
        reward: row.try_get("reward")?,
      });
    }
    Ok(out)
  }

  async fn has_fraud_domain(&self, email: &str) -> Result<bool, StoreError> {
    let query = "
      SELECT EXISTS (
        SELECT 1 FROM email_fraud_domains
        WHERE $1 LIKE '%@' || domain OR $1 LIKE '%.' || domain
      )";
    let q = sqlx::query_scalar::<_, bool>(query).bind(email);
    let found = match &self.ext {
      PgExecutor::Pool(pool) => q.fetch_one(pool).await?,
      PgExecutor::Tx(tx) => {
        let mut guard = tx.lock().await;
        q.fetch_one(&mut **guard).await?
      }
    };
    Ok(found)
  }

  async fn get_confirmed_registrations_total(&self) -> Result<i64, StoreError> {
    let query = "SELECT COUNT(*) FROM request WHERE confirmed_at IS NOT NULL";
    let q = sqlx::query_scalar::<_, i64>(query);
    let total = match &self.ext {
      PgExecutor::Pool(pool) => q.fetch_one(pool).await?,
      PgExecutor::Tx(tx) => {
        let mut guard = tx.lock().await;
        q.fetch_one(&mut **guard).await?
      }
    };
    Ok(total)
  }

  async fn get_confirmed_registrations_stats(&self) -> Result<Vec<RegisterStats>, StoreError> {
    let query = "
      SELECT confirmed_at::DATE AS date, COUNT(*)::BIGINT AS value
      FROM request
      WHERE confirmed_at > NOW() - INTERVAL '90 days'
      GROUP BY confirmed_at::DATE
      ORDER BY date";
    let q = sqlx::query(query);
    let rows = match &self.ext {
      PgExecutor::Pool(pool) => q.fetch_all(pool).await?,
      PgExecutor::Tx(tx) => {
        let mut guard = tx.lock().await;
        q.fetch_all(&mut **guard).await?
      }
    };
    rows
      .into_iter()
      .map(|row| {
        Ok(RegisterStats {
          date: row.try_get::<NaiveDate, _>("date")?,
          value: row.try_get("value")?,
        })
      })
      .collect()
  }

  async fn in_tx(&self, f: TxFn) -> anyhow::Result<()> {
    let pool = match &self.ext {
      PgExecutor::Pool(pool) => pool.clone(),
      PgExecutor::Tx(_) => anyhow::bail!("already inside a transaction"),
    };
    let tx = pool.begin().await?;
    let shared = Arc::new(Mutex::new(tx));
    let scoped = PgRecordStore { ext: PgExecutor::Tx(shared.clone()) };
    let result = f(&scoped).await;
    drop(scoped);
    let tx = Arc::try_unwrap(shared)
      .map_err(|_| anyhow::anyhow!("transaction still borrowed"))?
      .into_inner();
    match result {
      Ok(()) => {
        tx.commit().await?;
        Ok(())
      }
      Err(err) => {
        if let Err(rb) = tx.rollback().await {
          error!("transaction rollback failed: {}", rb);
        }
        Err(err)
      }
    }
  }
}
