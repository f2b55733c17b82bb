mod cli;
mod config;
mod error;
mod http_server;
mod ledger;
mod mail;
mod referral;
mod service;
mod store;
mod tasks;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use config::{load_config, write_default_config, Config};
use http_server::{build_router, rate_limiter, AppState};
use ledger::{BalanceClient, BroadcastClient};
use mail::MailRelay;
use referral::ReferralConfig;
use service::Service;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use store::postgres::PgRecordStore;
use tasks::rewarder::Rewarder;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
    .init();

  match cli.command {
    Command::Init { config } => {
      write_default_config(&config)?;
      info!("created config {}", config);
    }
    Command::Run { config } => {
      let cfg = load_config(&config)?;
      run_daemon(cfg).await?;
    }
  }

  Ok(())
}

async fn run_daemon(config: Config) -> Result<()> {
  let pool = PgPoolOptions::new()
    .max_connections(10)
    .connect(&config.postgres_url)
    .await?;
  sqlx::migrate!("./migrations").run(&pool).await?;

  let store = PgRecordStore::new(pool);
  let broadcast = BroadcastClient::new(config.ledger.node_url.clone(), config.request_timeout_ms);
  let balance = BalanceClient::new(config.ledger.rest_url.clone(), config.request_timeout_ms);
  let notifier = MailRelay::new(config.mail.relay_url.clone(), config.mail.from_email.clone(), config.request_timeout_ms);
  let referral = ReferralConfig::new(
    config.referral.threshold_micro,
    config.referral.dwell_days,
    config.referral.receiver_reward,
  );

  let svc = Arc::new(Service::new(
    store.clone(),
    broadcast.clone(),
    notifier,
    config.ledger.initial_stakes,
    config.ledger.tx_memo.clone(),
  ));

  let (shutdown_tx, shutdown_rx) = watch::channel(false);

  let rewarder = Rewarder::new(
    store,
    broadcast,
    balance,
    referral.clone(),
    Duration::from_secs(config.referral.interval_seconds),
  );
  let rewarder_handle = tokio::spawn(async move {
    rewarder.run(shutdown_rx).await;
  });

  let state = AppState {
    svc,
    referral,
    limiter: Arc::new(rate_limiter(config.rate_limit_rps)),
  };

  let app = build_router(state);
  let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
  info!("listening on {}", config.listen_addr);
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await?;

  rewarder_handle.await?;
  Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
  let ctrl_c = async {
    tokio::signal::ctrl_c().await.expect("ctrl_c handler");
  };
  #[cfg(unix)]
  let terminate = async {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
      .expect("signal handler")
      .recv()
      .await;
  };
  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {}
    _ = terminate => {}
  }
  info!("shutdown requested");
  let _ = shutdown_tx.send(true);
}
