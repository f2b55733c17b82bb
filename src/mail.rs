use std::time::Duration;
use tracing::warn;

/// Outbound notifications are fire-and-forget: registration and confirmation
/// never fail because the relay is down.
pub trait Notifier: Send + Sync {
  fn send_verification_code(&self, email: &str, code: &str);
  fn send_welcome(&self, email: &str);
}

#[derive(Clone)]
pub struct MailRelay {
  client: reqwest::Client,
  relay_url: String,
  from_email: String,
}

impl MailRelay {
  pub fn new(relay_url: String, from_email: String, timeout_ms: u64) -> Self {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_millis(timeout_ms))
      .build()
      .expect("client build");
    Self { client, relay_url, from_email }
  }

  fn dispatch(&self, payload: serde_json::Value) {
    let client = self.client.clone();
    let relay_url = self.relay_url.clone();
    tokio::spawn(async move {
      let res = client.post(&relay_url).json(&payload).send().await;
      match res {
        Ok(resp) if resp.status().is_success() => {}
        Ok(resp) => warn!("mail relay rejected message status={}", resp.status()),
        Err(err) => warn!("mail relay error: {}", err),
      }
    });
  }
}

impl Notifier for MailRelay {
  fn send_verification_code(&self, email: &str, code: &str) {
    self.dispatch(serde_json::json!({
      "template": "verification",
      "from": self.from_email,
      "to": email,
      "vars": { "code": code },
    }));
  }

  fn send_welcome(&self, email: &str) {
    self.dispatch(serde_json::json!({
      "template": "welcome",
      "from": self.from_email,
      "to": email,
      "vars": {},
    }));
  }
}
