//! Lark webhook notifier.
//!
//! Posts a rich-text message per execution failure. Delivery is best
//! effort: the executor logs and swallows any error returned here.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::domain::{AppError, ChainError, FailureNotice, Notifier};

pub struct LarkNotifier {
    http_client: Client,
    webhook_url: String,
    /// Deployment environment tag prepended to every title
    env_label: String,
}

#[derive(Deserialize)]
struct LarkReply {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

impl LarkNotifier {
    pub fn new(webhook_url: &str, env_label: &str) -> Self {
        Self {
            http_client: Client::new(),
            webhook_url: webhook_url.to_string(),
            env_label: env_label.to_string(),
        }
    }

    /// One tag per line: message text, record snapshot, optional explorer link
    fn build_content(&self, notice: &FailureNotice) -> Value {
        let mut lines: Vec<Value> = Vec::new();
        lines.push(json!([{ "tag": "text", "text": notice.message }]));
        if let Some(record) = &notice.record {
            lines.push(json!([{ "tag": "text", "text": record }]));
        }
        if let Some(url) = &notice.transaction_url {
            lines.push(json!([{ "tag": "a", "text": url, "href": url }]));
        }
        json!({
            "post": {
                "zh_cn": {
                    "title": format!("[{}] {}", self.env_label, notice.title),
                    "content": lines,
                }
            }
        })
    }
}

#[async_trait]
impl Notifier for LarkNotifier {
    async fn notify_failure(&self, notice: &FailureNotice) -> Result<(), AppError> {
        let payload = json!({
            "msg_type": "post",
            "content": self.build_content(notice),
        });

        let response = self
            .http_client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ChainError::Connection(e.to_string()))?;

        let reply: LarkReply = response
            .json()
            .await
            .map_err(|e| ChainError::InvalidResponse(e.to_string()))?;
        if reply.code > 0 {
            return Err(ChainError::Rpc(format!("lark webhook rejected: {}", reply.msg)).into());
        }
        debug!(title = %notice.title, "failure notification delivered");
        Ok(())
    }
}
