//! Alert service: Telegram delivery plus a bounded in-memory history

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::config::Config;
use crate::error::SourceError;
use crate::utils::sources::NotificationSink;

const HISTORY_LIMIT: usize = 1000;

/// A message that went out (or would have, in log-only mode)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: i64,
    pub message: String,
    pub delivered_to_telegram: bool,
    pub timestamp: String,
}

struct TelegramTarget {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

/// Alert service for sending notifications
#[derive(Clone)]
pub struct AlertService {
    telegram: Option<Arc<TelegramTarget>>,
    history: Arc<RwLock<VecDeque<SentMessage>>>,
    next_id: Arc<AtomicI64>,
}

impl AlertService {
    pub fn new(config: &Config) -> Result<Self, SourceError> {
        let telegram = match (&config.telegram_bot_token, &config.telegram_chat_id) {
            (Some(bot_token), Some(chat_id)) => {
                let client = reqwest::Client::builder()
                    .timeout(config.http_timeout)
                    .build()?;
                info!(target: "ALERTS", "Telegram bot initialized");
                Some(Arc::new(TelegramTarget {
                    client,
                    api_base: "https://api.telegram.org".to_string(),
                    bot_token: bot_token.clone(),
                    chat_id: chat_id.clone(),
                }))
            }
            _ => {
                info!(target: "ALERTS", "Telegram not configured, alerts are logged only");
                None
            }
        };

        Ok(Self::with_telegram(telegram))
    }

    /// Log-only service
    pub fn log_only() -> Self {
        Self::with_telegram(None)
    }

    /// Deliver to a Telegram-compatible API at `api_base`
    pub fn telegram(api_base: &str, bot_token: &str, chat_id: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_telegram(Some(Arc::new(TelegramTarget {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
        }))))
    }

    fn with_telegram(telegram: Option<Arc<TelegramTarget>>) -> Self {
        Self {
            telegram,
            history: Arc::new(RwLock::new(VecDeque::with_capacity(HISTORY_LIMIT))),
            next_id: Arc::new(AtomicI64::new(1)),
        }
    }

    pub fn telegram_enabled(&self) -> bool {
        self.telegram.is_some()
    }

    /// Most recent first
    pub fn get_recent(&self, limit: usize) -> Vec<SentMessage> {
        let history = self.history.read();
        history.iter().take(limit).cloned().collect()
    }

    fn remember(&self, message: &str, delivered_to_telegram: bool) {
        let entry = SentMessage {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            message: message.to_string(),
            delivered_to_telegram,
            timestamp: Utc::now().to_rfc3339(),
        };
        let mut history = self.history.write();
        history.push_front(entry);
        history.truncate(HISTORY_LIMIT);
    }

    async fn send_telegram(target: &TelegramTarget, message: &str) -> Result<(), SourceError> {
        let url = format!("{}/bot{}/sendMessage", target.api_base, target.bot_token);
        let params = serde_json::json!({
            "chat_id": target.chat_id,
            "text": message,
            "parse_mode": "Markdown",
            "disable_web_page_preview": true,
        });

        let response = target.client.post(&url).json(&params).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let detail = format!("telegram {}: {}", status, body.chars().take(200).collect::<String>());
        if status.as_u16() == 429 {
            Err(SourceError::QuotaExhausted(detail))
        } else if status.is_server_error() {
            Err(SourceError::Transient(detail))
        } else {
            Err(SourceError::Malformed(detail))
        }
    }
}

/// Backslash-escape the characters legacy Telegram Markdown treats as entity markers
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '_' | '*' | '`' | '[') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[async_trait]
impl NotificationSink for AlertService {
    async fn send(&self, message: &str) -> Result<(), SourceError> {
        match &self.telegram {
            Some(target) => {
                if let Err(e) = Self::send_telegram(target, message).await {
                    error!(target: "ALERTS", "Telegram send failed: {}", e);
                    return Err(e);
                }
                self.remember(message, true);
            }
            None => {
                info!(target: "ALERTS", "\n{}", message);
                self.remember(message, false);
            }
        }
        Ok(())
    }
}
