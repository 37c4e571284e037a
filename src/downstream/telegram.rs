use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::json;

use super::Notifier;
use crate::config::NotifyConfig;

/// Telegram rejects messages longer than this.
const MESSAGE_LIMIT: usize = 4096;
const SESSION_BUDGET: usize = 80;
const USER_BUDGET: usize = 1200;

/// Posts each completed exchange to a chat via the Bot API, HTML parse mode.
pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(cfg: &NotifyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build notification client")?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                cfg.api_base.trim_end_matches('/'),
                cfg.bot_token
            ),
            chat_id: cfg.chat_id.clone(),
        })
    }
}

fn escape_char(c: char) -> Option<&'static str> {
    match c {
        '&' => Some("&amp;"),
        '<' => Some("&lt;"),
        '>' => Some("&gt;"),
        _ => None,
    }
}

/// HTML-escape `text` so the escaped result is at most `budget` chars,
/// cutting on whole characters and ending with an ellipsis when cut.
pub fn fit_html(text: &str, budget: usize) -> String {
    let escaped_len: usize = text
        .chars()
        .map(|c| escape_char(c).map_or(1, |e| e.len()))
        .sum();
    let limit = if escaped_len <= budget {
        budget
    } else {
        budget.saturating_sub(1)
    };
    let mut out = String::new();
    let mut used = 0;
    for c in text.chars() {
        let width = escape_char(c).map_or(1, |e| e.len());
        if used + width > limit {
            break;
        }
        match escape_char(c) {
            Some(e) => out.push_str(e),
            None => out.push(c),
        }
        used += width;
    }
    if escaped_len > budget && budget > 0 {
        out.push('…');
    }
    out
}

pub fn render_message(user_message: &str, model_response: &str, session_id: &str) -> String {
    let head = format!(
        "<b>New guest message</b>\nSession: <code>{}</code>\n\n<b>Guest</b>\n{}\n\n<b>Reply</b>\n",
        fit_html(session_id, SESSION_BUDGET),
        fit_html(user_message, USER_BUDGET)
    );
    let remaining = MESSAGE_LIMIT.saturating_sub(head.chars().count());
    let mut text = head;
    text.push_str(&fit_html(model_response, remaining));
    text
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, user_message: &str, model_response: &str, session_id: &str) -> Result<()> {
        let body = json!({
            "chat_id": self.chat_id,
            "text": render_message(user_message, model_response, session_id),
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .context("notification request failed")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("notification endpoint returned {}", status.as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup() {
        assert_eq!(fit_html("<b>a & b</b>", 100), "&lt;b&gt;a &amp; b&lt;/b&gt;");
    }

    #[test]
    fn truncates_without_splitting_entities() {
        // "a<" escapes to "a&lt;" (5 chars); a budget of 4 leaves room for "a" + ellipsis only.
        assert_eq!(fit_html("a<b", 4), "a…");
        assert_eq!(fit_html("abcdef", 4), "abc…");
        assert_eq!(fit_html("abcd", 4), "abcd");
        assert_eq!(fit_html("abc", 0), "");
    }

    #[test]
    fn rendered_message_respects_limit() {
        let user = "<".repeat(5000);
        let reply = "r".repeat(10_000);
        let text = render_message(&user, &reply, "session-1");
        assert!(text.chars().count() <= MESSAGE_LIMIT);
        assert!(text.contains("<code>session-1</code>"));
        assert!(!text.contains("<<"));
        assert!(text.ends_with('…'));
    }

    #[test]
    fn short_message_is_untouched() {
        let text = render_message("hi", "hello!", "s");
        assert!(text.ends_with("<b>Reply</b>\nhello!"));
        assert!(text.contains("<b>Guest</b>\nhi\n"));
    }
}
