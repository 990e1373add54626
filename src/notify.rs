use serde_json::json;

use crate::contact::is_bare_contact;

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramConfig {
    pub fn from_env() -> Option<TelegramConfig> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok()?;
        if bot_token.trim().is_empty() || chat_id.trim().is_empty() {
            return None;
        }
        Some(TelegramConfig { bot_token, chat_id })
    }
}

/// Human-readable summary sent when a new lead is created. The triggering
/// message is quoted only when it says more than the bare contact string.
pub fn lead_notification_text(
    chat_id: &str,
    name: Option<&str>,
    email: Option<&str>,
    phone: Option<&str>,
    trigger_message: &str,
) -> String {
    let mut lines = vec![
        "🆕 New lead — website chat".to_string(),
        format!("Chat: {chat_id}"),
    ];
    if let Some(name) = name.filter(|v| !v.trim().is_empty()) {
        lines.push(format!("Name: {name}"));
    }
    if let Some(email) = email.filter(|v| !v.trim().is_empty()) {
        lines.push(format!("Email: {email}"));
    }
    if let Some(phone) = phone.filter(|v| !v.trim().is_empty()) {
        lines.push(format!("Phone: {phone}"));
    }
    let trigger = trigger_message.trim();
    if !trigger.is_empty() && !is_bare_contact(trigger) {
        lines.push(format!("Message: {trigger}"));
    }
    lines.join("\n")
}

/// Best-effort delivery to the bot API: failures are logged and never
/// retried or surfaced to the visitor.
pub async fn send_telegram_message(client: &reqwest::Client, config: &TelegramConfig, text: &str) {
    let url = format!("https://api.telegram.org/bot{}/sendMessage", config.bot_token);
    let result = client
        .post(&url)
        .json(&json!({ "chat_id": config.chat_id, "text": text }))
        .send()
        .await;
    match result {
        Ok(response) if !response.status().is_success() => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            eprintln!("[telegram] sendMessage returned {status}: {body}");
        }
        Err(err) => eprintln!("[telegram] sendMessage failed: {err}"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_only_present_fields() {
        let text = lead_notification_text(
            "chat-123",
            None,
            Some("jane@example.com"),
            None,
            "My email is jane@example.com, please call me",
        );
        assert!(text.contains("Chat: chat-123"));
        assert!(text.contains("Email: jane@example.com"));
        assert!(!text.contains("Name:"));
        assert!(!text.contains("Phone:"));
        assert!(text.contains("Message: My email is jane@example.com, please call me"));
    }

    #[test]
    fn bare_contact_message_is_not_repeated() {
        let text = lead_notification_text("chat-123", None, Some("jane@example.com"), None, "jane@example.com");
        assert!(!text.contains("Message:"));
    }
}
