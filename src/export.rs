use chrono::{DateTime, Utc};
use serde_json::json;

use crate::types::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Txt,
    Md,
    Html,
}

impl ExportFormat {
    pub fn parse(value: &str) -> ExportFormat {
        match value.trim().to_ascii_lowercase().as_str() {
            "txt" => ExportFormat::Txt,
            "md" | "markdown" => ExportFormat::Md,
            "html" => ExportFormat::Html,
            _ => ExportFormat::Json,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Txt => "txt",
            ExportFormat::Md => "md",
            ExportFormat::Html => "html",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json; charset=utf-8",
            ExportFormat::Txt => "text/plain; charset=utf-8",
            ExportFormat::Md => "text/markdown; charset=utf-8",
            ExportFormat::Html => "text/html; charset=utf-8",
        }
    }
}

pub fn export_filename_base(chat_id: &str, now: DateTime<Utc>) -> String {
    let short_id: String = chat_id.chars().take(8).collect();
    let ts = now
        .to_rfc3339()
        .replace(':', "-")
        .replace('.', "-");
    format!("chat-{short_id}-{ts}")
}

fn day_of(created_at: &str) -> &str {
    if created_at.len() >= 10 {
        &created_at[..10]
    } else {
        created_at
    }
}

fn time_of(created_at: &str) -> &str {
    if created_at.len() >= 16 {
        &created_at[11..16]
    } else {
        created_at
    }
}

pub fn render(format: ExportFormat, chat_id: &str, messages: &[ChatMessage]) -> String {
    match format {
        ExportFormat::Json => render_json(chat_id, messages),
        ExportFormat::Txt => render_txt(messages),
        ExportFormat::Md => render_md(chat_id, messages),
        ExportFormat::Html => render_html(chat_id, messages),
    }
}

fn render_json(chat_id: &str, messages: &[ChatMessage]) -> String {
    serde_json::to_string_pretty(&json!({ "chatId": chat_id, "messages": messages }))
        .unwrap_or_else(|_| "{}".to_string())
}

fn render_txt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            format!(
                "[{}] {}\n\n{}\n\n---",
                m.created_at,
                m.role.to_uppercase(),
                m.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_md(chat_id: &str, messages: &[ChatMessage]) -> String {
    let mut md = format!("# Chat {chat_id}\n\n");
    let mut days: Vec<&str> = messages.iter().map(|m| day_of(&m.created_at)).collect();
    days.sort();
    days.dedup();
    for day in days {
        md.push_str(&format!("## {day}\n\n"));
        for m in messages.iter().filter(|m| day_of(&m.created_at) == day) {
            md.push_str(&format!(
                "- {} — {}\n\n",
                time_of(&m.created_at),
                m.role.to_uppercase()
            ));
            md.push_str(&m.content.replace('\n', "\n\n"));
            md.push_str("\n\n---\n\n");
        }
    }
    md
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_html(chat_id: &str, messages: &[ChatMessage]) -> String {
    let items = messages
        .iter()
        .map(|m| {
            let role = m.role.to_lowercase();
            format!(
                "<div class=\"msg {role}\"><div class=\"meta\">{} — {}</div><div class=\"content\">{}</div></div>",
                m.created_at,
                role.to_uppercase(),
                escape_html(&m.content).replace('\n', "<br/>")
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"/><title>Chat {chat_id}</title><style>\n\
         body{{font-family:system-ui,-apple-system,Segoe UI,Roboto,Inter,Arial,sans-serif;background:#0b0b0c;color:#e5e7eb;margin:0;padding:24px}}\n\
         h1{{font-size:18px;margin:0 0 16px 0;color:#fff}}\n\
         .msg{{border:1px solid #1f2937;background:#111827;border-radius:12px;padding:12px 14px;margin:12px 0}}\n\
         .msg.user{{border-color:#374151;background:#0f172a}}\n\
         .meta{{font-size:12px;color:#9ca3af;margin-bottom:8px}}\n\
         .content{{white-space:pre-wrap;line-height:1.5}}\n\
         </style></head><body><h1>Chat {chat_id}</h1>{items}</body></html>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn msg(role: &str, content: &str, created_at: &str) -> ChatMessage {
        ChatMessage {
            id: format!("id-{role}-{created_at}"),
            chat_id: "chat-1".to_string(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: created_at.to_string(),
        }
    }

    fn sample() -> Vec<ChatMessage> {
        vec![
            msg("assistant", "Привіт! 👋", "2026-02-01T09:00:00+00:00"),
            msg("user", "Скільки коштує лендінг?", "2026-02-01T09:01:00+00:00"),
            msg("assistant", "Лендінг: $800 - $1,500.", "2026-02-02T10:15:00+00:00"),
        ]
    }

    #[test]
    fn txt_preserves_order_role_and_timestamp() {
        let out = render_txt(&sample());
        let first = out.find("ASSISTANT").unwrap();
        let second = out.find("USER").unwrap();
        assert!(first < second);
        assert!(out.contains("[2026-02-01T09:01:00+00:00] USER"));
        assert!(out.contains("Скільки коштує лендінг?"));
    }

    #[test]
    fn markdown_groups_by_day_in_order() {
        let out = render_md("chat-1", &sample());
        let d1 = out.find("## 2026-02-01").unwrap();
        let d2 = out.find("## 2026-02-02").unwrap();
        assert!(d1 < d2);
        assert!(out.contains("- 09:01 — USER"));
    }

    #[test]
    fn html_escapes_content() {
        let messages = vec![msg("user", "<b>1 & 2</b>", "2026-02-01T09:00:00+00:00")];
        let out = render_html("chat-1", &messages);
        assert!(out.contains("&lt;b&gt;1 &amp; 2&lt;/b&gt;"));
        assert!(!out.contains("<b>1"));
    }

    #[test]
    fn json_round_trips_every_message() {
        let out = render_json("chat-1", &sample());
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["chatId"], "chat-1");
        let messages = value["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["createdAt"], "2026-02-01T09:01:00+00:00");
    }

    #[test]
    fn filename_base_is_sortable_and_short() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap();
        let name = export_filename_base("0a1b2c3d-rest-of-uuid", now);
        assert!(name.starts_with("chat-0a1b2c3d-2026-02-01T09-00-00"));
    }
}
