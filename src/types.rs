use std::{
    collections::{HashMap, HashSet},
    sync::atomic::AtomicUsize,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex};

use crate::engagement::NudgeConfig;
use crate::notify::TelegramConfig;

pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";

/// Sentinel message contents. They ride in the append-only log as ordinary
/// assistant rows but tell the widget to render an inline capture form or a
/// rating prompt instead of literal text; both are filtered out of prompt
/// history.
pub const CONTACT_FORM_MARKER: &str = "[[contact_form]]";
pub const RATING_PROMPT_MARKER: &str = "[[rating_prompt]]";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

/// A message as the widget replays it: markers carry the display language
/// reconstructed from the surrounding conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: String,
    pub chat_id: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub name: Option<String>,
    pub locale: String,
    pub first_message: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub text: String,
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactBody {
    pub value: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NudgeBody {
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub idle_for_ms: Option<i64>,
    #[serde(default)]
    pub since_load_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackBody {
    pub rating: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocaleQuery {
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub working_hours: String,
    pub nudge: NudgeConfig,
    pub telegram: Option<TelegramConfig>,
    pub ai_api_key: String,
}

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    pub chat_watchers: HashMap<String, HashSet<usize>>,
    pub watched_chat: HashMap<usize, String>,
}

pub struct AppState {
    pub db: PgPool,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
    pub ai_client: reqwest::Client,
    pub config: AppConfig,
    /// One-shot gate for the per-chat rating prompt, so realtime re-renders
    /// in the same process never append it twice.
    pub rating_prompted: Mutex<HashSet<String>>,
}
