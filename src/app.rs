use std::{
    env,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, Request, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::contact::{extract_contact, ContactInfo};
use crate::engagement::{
    plan_nudge, wants_contact_prompt, EngagementEvent, EngagementState, NudgeConfig,
    NudgeSituation,
};
use crate::export::{export_filename_base, render, ExportFormat};
use crate::knowledge::{
    build_knowledge_block, fetch_relevant_docs, knowledge_for, translations, verify_knowledge,
    Locale,
};
use crate::lang::detect_language;
use crate::notify::{lead_notification_text, send_telegram_message, TelegramConfig};
use crate::pages::{render_home, render_pricing};
use crate::prompting::{
    prompt_history, render_docs_block, render_system_prompt, SystemPromptContext,
};
use crate::types::*;

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "webimpuls".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

fn resolve_ai_api_key() -> String {
    for name in ["GOOGLE_API_KEY", "GEMINI_API_KEY"] {
        if let Ok(key) = env::var(name) {
            if !key.trim().is_empty() {
                return key;
            }
        }
    }
    String::new()
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn resolve_config() -> AppConfig {
    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    AppConfig {
        port,
        working_hours: env::var("WORKING_HOURS")
            .unwrap_or_else(|_| "Mon-Fri 9:00-18:00 CET".to_string()),
        nudge: NudgeConfig {
            first_delay_ms: env_i64("NUDGE_FIRST_DELAY_MS", 10_000),
            idle_threshold_ms: env_i64("NUDGE_IDLE_THRESHOLD_MS", 120_000),
            max_per_session: env_i64("NUDGE_MAX_PER_SESSION", 5),
        },
        telegram: TelegramConfig::from_env(),
        ai_api_key: resolve_ai_api_key(),
    }
}

// --- Session/identity resolver ---

const CHAT_COOKIE: &str = "chat_id";
const CHAT_COOKIE_MAX_AGE_SECS: i64 = 60 * 60 * 24 * 30;

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        if key == name && !value.is_empty() {
            Some(value.to_string())
        } else {
            None
        }
    })
}

fn chat_set_cookie(chat_id: &str) -> String {
    format!(
        "{CHAT_COOKIE}={chat_id}; HttpOnly; SameSite=Lax; Path=/; Max-Age={CHAT_COOKIE_MAX_AGE_SECS}"
    )
}

fn with_set_cookie(mut response: Response, set_cookie: Option<String>) -> Response {
    if let Some(cookie) = set_cookie {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    response
}

async fn chat_exists(pool: &PgPool, chat_id: &str) -> bool {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM chats WHERE id = $1")
        .bind(chat_id)
        .fetch_one(pool)
        .await
        .unwrap_or(0)
        > 0
}

/// Read-only resolver: the cookie's chat, or nothing. Never creates a row,
/// so background checks cannot spawn empty conversations.
async fn existing_chat(state: &Arc<AppState>, headers: &HeaderMap) -> Option<String> {
    let chat_id = cookie_value(headers, CHAT_COOKIE)?;
    if chat_exists(&state.db, &chat_id).await {
        Some(chat_id)
    } else {
        None
    }
}

/// Resolves the visitor's chat, creating one (and issuing the cookie) when
/// the cookie is absent or references a nonexistent row. Concurrent first
/// requests may each create a row; the cookie from the last response wins
/// and the spare row is accepted skew.
async fn get_or_create_chat(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Option<(String, Option<String>)> {
    if let Some(chat_id) = existing_chat(state, headers).await {
        return Some((chat_id, None));
    }
    let chat_id = Uuid::new_v4().to_string();
    let created = sqlx::query("INSERT INTO chats (id, created_at) VALUES ($1, $2)")
        .bind(&chat_id)
        .bind(now_iso())
        .execute(&state.db)
        .await;
    if let Err(err) = created {
        eprintln!("[chat] failed to create chat: {err}");
        return None;
    }
    Some((chat_id.clone(), Some(chat_set_cookie(&chat_id))))
}

// --- Engagement state ---

async fn engagement_row(pool: &PgPool, chat_id: &str) -> (EngagementState, i64, Option<DateTime<Utc>>) {
    let row = sqlx::query(
        "SELECT state, nudge_count, last_nudge_at FROM engagement WHERE chat_id = $1",
    )
    .bind(chat_id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten();
    match row {
        Some(row) => (
            EngagementState::parse(&row.get::<String, _>("state")),
            row.get::<i32, _>("nudge_count") as i64,
            row.get::<Option<String>, _>("last_nudge_at")
                .as_deref()
                .and_then(parse_iso),
        ),
        None => (EngagementState::IdleNew, 0, None),
    }
}

async fn apply_engagement_event(pool: &PgPool, chat_id: &str, event: EngagementEvent) {
    let (state, _, _) = engagement_row(pool, chat_id).await;
    let next = state.apply(event);
    let _ = sqlx::query(
        r#"
        INSERT INTO engagement (chat_id, state, nudge_count, last_nudge_at, updated_at)
        VALUES ($1, $2, 0, NULL, $3)
        ON CONFLICT (chat_id) DO UPDATE SET
            state = EXCLUDED.state,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(chat_id)
    .bind(next.as_str())
    .bind(now_iso())
    .execute(pool)
    .await;
}

async fn record_nudge(pool: &PgPool, chat_id: &str) {
    let now = now_iso();
    let _ = sqlx::query(
        r#"
        INSERT INTO engagement (chat_id, state, nudge_count, last_nudge_at, updated_at)
        VALUES ($1, $2, 1, $3, $3)
        ON CONFLICT (chat_id) DO UPDATE SET
            nudge_count = engagement.nudge_count + 1,
            last_nudge_at = EXCLUDED.last_nudge_at,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(chat_id)
    .bind(EngagementState::Greeted.as_str())
    .bind(&now)
    .execute(pool)
    .await;
}

// --- Conversation persistence & replay ---

async fn persist_message(pool: &PgPool, message: &ChatMessage) {
    let _ = sqlx::query(
        r#"
        INSERT INTO messages (id, chat_id, role, content, created_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(&message.id)
    .bind(&message.chat_id)
    .bind(&message.role)
    .bind(&message.content)
    .bind(&message.created_at)
    .execute(pool)
    .await;
}

async fn chat_messages_db(pool: &PgPool, chat_id: &str) -> Vec<ChatMessage> {
    sqlx::query(
        "SELECT id, chat_id, role, content, created_at FROM messages \
         WHERE chat_id = $1 ORDER BY created_at ASC",
    )
    .bind(chat_id)
    .fetch_all(pool)
    .await
    .unwrap_or_default()
    .into_iter()
    .map(|row| ChatMessage {
        id: row.get("id"),
        chat_id: row.get("chat_id"),
        role: row.get("role"),
        content: row.get("content"),
        created_at: row.get("created_at"),
    })
    .collect()
}

async fn append_message(
    state: &Arc<AppState>,
    chat_id: &str,
    role: &str,
    content: &str,
) -> Option<ChatMessage> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }
    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        chat_id: chat_id.to_string(),
        role: role.to_string(),
        content: trimmed.to_string(),
        created_at: now_iso(),
    };
    persist_message(&state.db, &message).await;
    emit_to_chat(state, chat_id, "message:new", message.clone()).await;
    Some(message)
}

/// Replay shape for the widget: consecutive duplicate form markers collapse
/// so only the most recent survives, and each surviving marker carries the
/// display language of the nearest preceding user message.
fn replay_messages(messages: &[ChatMessage], page_locale: Locale) -> Vec<ReplayMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for (index, message) in messages.iter().enumerate() {
        if message.content == CONTACT_FORM_MARKER {
            let next_is_marker = messages
                .get(index + 1)
                .map(|next| next.content == CONTACT_FORM_MARKER)
                .unwrap_or(false);
            if next_is_marker {
                continue;
            }
        }
        let lang = if message.content == CONTACT_FORM_MARKER
            || message.content == RATING_PROMPT_MARKER
        {
            let locale = messages[..index]
                .iter()
                .rev()
                .find(|m| m.role == ROLE_USER)
                .map(|m| detect_language(&m.content, page_locale))
                .unwrap_or(page_locale);
            Some(locale.as_str().to_string())
        } else {
            None
        };
        out.push(ReplayMessage {
            id: message.id.clone(),
            role: message.role.clone(),
            content: message.content.clone(),
            created_at: message.created_at.clone(),
            lang,
        });
    }
    out
}

async fn seed_greeting_if_empty(state: &Arc<AppState>, chat_id: &str, locale: Locale) -> bool {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM messages WHERE chat_id = $1")
        .bind(chat_id)
        .fetch_one(&state.db)
        .await
        .unwrap_or(0);
    if count > 0 {
        return false;
    }
    let t = translations(locale);
    let _ = append_message(state, chat_id, ROLE_ASSISTANT, t.chat_greeting).await;
    let _ = append_message(state, chat_id, ROLE_ASSISTANT, CONTACT_FORM_MARKER).await;
    apply_engagement_event(&state.db, chat_id, EngagementEvent::GreetingSeeded).await;
    true
}

// --- Leads ---

async fn lead_for_chat(pool: &PgPool, chat_id: &str) -> Option<Lead> {
    let row = sqlx::query(
        "SELECT id, chat_id, email, phone, name, locale, first_message, created_at \
         FROM leads WHERE chat_id = $1 LIMIT 1",
    )
    .bind(chat_id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()?;
    Some(Lead {
        id: row.get("id"),
        chat_id: row.get("chat_id"),
        email: row.get("email"),
        phone: row.get("phone"),
        name: row.get("name"),
        locale: row.get("locale"),
        first_message: row.get("first_message"),
        created_at: row.get("created_at"),
    })
}

/// Inserts the chat's lead on first contact (and fires the notification),
/// or fills only still-empty fields on later contacts. Existing values are
/// never overwritten.
async fn upsert_lead(
    state: &Arc<AppState>,
    chat_id: &str,
    contact: &ContactInfo,
    name: Option<&str>,
    locale: Locale,
    first_message: &str,
) {
    let existing = lead_for_chat(&state.db, chat_id).await;
    match existing {
        None => {
            let inserted = sqlx::query(
                r#"
                INSERT INTO leads (id, chat_id, email, phone, name, locale, first_message, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(chat_id)
            .bind(&contact.email)
            .bind(&contact.phone)
            .bind(name)
            .bind(locale.as_str())
            .bind(first_message)
            .bind(now_iso())
            .execute(&state.db)
            .await;
            if let Err(err) = inserted {
                eprintln!("[lead] insert failed: {err}");
                return;
            }
            apply_engagement_event(&state.db, chat_id, EngagementEvent::LeadCaptured).await;
            if let Some(telegram) = state.config.telegram.clone() {
                let text = lead_notification_text(
                    chat_id,
                    name,
                    contact.email.as_deref(),
                    contact.phone.as_deref(),
                    first_message,
                );
                let client = state.ai_client.clone();
                tokio::spawn(async move {
                    send_telegram_message(&client, &telegram, &text).await;
                });
            }
        }
        Some(lead) => {
            let email = if lead.email.as_deref().unwrap_or("").is_empty() {
                contact.email.as_deref()
            } else {
                None
            };
            let phone = if lead.phone.as_deref().unwrap_or("").is_empty() {
                contact.phone.as_deref()
            } else {
                None
            };
            let name = if lead.name.as_deref().unwrap_or("").is_empty() {
                name
            } else {
                None
            };
            if email.is_none() && phone.is_none() && name.is_none() {
                return;
            }
            let _ = sqlx::query(
                r#"
                UPDATE leads SET
                    email = COALESCE($2, email),
                    phone = COALESCE($3, phone),
                    name = COALESCE($4, name)
                WHERE id = $1
                "#,
            )
            .bind(&lead.id)
            .bind(email)
            .bind(phone)
            .bind(name)
            .execute(&state.db)
            .await;
        }
    }
}

// --- Generative model ---

async fn gemini_generate_text(
    state: &Arc<AppState>,
    system: &str,
    history: &[(String, String)],
    user: &str,
) -> Result<String, String> {
    let api_key = state.config.ai_api_key.trim();
    if api_key.is_empty() {
        return Err("GOOGLE_API_KEY not configured".to_string());
    }
    let mut contents = Vec::with_capacity(history.len() + 1);
    for (role, content) in history {
        let model_role = if role == ROLE_ASSISTANT { "model" } else { "user" };
        contents.push(json!({ "role": model_role, "parts": [{ "text": content }] }));
    }
    contents.push(json!({ "role": "user", "parts": [{ "text": user }] }));

    let url = format!(
        "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent?key={api_key}"
    );
    let response = state
        .ai_client
        .post(&url)
        .json(&json!({
            "systemInstruction": { "parts": [{ "text": system }] },
            "contents": contents,
            "generationConfig": { "temperature": 0.4 }
        }))
        .send()
        .await
        .map_err(|err| format!("gemini request failed: {err}"))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("gemini returned {status}: {body}"));
    }
    let payload = response
        .json::<Value>()
        .await
        .map_err(|err| format!("gemini parse failed: {err}"))?;
    let text = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .and_then(|parts| parts.first())
        .and_then(|part| part.get("text"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string();
    if text.is_empty() {
        return Err("gemini response had empty content".to_string());
    }
    Ok(text)
}

// --- Rating prompt ---

fn contact_links_present(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("t.me/oleksiy_zhyvotivskyi")
        || lowered.contains("viber://chat?number")
        || lowered.contains("m.me/61559794323482")
}

/// Appends the rating prompt after the first assistant reply that hands out
/// direct contact links. Once per chat: an in-memory one-shot set guards
/// same-process re-renders, a log check guards restarts.
async fn maybe_append_rating_prompt(state: &Arc<AppState>, chat_id: &str, assistant_text: &str) {
    if !contact_links_present(assistant_text) {
        return;
    }
    {
        let mut prompted = state.rating_prompted.lock().await;
        if !prompted.insert(chat_id.to_string()) {
            return;
        }
    }
    let already = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM messages WHERE chat_id = $1 AND content = $2",
    )
    .bind(chat_id)
    .bind(RATING_PROMPT_MARKER)
    .fetch_one(&state.db)
    .await
    .unwrap_or(0);
    if already > 0 {
        return;
    }
    let _ = append_message(state, chat_id, ROLE_ASSISTANT, RATING_PROMPT_MARKER).await;
}

// --- Realtime ---

fn event_payload<T: serde::Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

async fn emit_to_client<T: serde::Serialize>(
    state: &Arc<AppState>,
    client_id: usize,
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };
    let tx = {
        let rt = state.realtime.lock().await;
        rt.clients.get(&client_id).cloned()
    };
    if let Some(sender) = tx {
        let _ = sender.send(payload);
    }
}

async fn emit_to_chat<T: serde::Serialize>(
    state: &Arc<AppState>,
    chat_id: &str,
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };
    let senders = {
        let rt = state.realtime.lock().await;
        rt.chat_watchers
            .get(chat_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| rt.clients.get(id).cloned())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };
    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };
        if envelope.event.as_str() == "widget:join" {
            let Some(chat_id) = envelope.data.get("chatId").and_then(Value::as_str) else {
                continue;
            };
            if !chat_exists(&state.db, chat_id).await {
                continue;
            }
            {
                let mut rt = state.realtime.lock().await;
                if let Some(previous) = rt.watched_chat.insert(client_id, chat_id.to_string()) {
                    if let Some(set) = rt.chat_watchers.get_mut(&previous) {
                        set.remove(&client_id);
                    }
                }
                rt.chat_watchers
                    .entry(chat_id.to_string())
                    .or_default()
                    .insert(client_id);
            }
            let messages = chat_messages_db(&state.db, chat_id).await;
            emit_to_client(&state, client_id, "chat:history", messages).await;
        }
    }

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.remove(&client_id);
        if let Some(previous) = rt.watched_chat.remove(&client_id) {
            if let Some(set) = rt.chat_watchers.get_mut(&previous) {
                set.remove(&client_id);
            }
        }
        for watchers in rt.chat_watchers.values_mut() {
            watchers.remove(&client_id);
        }
    }

    send_task.abort();
}

// --- Handlers ---

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn widget_bootstrap(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LocaleQuery>,
) -> impl IntoResponse {
    let locale = Locale::parse_or_default(query.locale.as_deref().unwrap_or(""));
    let data = knowledge_for(locale);
    Json(json!({
        "workingHours": state.config.working_hours,
        "contact": data.contact,
        "nudge": {
            "firstDelayMs": state.config.nudge.first_delay_ms,
            "idleThresholdMs": state.config.nudge.idle_threshold_ms,
            "maxPerSession": state.config.nudge.max_per_session,
        }
    }))
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LocaleQuery>,
    headers: HeaderMap,
) -> Response {
    let locale = Locale::parse_or_default(query.locale.as_deref().unwrap_or(""));
    let Some((chat_id, set_cookie)) = get_or_create_chat(&state, &headers).await else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": "chat unavailable" })),
        )
            .into_response();
    };
    seed_greeting_if_empty(&state, &chat_id, locale).await;
    let messages = chat_messages_db(&state.db, &chat_id).await;
    let replay = replay_messages(&messages, locale);
    let response = Json(json!({
        "success": true,
        "data": { "chatId": chat_id, "messages": replay }
    }))
    .into_response();
    with_set_cookie(response, set_cookie)
}

async fn post_chat_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> Response {
    if body.text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "text is required" })),
        )
            .into_response();
    }
    let page_locale = Locale::parse_or_default(body.locale.as_deref().unwrap_or(""));
    let Some((chat_id, set_cookie)) = get_or_create_chat(&state, &headers).await else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": "chat unavailable" })),
        )
            .into_response();
    };

    let prior = chat_messages_db(&state.db, &chat_id).await;
    let Some(user_message) = append_message(&state, &chat_id, ROLE_USER, &body.text).await else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "unable to create message" })),
        )
            .into_response();
    };
    apply_engagement_event(&state.db, &chat_id, EngagementEvent::UserMessage).await;

    if let Some(contact) = extract_contact(&user_message.content) {
        upsert_lead(&state, &chat_id, &contact, None, page_locale, &user_message.content).await;
    }

    let reply_locale = detect_language(&user_message.content, page_locale);
    let t = translations(reply_locale);

    let docs = fetch_relevant_docs(&state.db, &user_message.content, reply_locale).await;
    let docs_block = render_docs_block(&docs);
    let knowledge_block = build_knowledge_block(reply_locale);
    let system = render_system_prompt(&SystemPromptContext {
        language: reply_locale.language_name(),
        knowledge_block: &knowledge_block,
        docs_block: &docs_block,
    });
    let history = prompt_history(&prior);

    let reply = match gemini_generate_text(&state, &system, &history, &user_message.content).await {
        Ok(text) => text,
        Err(err) => {
            eprintln!("[ai] generation failed for chat {chat_id}: {err}");
            let response = Json(json!({ "success": false, "error": t.ai_error_notice })).into_response();
            return with_set_cookie(response, set_cookie);
        }
    };

    let assistant = append_message(&state, &chat_id, ROLE_ASSISTANT, &reply).await;
    if let Some(assistant) = &assistant {
        maybe_append_rating_prompt(&state, &chat_id, &assistant.content).await;
    }

    let user_turns = prior.iter().filter(|m| m.role == ROLE_USER).count() + 1;
    let (engagement_state, _, _) = engagement_row(&state.db, &chat_id).await;
    let has_lead = lead_for_chat(&state.db, &chat_id).await.is_some();
    let mut ask_contact = false;
    if engagement_state != EngagementState::AwaitingContact
        && wants_contact_prompt(&user_message.content, user_turns, has_lead)
    {
        let _ = append_message(&state, &chat_id, ROLE_ASSISTANT, t.chat_contact_cta).await;
        let _ = append_message(&state, &chat_id, ROLE_ASSISTANT, CONTACT_FORM_MARKER).await;
        apply_engagement_event(&state.db, &chat_id, EngagementEvent::ContactPromptShown).await;
        ask_contact = true;
    }

    let response = Json(json!({
        "success": true,
        "data": { "response": reply, "askContact": ask_contact }
    }))
    .into_response();
    with_set_cookie(response, set_cookie)
}

async fn post_contact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ContactBody>,
) -> Response {
    let locale = Locale::parse_or_default(body.locale.as_deref().unwrap_or(""));
    let t = translations(locale);
    let Some(contact) = extract_contact(&body.value) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": t.chat_contact_invalid })),
        )
            .into_response();
    };
    let Some((chat_id, set_cookie)) = get_or_create_chat(&state, &headers).await else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": "chat unavailable" })),
        )
            .into_response();
    };
    upsert_lead(
        &state,
        &chat_id,
        &contact,
        body.name.as_deref(),
        locale,
        &body.value,
    )
    .await;
    let response = Json(json!({ "success": true })).into_response();
    with_set_cookie(response, set_cookie)
}

async fn get_lead(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let Some(chat_id) = existing_chat(&state, &headers).await else {
        return Json(json!({ "success": true, "data": { "hasLead": false } }));
    };
    let lead = lead_for_chat(&state.db, &chat_id).await;
    Json(json!({
        "success": true,
        "data": {
            "hasLead": lead.is_some(),
            "email": lead.as_ref().and_then(|l| l.email.clone()),
            "phone": lead.as_ref().and_then(|l| l.phone.clone()),
        }
    }))
}

async fn get_meta(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let Some(chat_id) = existing_chat(&state, &headers).await else {
        return Json(json!({ "success": true, "data": { "hasChat": false } }));
    };
    let has_lead = lead_for_chat(&state.db, &chat_id).await.is_some();
    let last = sqlx::query(
        "SELECT role, created_at FROM messages WHERE chat_id = $1 \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(&chat_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    Json(json!({
        "success": true,
        "data": {
            "hasChat": true,
            "chatId": chat_id,
            "hasLead": has_lead,
            "lastMessageAt": last.as_ref().map(|row| row.get::<String, _>("created_at")),
            "lastMessageRole": last.as_ref().map(|row| row.get::<String, _>("role")),
        }
    }))
}

async fn post_nudge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<NudgeBody>,
) -> impl IntoResponse {
    let Some(chat_id) = existing_chat(&state, &headers).await else {
        return Json(json!({ "success": true, "data": { "nudged": false } }));
    };
    let locale = Locale::parse_or_default(body.locale.as_deref().unwrap_or(""));
    let (_, nudge_count, last_nudge_at) = engagement_row(&state.db, &chat_id).await;
    let has_lead = lead_for_chat(&state.db, &chat_id).await.is_some();
    let last_message_at = sqlx::query_scalar::<_, String>(
        "SELECT created_at FROM messages WHERE chat_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(&chat_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()
    .as_deref()
    .and_then(parse_iso);

    let situation = NudgeSituation {
        nudge_count,
        last_nudge_at,
        last_message_at,
        has_lead,
        idle_for_ms: body.idle_for_ms.unwrap_or(0),
        since_load_ms: body.since_load_ms.unwrap_or(0),
    };
    if !plan_nudge(Utc::now(), &situation, &state.config.nudge) {
        return Json(json!({ "success": true, "data": { "nudged": false } }));
    }

    // A chat with no history gets the full greeting instead of a bare nudge.
    let nudged = if seed_greeting_if_empty(&state, &chat_id, locale).await {
        true
    } else {
        append_message(&state, &chat_id, ROLE_ASSISTANT, translations(locale).chat_nudge)
            .await
            .is_some()
    };
    if nudged {
        record_nudge(&state.db, &chat_id).await;
    }
    Json(json!({ "success": true, "data": { "nudged": nudged } }))
}

async fn post_feedback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<FeedbackBody>,
) -> Response {
    if body.rating != 1 && body.rating != 5 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "rating must be 1 or 5" })),
        )
            .into_response();
    }
    let Some(chat_id) = existing_chat(&state, &headers).await else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "No chat session" })),
        )
            .into_response();
    };
    let inserted = sqlx::query(
        "INSERT INTO chat_feedback (id, chat_id, rating, created_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&chat_id)
    .bind(body.rating as i32)
    .bind(now_iso())
    .execute(&state.db)
    .await;
    if let Err(err) = inserted {
        eprintln!("[feedback] insert failed: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": "failed to save feedback" })),
        )
            .into_response();
    }
    (StatusCode::CREATED, Json(json!({ "success": true }))).into_response()
}

async fn export_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ExportQuery>,
) -> Response {
    let Some(chat_id) = existing_chat(&state, &headers).await else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "No chat session" })),
        )
            .into_response();
    };
    let rows = sqlx::query(
        "SELECT id, chat_id, role, content, created_at FROM messages \
         WHERE chat_id = $1 ORDER BY created_at ASC",
    )
    .bind(&chat_id)
    .fetch_all(&state.db)
    .await;
    let messages = match rows {
        Ok(rows) => rows
            .into_iter()
            .map(|row| ChatMessage {
                id: row.get("id"),
                chat_id: row.get("chat_id"),
                role: row.get("role"),
                content: row.get("content"),
                created_at: row.get("created_at"),
            })
            .collect::<Vec<_>>(),
        Err(err) => {
            eprintln!("[export] fetch failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to read chat" })),
            )
                .into_response();
        }
    };

    let format = ExportFormat::parse(query.format.as_deref().unwrap_or("json"));
    let body = render(format, &chat_id, &messages);
    let filename = format!(
        "{}.{}",
        export_filename_base(&chat_id, Utc::now()),
        format.extension()
    );
    let mut response = body.into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(format.content_type()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

// --- Marketing pages ---

async fn home_page(State(state): State<Arc<AppState>>, Path(locale): Path<String>) -> Response {
    let Some(locale) = Locale::parse(&locale) else {
        return Redirect::temporary(&format!("/{}", Locale::DEFAULT.as_str())).into_response();
    };
    match render_home(locale, &state.config.working_hours) {
        Ok(html) => Html(html).into_response(),
        Err(err) => {
            eprintln!("[pages] home render failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn pricing_page(State(state): State<Arc<AppState>>, Path(locale): Path<String>) -> Response {
    let Some(locale) = Locale::parse(&locale) else {
        return Redirect::temporary(&format!("/{}/pricing", Locale::DEFAULT.as_str()))
            .into_response();
    };
    match render_pricing(locale, &state.config.working_hours) {
        Ok(html) => Html(html).into_response(),
        Err(err) => {
            eprintln!("[pages] pricing render failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// --- Locale middleware ---

fn negotiate_locale(headers: &HeaderMap) -> Locale {
    let Some(raw) = headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
    else {
        return Locale::DEFAULT;
    };
    raw.split(',')
        .filter_map(|entry| {
            let tag = entry.split(';').next()?.trim();
            let primary = tag.split('-').next()?;
            Locale::parse(primary)
        })
        .next()
        .unwrap_or(Locale::DEFAULT)
}

fn path_is_exempt(path: &str) -> bool {
    if path.starts_with("/api")
        || path.starts_with("/ws")
        || path.starts_with("/health")
        || path.starts_with("/static")
    {
        return true;
    }
    path.rsplit('/')
        .next()
        .map(|seg| seg.contains('.'))
        .unwrap_or(false)
}

fn path_has_locale(path: &str) -> bool {
    Locale::ALL.iter().any(|locale| {
        let prefix = format!("/{}", locale.as_str());
        path == prefix || path.starts_with(&format!("{prefix}/"))
    })
}

async fn locale_redirect(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    if path_is_exempt(&path) || path_has_locale(&path) {
        return next.run(request).await;
    }
    let locale = negotiate_locale(request.headers());
    let target = if path == "/" {
        format!("/{}", locale.as_str())
    } else {
        format!("/{}{}", locale.as_str(), path)
    };
    Redirect::temporary(&target).into_response()
}

// --- Startup ---

pub async fn run() {
    let _ = dotenvy::dotenv();

    let config = resolve_config();
    verify_knowledge().expect("site knowledge is incomplete");
    if config.ai_api_key.is_empty() {
        eprintln!("[startup] GOOGLE_API_KEY/GEMINI_API_KEY not set; chat replies will fail");
    }
    if config.telegram.is_none() {
        eprintln!("[startup] telegram notifications disabled (no TELEGRAM_BOT_TOKEN/TELEGRAM_CHAT_ID)");
    }

    let database_url = resolve_database_url();
    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let port = config.port;
    let state = Arc::new(AppState {
        db,
        realtime: Mutex::new(RealtimeState::default()),
        next_client_id: AtomicUsize::new(0),
        ai_client: reqwest::Client::new(),
        config,
        rating_prompted: Mutex::new(Default::default()),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/widget/bootstrap", get(widget_bootstrap))
        .route("/api/chat/history", get(get_history))
        .route("/api/chat/message", post(post_chat_message))
        .route("/api/chat/contact", post(post_contact))
        .route("/api/chat/lead", get(get_lead))
        .route("/api/chat/meta", get(get_meta))
        .route("/api/chat/nudge", post(post_nudge))
        .route("/api/chat/feedback", post(post_feedback))
        .route("/api/chat/export", get(export_chat))
        .route("/ws", get(ws_handler))
        .route("/{locale}", get(home_page))
        .route("/{locale}/pricing", get(pricing_page))
        .layer(middleware::from_fn(locale_redirect))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    println!("webimpuls server running at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str, created_at: &str) -> ChatMessage {
        ChatMessage {
            id: format!("id-{created_at}"),
            chat_id: "chat-1".to_string(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: created_at.to_string(),
        }
    }

    #[test]
    fn replay_collapses_consecutive_form_markers() {
        let messages = vec![
            msg(ROLE_ASSISTANT, "Привіт!", "2026-02-01T09:00:00+00:00"),
            msg(ROLE_ASSISTANT, CONTACT_FORM_MARKER, "2026-02-01T09:00:01+00:00"),
            msg(ROLE_ASSISTANT, CONTACT_FORM_MARKER, "2026-02-01T09:00:02+00:00"),
            msg(ROLE_USER, "Скільки коштує лендінг?", "2026-02-01T09:01:00+00:00"),
        ];
        let replay = replay_messages(&messages, Locale::En);
        let markers: Vec<_> = replay
            .iter()
            .filter(|m| m.content == CONTACT_FORM_MARKER)
            .collect();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].id, "id-2026-02-01T09:00:02+00:00");
        assert_eq!(replay.len(), 3);
    }

    #[test]
    fn replay_marker_language_comes_from_nearest_user_message() {
        let messages = vec![
            msg(ROLE_USER, "Ile kosztuje strona internetowa?", "2026-02-01T09:00:00+00:00"),
            msg(ROLE_ASSISTANT, "Strona: $2,500 - $5,000.", "2026-02-01T09:00:01+00:00"),
            msg(ROLE_ASSISTANT, CONTACT_FORM_MARKER, "2026-02-01T09:00:02+00:00"),
        ];
        let replay = replay_messages(&messages, Locale::Ua);
        assert_eq!(replay[2].lang.as_deref(), Some("pl"));
    }

    #[test]
    fn replay_marker_without_user_context_uses_page_locale() {
        let messages = vec![
            msg(ROLE_ASSISTANT, "Hi!", "2026-02-01T09:00:00+00:00"),
            msg(ROLE_ASSISTANT, CONTACT_FORM_MARKER, "2026-02-01T09:00:01+00:00"),
        ];
        let replay = replay_messages(&messages, Locale::De);
        assert_eq!(replay[1].lang.as_deref(), Some("de"));
        assert_eq!(replay[0].lang, None);
    }

    #[test]
    fn contact_links_detection_matches_official_channels() {
        assert!(contact_links_present("Write us: https://t.me/oleksiy_zhyvotivskyi"));
        assert!(contact_links_present("viber://chat?number=%2B48512686628"));
        assert!(!contact_links_present("Лендінг коштує $800 - $1,500."));
    }

    #[test]
    fn cookie_parsing_and_issuing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; chat_id=abc-123; other=1"),
        );
        assert_eq!(cookie_value(&headers, CHAT_COOKIE).as_deref(), Some("abc-123"));
        assert_eq!(cookie_value(&headers, "missing"), None);

        let cookie = chat_set_cookie("abc-123");
        assert!(cookie.starts_with("chat_id=abc-123"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Max-Age=2592000"));
        assert!(cookie.contains("Path=/"));
    }

    #[test]
    fn locale_negotiation_prefers_first_supported_tag() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("fr-FR,pl;q=0.9,en;q=0.8"),
        );
        assert_eq!(negotiate_locale(&headers), Locale::Pl);
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("uk-UA,ru;q=0.9"),
        );
        assert_eq!(negotiate_locale(&headers), Locale::Ua);
        assert_eq!(negotiate_locale(&HeaderMap::new()), Locale::Ua);
    }

    #[test]
    fn middleware_path_rules() {
        assert!(path_is_exempt("/api/chat/history"));
        assert!(path_is_exempt("/ws"));
        assert!(path_is_exempt("/static/logo.svg"));
        assert!(path_is_exempt("/favicon.ico"));
        assert!(!path_is_exempt("/pricing"));
        assert!(path_has_locale("/ua"));
        assert!(path_has_locale("/de/pricing"));
        assert!(!path_has_locale("/uapricing"));
        assert!(!path_has_locale("/fr/pricing"));
    }
}
