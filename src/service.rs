//! Audited backend handlers
//!
//! Framework-agnostic request handlers for the message board backend.
//! Each handler takes the request session and a deserialized body and
//! returns a JSON value or an `ApiError` whose `status()` is the HTTP code.
//! Audit reporting happens inside the handlers and never changes their
//! result.

use crate::config::RECENT_CAPACITY;
use crate::error::ApiError;
use crate::facade::{Report, RequestAuditFacade};
use crate::session::{require_login, RequestSession, SessionRegistry, USER_ID_KEY};
use crate::store::{RecordStore, Row, FIND_USER, LIST_MESSAGES, MESSAGES, SEARCH_MESSAGES, USERS};
use crate::telemetry::{Telemetry, ATTR_CACHE_LEN, ATTR_MESSAGE_LENGTH, ATTR_USERNAME, ATTR_USER_ID};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub const REGISTER: &str = "/register";
pub const LOGIN: &str = "/login";
pub const LOGOUT: &str = "/logout";
pub const SAVE_MESSAGE: &str = "/db/message";
pub const LIST_MESSAGES_PATH: &str = "/db/messages";
pub const SEARCH_MESSAGES_PATH: &str = "/db/messages/search";
pub const RECENT_LOGS: &str = "/logs/redis";
pub const AUDIT_LOGS: &str = "/logs/kafka";

/// Characters of a message echoed into the activity log
const PREVIEW_CHARS: usize = 30;

pub type ApiResult = std::result::Result<Value, ApiError>;

/// Password hashing
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, password: &str) -> std::result::Result<String, ApiError>;
    fn verify(&self, password: &str, hashed: &str) -> bool;
}

/// Register and login body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
        }
    }

    fn required(&self) -> std::result::Result<(&str, &str), ApiError> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Ok((u, p)),
            _ => Err(ApiError::BadRequest(
                "Username and password are required".to_string(),
            )),
        }
    }
}

/// Save-message body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMessage {
    pub message: Option<String>,
}

/// First characters of a message, on a char boundary
fn preview(message: &str) -> String {
    message.chars().take(PREVIEW_CHARS).collect()
}

fn rows_to_json(rows: Vec<Row>) -> Value {
    Value::Array(rows.into_iter().map(Value::Object).collect())
}

fn to_json<T: serde::Serialize>(value: T) -> ApiResult {
    serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))
}

/// Message board backend
pub struct Backend {
    store: Arc<dyn RecordStore>,
    hasher: Arc<dyn PasswordHasher>,
    sessions: SessionRegistry,
    facade: RequestAuditFacade,
}

impl Backend {
    pub fn new(
        store: Arc<dyn RecordStore>,
        hasher: Arc<dyn PasswordHasher>,
        sessions: SessionRegistry,
        facade: RequestAuditFacade,
    ) -> Self {
        Self {
            store,
            hasher,
            sessions,
            facade,
        }
    }

    fn telemetry(&self) -> &Telemetry {
        self.facade.telemetry()
    }

    async fn reject(&self, report: Report, error: ApiError) -> ApiResult {
        self.facade.report(report).await;
        Err(error)
    }

    pub async fn register(&self, creds: &Credentials) -> ApiResult {
        let result = self.try_register(creds).await;
        if let Err(ref e) = result {
            tracing::warn!(status = e.status(), error = %e, "Registration rejected");
        }
        result
    }

    async fn try_register(&self, creds: &Credentials) -> ApiResult {
        let (username, password) = creds.required()?;
        let hashed = self.hasher.hash(password)?;

        let existing = self.store.query(FIND_USER, &[json!(username)]).await?;
        self.telemetry().db_operation("select", USERS);
        if !existing.is_empty() {
            return Err(ApiError::Conflict("Username already exists".to_string()));
        }

        let mut row = Row::new();
        row.insert("username".to_string(), json!(username));
        row.insert("password".to_string(), json!(hashed));
        self.store.insert(USERS, row).await?;
        self.telemetry().db_operation("insert", USERS);

        tracing::info!(username, "User registered");
        Ok(json!({"status": "success", "message": "Registration complete"}))
    }

    pub async fn login(&self, session: &dyn RequestSession, creds: &Credentials) -> ApiResult {
        self.telemetry()
            .with_span("login", async {
                if let Some(ref username) = creds.username {
                    Telemetry::annotate(ATTR_USERNAME, username.as_str());
                }

                let (username, password) = match creds.required() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let report = Report::failure(LOGIN, "POST", e.to_string());
                        return self.reject(report, e).await;
                    }
                };

                let users = match self.store.query(FIND_USER, &[json!(username)]).await {
                    Ok(users) => users,
                    Err(e) => {
                        let report = Report::failure(LOGIN, "POST", e.to_string());
                        let error = ApiError::Internal("Login processing failed".to_string());
                        return self.reject(report, error).await;
                    }
                };
                self.telemetry().db_operation("select", USERS);

                let verified = users
                    .first()
                    .and_then(|user| user.get("password"))
                    .and_then(Value::as_str)
                    .map(|hashed| self.hasher.verify(password, hashed))
                    .unwrap_or(false);

                if !verified {
                    tracing::warn!(username, "Failed login attempt");
                    let report = Report::failure(LOGIN, "POST", "Invalid credentials");
                    let error = ApiError::Unauthorized("Invalid credentials".to_string());
                    return self.reject(report, error).await;
                }

                session.set(USER_ID_KEY, username.to_string());
                self.sessions.open(username).await;
                self.facade
                    .report(Report::success(LOGIN, "POST").actor(Some(username)))
                    .await;

                Ok(json!({
                    "status": "success",
                    "message": "Login successful",
                    "username": username,
                }))
            })
            .await
    }

    pub async fn logout(&self, session: &dyn RequestSession) -> ApiResult {
        if let Some(actor) = session.get(USER_ID_KEY) {
            self.sessions.close(&actor).await;
            tracing::info!(actor = %actor, "User logged out");
        }
        session.clear();
        Ok(json!({"status": "success", "message": "Logout successful"}))
    }

    pub async fn save_message(&self, session: &dyn RequestSession, body: &NewMessage) -> ApiResult {
        let actor = require_login(session)?;

        self.telemetry()
            .with_span("save_message", async {
                Telemetry::annotate(ATTR_USER_ID, actor.as_str());

                let Some(message) = body.message.as_deref().filter(|m| !m.is_empty()) else {
                    let error = ApiError::BadRequest("Message is required".to_string());
                    let report = Report::failure(SAVE_MESSAGE, "POST", error.to_string())
                        .actor(Some(actor.as_str()))
                        .action("db_insert_error");
                    return self.reject(report, error).await;
                };
                Telemetry::annotate(ATTR_MESSAGE_LENGTH, message.chars().count());

                let mut row = Row::new();
                row.insert("message".to_string(), json!(message));
                row.insert("created_at".to_string(), json!(Utc::now().to_rfc3339()));

                if let Err(e) = self.store.insert(MESSAGES, row).await {
                    let report = Report::failure(SAVE_MESSAGE, "POST", e.to_string())
                        .actor(Some(actor.as_str()))
                        .action("db_insert_error");
                    return self.reject(report, e.into()).await;
                }
                self.telemetry().db_operation("insert", MESSAGES);

                let preview = preview(message);
                tracing::info!(actor = %actor, preview = %preview, "Message saved");
                self.facade
                    .report(
                        Report::success(SAVE_MESSAGE, "POST")
                            .actor(Some(actor.as_str()))
                            .action("db_insert")
                            .detail(format!("Message saved: {}...", preview)),
                    )
                    .await;

                Ok(json!({"status": "success"}))
            })
            .await
    }

    pub async fn list_messages(&self, session: &dyn RequestSession) -> ApiResult {
        let actor = require_login(session)?;
        self.messages_query(&actor, LIST_MESSAGES_PATH, LIST_MESSAGES, &[])
            .await
    }

    pub async fn search_messages(&self, session: &dyn RequestSession, query: &str) -> ApiResult {
        let actor = require_login(session)?;
        let pattern = json!(format!("%{}%", query));
        self.messages_query(&actor, SEARCH_MESSAGES_PATH, SEARCH_MESSAGES, &[pattern])
            .await
    }

    async fn messages_query(
        &self,
        actor: &str,
        operation: &str,
        sql: &str,
        params: &[Value],
    ) -> ApiResult {
        match self.store.query(sql, params).await {
            Ok(rows) => {
                self.telemetry().db_operation("select", MESSAGES);
                self.facade
                    .report(Report::success(operation, "GET").actor(Some(actor)))
                    .await;
                Ok(rows_to_json(rows))
            }
            Err(e) => {
                let report = Report::failure(operation, "GET", e.to_string()).actor(Some(actor));
                self.reject(report, e.into()).await
            }
        }
    }

    /// Recent-activity entries, newest first
    pub async fn recent_logs(&self) -> ApiResult {
        let result = self
            .telemetry()
            .with_span("get_redis_logs", async {
                let (len, entries) = self.facade.activity().snapshot(RECENT_CAPACITY).await?;
                Telemetry::annotate(ATTR_CACHE_LEN, len);
                to_json(entries)
            })
            .await;

        if let Err(ref e) = result {
            tracing::error!(endpoint = RECENT_LOGS, error = %e, "Failed to read recent activity");
        }
        result
    }

    /// Durable audit events, newest first
    pub async fn audit_logs(&self, session: &dyn RequestSession) -> ApiResult {
        require_login(session)?;

        match self.facade.publisher().drain_recent().await {
            Ok(events) => to_json(events),
            Err(e) => {
                tracing::error!(endpoint = AUDIT_LOGS, error = %e, "Failed to read audit events");
                Err(e.into())
            }
        }
    }
}
