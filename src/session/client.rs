//! HTTP client for the collection backend
//!
//! Session creation, batched analysis upload and the user-settings fetch.
//! Each call is a single request; nothing here retries.

use reqwest::header;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::{AnalysisEntry, SessionId, SessionRequest, UserSettings};
use crate::config::BackendConfig;
use crate::error::SessionError;

pub struct SessionClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    user_id: Option<i64>,
}

impl SessionClient {
    pub fn new(config: &BackendConfig) -> Result<Self, SessionError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| SessionError::Client(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            user_id: config.user_id,
        })
    }

    pub fn user_id(&self) -> Option<i64> {
        self.user_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.header(header::COOKIE, format!("token={}", token)),
            None => request,
        }
    }

    /// `POST /createSession`. The caller identity is attached when configured
    /// and the request does not carry one already.
    pub async fn create_session(&self, request: &SessionRequest) -> Result<SessionId, SessionError> {
        let mut body = request.clone();
        if body.user_id.is_none() {
            body.user_id = self.user_id;
        }

        let response = self
            .authorize(self.http.post(self.url("createSession")))
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::SessionCreateFailed(e.to_string()))?;

        if !response.status().is_success() {
            let message = failure_message(response, "Failed to create session").await;
            return Err(SessionError::SessionCreateFailed(message));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| SessionError::SessionCreateFailed(format!("Invalid response: {}", e)))?;

        let id = parse_session_id(&payload).ok_or_else(|| {
            SessionError::SessionCreateFailed(format!("Response carries no session id: {}", payload))
        })?;
        tracing::info!("Created session {} ({})", id, request.name);
        Ok(id)
    }

    /// `POST /updateSessionAnalysis` with the whole batch. Returns the
    /// backend's confirmation message.
    pub async fn upload_analysis(&self, entries: &[AnalysisEntry]) -> Result<String, SessionError> {
        if entries.is_empty() {
            return Err(SessionError::EmptyBuffer);
        }

        let response = self
            .authorize(self.http.post(self.url("updateSessionAnalysis")))
            .json(entries)
            .send()
            .await
            .map_err(|e| SessionError::UploadFailed(e.to_string()))?;

        if !response.status().is_success() {
            let message = failure_message(response, "Failed to upload analysis data").await;
            return Err(SessionError::UploadFailed(message));
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| message_field(&v))
            .unwrap_or_else(|| "Analysis data uploaded".to_string());
        tracing::info!("Uploaded {} analysis entries: {}", entries.len(), message);
        Ok(message)
    }

    /// `GET /getUserSettings[?user_id=]`
    pub async fn fetch_user_settings(&self) -> Result<UserSettings, SessionError> {
        let mut request = self.http.get(self.url("getUserSettings"));
        if let Some(id) = self.user_id {
            request = request.query(&[("user_id", id)]);
        }

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| SessionError::SettingsFetch(e.to_string()))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(SessionError::SettingsFetch("Not signed in".to_string()));
        }
        if !response.status().is_success() {
            let message = failure_message(response, "Failed to fetch user settings").await;
            return Err(SessionError::SettingsFetch(message));
        }

        response
            .json::<UserSettings>()
            .await
            .map_err(|e| SessionError::SettingsFetch(format!("Invalid settings: {}", e)))
    }
}

/// Accepts `sessionId`, `sessionID` or `id`, as a number or numeric string
pub fn parse_session_id(payload: &Value) -> Option<SessionId> {
    ["sessionId", "sessionID", "id"]
        .iter()
        .filter_map(|key| payload.get(*key))
        .find_map(|value| match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        })
        .map(SessionId)
}

#[derive(Deserialize)]
struct MessageBody {
    message: Option<String>,
    error: Option<String>,
}

fn message_field(value: &Value) -> Option<String> {
    let body: MessageBody = serde_json::from_value(value.clone()).ok()?;
    body.message
        .or(body.error)
        .filter(|m| !m.trim().is_empty())
}

/// Backend-provided detail from an error response, or `fallback` with the
/// status when the body is empty.
async fn failure_message(response: Response, fallback: &str) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    if let Some(message) = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| message_field(&v))
    {
        return message;
    }

    let text = text.trim();
    if text.is_empty() {
        format!("{} (HTTP {})", fallback, status.as_u16())
    } else {
        text.to_string()
    }
}
