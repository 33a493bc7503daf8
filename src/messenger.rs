use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Body limit for plain-text sends.
pub const TEXT_LIMIT: usize = 4096;
/// Caption limit for media sends.
pub const CAPTION_LIMIT: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    Text { text: String },
    Video { file_id: String, caption: Option<String> },
    Document { file_id: String, caption: Option<String> },
}

impl Payload {
    pub fn body(&self) -> Option<&str> {
        match self {
            Payload::Text { text } => Some(text),
            Payload::Video { caption, .. } | Payload::Document { caption, .. } => {
                caption.as_deref()
            }
        }
    }

    pub fn body_limit(&self) -> usize {
        match self {
            Payload::Text { .. } => TEXT_LIMIT,
            Payload::Video { .. } | Payload::Document { .. } => CAPTION_LIMIT,
        }
    }

    pub fn is_media(&self) -> bool {
        !matches!(self, Payload::Text { .. })
    }

    /// Short body excerpt for audit entries.
    pub fn preview(&self) -> String {
        let body = self.body().unwrap_or(match self {
            Payload::Video { .. } => "<video>",
            Payload::Document { .. } => "<document>",
            Payload::Text { .. } => "",
        });

        body.chars().take(120).collect()
    }
}

/// One inline action button. Buttons sharing a `row` index render
/// together, in the order given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub target: String,
    #[serde(default)]
    pub row: u8,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ButtonAction<'a> {
    /// Opens an external link.
    Link(&'a str),
    /// Dispatches an application-internal command token.
    Command(&'a str),
}

impl Button {
    pub fn action(&self) -> ButtonAction<'_> {
        if self.target.contains("://") || self.target.starts_with('/') {
            ButtonAction::Link(&self.target)
        } else {
            ButtonAction::Command(&self.target)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
}

/// Groups buttons by row index, preserving per-row button order. Link and
/// command actions are mutually exclusive per button.
pub fn keyboard_rows(buttons: &[Button]) -> Vec<Vec<InlineKeyboardButton>> {
    let mut rows: BTreeMap<u8, Vec<InlineKeyboardButton>> = BTreeMap::new();

    for button in buttons {
        let entry = match button.action() {
            ButtonAction::Link(url) => InlineKeyboardButton {
                text: button.label.clone(),
                url: Some(url.to_owned()),
                callback_data: None,
            },
            ButtonAction::Command(token) => InlineKeyboardButton {
                text: button.label.clone(),
                url: None,
                callback_data: Some(token.to_owned()),
            },
        };

        rows.entry(button.row).or_default().push(entry);
    }

    rows.into_values().collect()
}

/// Per-recipient delivery failure, classified from the provider error
/// code. Blocked and invalid are terminal; anything else is an opaque
/// reason string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    Blocked,
    Invalid(String),
    Other(String),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Blocked => write!(f, "recipient blocked sender"),
            SendError::Invalid(description) => write!(f, "invalid request: {description}"),
            SendError::Other(reason) => write!(f, "{reason}"),
        }
    }
}

/// The outbound messaging capability consumed by the batch sender and the
/// unsend action. Implemented for the Telegram Bot API in production and
/// by a scripted fake in tests.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Delivers the payload to one user, returning the provider's message
    /// id on success.
    async fn send(
        &self,
        user_id: i64,
        payload: &Payload,
        buttons: &[Button],
    ) -> Result<i64, SendError>;

    /// Deletes a previously delivered message by its provider id.
    async fn delete(&self, user_id: i64, external_message_id: i64) -> Result<(), SendError>;
}

pub struct TelegramApi {
    client: Client,
    token: String,
}

impl TelegramApi {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            token: token.into(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.token, method)
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<ApiResponse, SendError> {
        let response = self
            .client
            .post(self.url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Other(e.to_string()))?;

        response
            .json::<ApiResponse>()
            .await
            .map_err(|e| SendError::Other(e.to_string()))
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    result: Option<ApiMessage>,
    error_code: Option<i64>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct ApiMessage {
    message_id: i64,
}

impl ApiResponse {
    fn into_message_id(self) -> Result<i64, SendError> {
        if self.ok {
            return self
                .result
                .map(|m| m.message_id)
                .ok_or_else(|| SendError::Other("provider response missing result".to_owned()));
        }

        let description = self.description.unwrap_or_default();
        match self.error_code {
            Some(403) => Err(SendError::Blocked),
            Some(400) => Err(SendError::Invalid(description)),
            _ => Err(SendError::Other(description)),
        }
    }
}

#[async_trait]
impl Messenger for TelegramApi {
    async fn send(
        &self,
        user_id: i64,
        payload: &Payload,
        buttons: &[Button],
    ) -> Result<i64, SendError> {
        let (method, mut body) = match payload {
            Payload::Text { text } => (
                "sendMessage",
                json!({ "chat_id": user_id, "text": text, "parse_mode": "HTML" }),
            ),
            Payload::Video { file_id, caption } => (
                "sendVideo",
                json!({
                    "chat_id": user_id,
                    "video": file_id,
                    "caption": caption,
                    "parse_mode": "HTML",
                }),
            ),
            Payload::Document { file_id, caption } => (
                "sendDocument",
                json!({
                    "chat_id": user_id,
                    "document": file_id,
                    "caption": caption,
                    "parse_mode": "HTML",
                }),
            ),
        };

        if !buttons.is_empty() {
            body["reply_markup"] = json!({ "inline_keyboard": keyboard_rows(buttons) });
        }

        self.call(method, body).await?.into_message_id()
    }

    async fn delete(&self, user_id: i64, external_message_id: i64) -> Result<(), SendError> {
        let body = json!({ "chat_id": user_id, "message_id": external_message_id });
        let response = self.call("deleteMessage", body).await?;

        if response.ok {
            Ok(())
        } else {
            let description = response.description.unwrap_or_default();
            match response.error_code {
                Some(403) => Err(SendError::Blocked),
                Some(400) => Err(SendError::Invalid(description)),
                _ => Err(SendError::Other(description)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn button(label: &str, target: &str, row: u8) -> Button {
        Button {
            label: label.to_owned(),
            target: target.to_owned(),
            row,
        }
    }

    #[test]
    fn buttons_group_by_row_in_order() {
        let rows = keyboard_rows(&[
            button("Docs", "https://example.com/docs", 1),
            button("Enroll", "enroll_basic", 0),
            button("Support", "contact_support", 0),
        ]);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0].callback_data.as_deref(), Some("enroll_basic"));
        assert_eq!(rows[0][1].callback_data.as_deref(), Some("contact_support"));
        assert_eq!(rows[1][0].url.as_deref(), Some("https://example.com/docs"));
    }

    #[test]
    fn link_and_command_targets_are_exclusive() {
        assert_eq!(
            button("a", "https://example.com", 0).action(),
            ButtonAction::Link("https://example.com")
        );
        assert_eq!(
            button("b", "/start", 0).action(),
            ButtonAction::Link("/start")
        );
        assert_eq!(
            button("c", "enroll_basic", 0).action(),
            ButtonAction::Command("enroll_basic")
        );

        let rows = keyboard_rows(&[button("a", "https://example.com", 0)]);
        assert!(rows[0][0].callback_data.is_none());
    }

    #[test]
    fn payload_limits_differ_by_kind() {
        let text = Payload::Text {
            text: "hi".to_owned(),
        };
        let video = Payload::Video {
            file_id: "f".to_owned(),
            caption: None,
        };

        assert_eq!(text.body_limit(), TEXT_LIMIT);
        assert_eq!(video.body_limit(), CAPTION_LIMIT);
        assert!(video.is_media());
        assert_eq!(video.preview(), "<video>");
    }
}
