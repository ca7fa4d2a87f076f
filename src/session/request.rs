//! Request plumbing for the RobustIRC HTTP API
//!
//! URL suffixes, session auth headers, and the wire bodies of the short
//! request/response calls. The URL suffix is the part after `host:port`
//! so that a request can be re-assembled against a new target on
//! failover.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RobustSessionError};

/// The kinds of HTTP requests a session issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    CreateSession,
    PostMessage,
    GetMessages,
    DeleteSession,
}

impl RequestKind {
    /// The URL path after `host:port` for this request kind.
    ///
    /// `session_id` is required for everything but CreateSession.
    pub(crate) fn url_suffix(self, session_id: Option<&str>) -> String {
        let sid = session_id.unwrap_or_default();
        match self {
            RequestKind::CreateSession => "/robustirc/v1/session".to_string(),
            RequestKind::PostMessage => format!("/robustirc/v1/{sid}/message"),
            RequestKind::GetMessages => format!("/robustirc/v1/{sid}/messages"),
            RequestKind::DeleteSession => format!("/robustirc/v1/{sid}"),
        }
    }
}

/// Response body of a successful CreateSession.
#[derive(Debug, Deserialize)]
pub(crate) struct CreateSessionResponse {
    #[serde(rename = "Sessionid")]
    pub(crate) sessionid: String,
    #[serde(rename = "Sessionauth")]
    pub(crate) sessionauth: String,
}

/// Request body of a PostMessage.
#[derive(Debug, Serialize)]
pub(crate) struct PostMessageBody<'a> {
    #[serde(rename = "Data")]
    pub(crate) data: &'a str,
    #[serde(rename = "ClientMessageId")]
    pub(crate) client_message_id: u64,
}

impl<'a> PostMessageBody<'a> {
    pub(crate) fn new(data: &'a str) -> Self {
        Self {
            data,
            client_message_id: client_message_id(data),
        }
    }
}

/// Compute the idempotence token for one logical outbound message.
///
/// The server deduplicates retries of the same PostMessage by this id,
/// so it must stay stable across retries (the body is built once per
/// logical message) but differ between separate sends of the same line.
/// A 32-bit hash of the line plus a random 32-bit offset keeps the value
/// comfortably within a signed 64-bit range on the server side.
pub(crate) fn client_message_id(data: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    let hash = hasher.finish() & u64::from(u32::MAX);
    hash + u64::from(rand::random::<u32>())
}

/// Build the headers sent on every request of an established session.
///
/// # Errors
///
/// Returns [`RobustSessionError::Session`] if the session auth token is
/// not a valid header value.
pub(crate) fn auth_headers(session_auth: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let auth = HeaderValue::from_str(session_auth).map_err(|err| {
        anyhow::anyhow!(RobustSessionError::Session(format!(
            "invalid session auth token: {err}"
        )))
    })?;
    headers.insert("X-Session-Auth", auth);
    Ok(headers)
}
