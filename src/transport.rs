//! Seams to the three external collaborators of the bridge, with HTTP
//! implementations for each.

use crate::model::AgoraEnvelope;
use crate::session::{AccessToken, SessionTokens};
use crate::{BridgeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

pub const POST_COLLECTION: &str = "app.bsky.feed.post";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationOutcome {
    #[serde(default)]
    pub schema: Value,
    #[serde(default)]
    pub version: Option<String>,
}

/// Produces a schema for a task description. May be slow.
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn negotiate(&self, description: &str) -> Result<NegotiationOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRef {
    pub uri: String,
    pub cid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mention {
    pub uri: String,
    pub cid: String,
    pub author_did: String,
    pub author_handle: String,
    pub text: String,
    pub indexed_at: DateTime<Utc>,
}

#[async_trait]
pub trait SocialTransport: Send + Sync {
    async fn authenticate(&self, handle: &str, credential: &SecretString) -> Result<SessionTokens>;

    async fn refresh(&self, refresh_token: &SecretString) -> Result<SessionTokens>;

    async fn post(&self, token: &AccessToken, repo: &str, record: Value) -> Result<PostRef>;

    async fn get_timeline(
        &self,
        token: &AccessToken,
        algorithm: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Value>>;

    /// Mentions of the session's account indexed strictly after `since`.
    async fn get_mentions(
        &self,
        token: &AccessToken,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Mention>>;
}

#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn send(&self, endpoint: &str, envelope: &AgoraEnvelope) -> Result<Value>;
}

fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| BridgeError::Config(format!("failed to build HTTP client: {e}")))
}

fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

const AUTH_REJECTIONS: &[StatusCode] = &[StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN];

/// Send a request and decode a JSON body. Statuses in `auth_rejections` map
/// to `Auth`, every other failure to `Delivery`.
async fn send_json<T: serde::de::DeserializeOwned>(
    request: RequestBuilder,
    what: &str,
    auth_rejections: &[StatusCode],
) -> Result<T> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| BridgeError::Delivery(format!("{what}: malformed response: {e}")));
    }

    let body = response.text().await.unwrap_or_default();
    if auth_rejections.contains(&status) {
        Err(BridgeError::Auth(format!("{what}: {status} {body}")))
    } else {
        Err(BridgeError::Delivery(format!("{what}: {status} {body}")))
    }
}

/// Negotiates protocols with an Agora agent over `POST <endpoint>/negotiate`.
#[derive(Debug, Clone)]
pub struct HttpNegotiator {
    client: Client,
    endpoint: String,
}

impl HttpNegotiator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Negotiator for HttpNegotiator {
    async fn negotiate(&self, description: &str) -> Result<NegotiationOutcome> {
        let request = self
            .client
            .post(join(&self.endpoint, "negotiate"))
            .json(&json!({ "description": description }));
        send_json(request, "negotiate", AUTH_REJECTIONS).await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    did: String,
    handle: String,
    access_jwt: String,
    refresh_jwt: String,
}

impl From<SessionResponse> for SessionTokens {
    fn from(response: SessionResponse) -> Self {
        SessionTokens {
            did: response.did,
            handle: response.handle,
            access_jwt: SecretString::from(response.access_jwt),
            refresh_jwt: SecretString::from(response.refresh_jwt),
        }
    }
}

#[derive(Deserialize)]
struct TimelineResponse {
    #[serde(default)]
    feed: Vec<Value>,
}

#[derive(Deserialize)]
struct NotificationsResponse {
    #[serde(default)]
    notifications: Vec<Notification>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Notification {
    uri: String,
    cid: String,
    author: NotificationAuthor,
    reason: String,
    #[serde(default)]
    record: Value,
    indexed_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct NotificationAuthor {
    did: String,
    handle: String,
}

/// AT Protocol client speaking XRPC to a PDS.
#[derive(Debug, Clone)]
pub struct XrpcClient {
    client: Client,
    service_url: String,
    notification_limit: u32,
}

impl XrpcClient {
    pub fn new(service_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            service_url: service_url.into(),
            notification_limit: 50,
        })
    }

    fn xrpc(&self, method: &str) -> String {
        join(&self.service_url, &format!("xrpc/{method}"))
    }
}

#[async_trait]
impl SocialTransport for XrpcClient {
    async fn authenticate(&self, handle: &str, credential: &SecretString) -> Result<SessionTokens> {
        let request = self
            .client
            .post(self.xrpc("com.atproto.server.createSession"))
            .json(&json!({
                "identifier": handle,
                "password": credential.expose_secret(),
            }));

        // The PDS answers bad credentials with 400 as well as 401.
        let rejections = [StatusCode::BAD_REQUEST, StatusCode::UNAUTHORIZED];
        let session: SessionResponse = send_json(request, "createSession", &rejections).await?;
        Ok(session.into())
    }

    async fn refresh(&self, refresh_token: &SecretString) -> Result<SessionTokens> {
        let request = self
            .client
            .post(self.xrpc("com.atproto.server.refreshSession"))
            .bearer_auth(refresh_token.expose_secret());
        let rejections = [StatusCode::BAD_REQUEST, StatusCode::UNAUTHORIZED];
        let session: SessionResponse = send_json(request, "refreshSession", &rejections).await?;
        Ok(session.into())
    }

    async fn post(&self, token: &AccessToken, repo: &str, record: Value) -> Result<PostRef> {
        let request = self
            .client
            .post(self.xrpc("com.atproto.repo.createRecord"))
            .bearer_auth(token.expose_secret())
            .json(&json!({
                "repo": repo,
                "collection": POST_COLLECTION,
                "record": record,
            }));
        send_json(request, "createRecord", AUTH_REJECTIONS).await
    }

    async fn get_timeline(
        &self,
        token: &AccessToken,
        algorithm: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Value>> {
        let mut request = self
            .client
            .get(self.xrpc("app.bsky.feed.getTimeline"))
            .bearer_auth(token.expose_secret())
            .query(&[("limit", limit.to_string())]);
        if let Some(algorithm) = algorithm {
            request = request.query(&[("algorithm", algorithm)]);
        }

        let timeline: TimelineResponse = send_json(request, "getTimeline", AUTH_REJECTIONS).await?;
        Ok(timeline.feed)
    }

    async fn get_mentions(
        &self,
        token: &AccessToken,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Mention>> {
        let request = self
            .client
            .get(self.xrpc("app.bsky.notification.listNotifications"))
            .bearer_auth(token.expose_secret())
            .query(&[("limit", self.notification_limit.to_string())]);
        let response: NotificationsResponse = send_json(request, "listNotifications", AUTH_REJECTIONS).await?;

        let mut mentions: Vec<Mention> = response
            .notifications
            .into_iter()
            .filter(|n| n.reason == "mention")
            .filter(|n| since.map_or(true, |since| n.indexed_at > since))
            .map(|n| Mention {
                text: n
                    .record
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                uri: n.uri,
                cid: n.cid,
                author_did: n.author.did,
                author_handle: n.author.handle,
                indexed_at: n.indexed_at,
            })
            .collect();
        // listNotifications is newest first; deliver oldest first.
        mentions.sort_by_key(|m| m.indexed_at);
        Ok(mentions)
    }
}

#[derive(Deserialize)]
struct AgoraReply {
    status: String,
    #[serde(default)]
    body: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Delivers envelopes to Agora agents over `POST <endpoint>/message`.
#[derive(Debug, Clone)]
pub struct AgoraHttpClient {
    client: Client,
}

impl AgoraHttpClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl AgentTransport for AgoraHttpClient {
    async fn send(&self, endpoint: &str, envelope: &AgoraEnvelope) -> Result<Value> {
        let request = self.client.post(join(endpoint, "message")).json(envelope);
        let reply: AgoraReply = send_json(request, "agora message", AUTH_REJECTIONS).await?;

        if reply.status != "success" {
            return Err(BridgeError::Delivery(format!(
                "agent at {endpoint} answered {}: {}",
                reply.status,
                reply.error.unwrap_or_default()
            )));
        }
        Ok(reply.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_handles_slashes() {
        assert_eq!(join("https://pds.test/", "/xrpc/a"), "https://pds.test/xrpc/a");
        assert_eq!(join("https://pds.test", "message"), "https://pds.test/message");
    }

    #[test]
    fn test_session_response_wraps_tokens() {
        let response: SessionResponse = serde_json::from_value(json!({
            "did": "did:web:alice.example.test",
            "handle": "alice.example.test",
            "accessJwt": "access",
            "refreshJwt": "refresh",
            "email": "ignored@example.test"
        }))
        .unwrap();
        let tokens = SessionTokens::from(response);
        assert_eq!(tokens.access_jwt.expose_secret(), "access");
        assert!(!format!("{:?}", tokens).contains("access"));
    }

    #[test]
    fn test_negotiation_outcome_defaults() {
        let outcome: NegotiationOutcome =
            serde_json::from_value(json!({"id": "remote-id"})).unwrap();
        assert_eq!(outcome.schema, Value::Null);
        assert!(outcome.version.is_none());
    }
}
