//! The bridge between Agora agents and the AT Protocol network.
//!
//! Every public operation that can fail emits an [`EventKind::Error`] event
//! before returning the error.

use crate::events::{EventDispatcher, EventKind};
use crate::model::{
    normalize_description, Agent, AgoraEnvelope, BridgeMessage, Capability, DeliveryResult,
    NegotiatedProtocol, ProtocolSide,
};
use crate::registry::ProtocolRegistry;
use crate::session::{Session, SessionManager, SessionSettings};
use crate::transport::{AgentTransport, Mention, Negotiator, SocialTransport, POST_COLLECTION};
use crate::translate;
use crate::{BridgeError, Result};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use secrecy::SecretString;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_FEED_LIMIT: u32 = 50;
const MAX_FEED_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeTimeouts {
    pub negotiation: Duration,
    pub transport: Duration,
    pub auth: Duration,
}

impl Default for BridgeTimeouts {
    fn default() -> Self {
        Self {
            negotiation: Duration::from_secs(30),
            transport: Duration::from_secs(15),
            auth: Duration::from_secs(10),
        }
    }
}

/// A negotiation every concurrent caller for one description awaits.
type Negotiation = Shared<BoxFuture<'static, Result<NegotiatedProtocol>>>;
type InflightMap = Mutex<HashMap<String, Arc<Negotiation>>>;

pub struct ProtocolBridge {
    agent: Agent,
    registry: Arc<ProtocolRegistry>,
    events: Arc<EventDispatcher>,
    sessions: SessionManager,
    negotiator: Arc<dyn Negotiator>,
    social: Arc<dyn SocialTransport>,
    agents: Arc<dyn AgentTransport>,
    timeouts: BridgeTimeouts,
    message_types: RwLock<HashMap<String, String>>,
    inflight: InflightMap,
}

impl std::fmt::Debug for ProtocolBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolBridge")
            .field("agent", &self.agent.did)
            .field("protocols", &self.registry.len())
            .field("session", &self.sessions.state())
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

pub struct BridgeBuilder {
    agent: Agent,
    registry: Option<Arc<ProtocolRegistry>>,
    events: Option<Arc<EventDispatcher>>,
    negotiator: Option<Arc<dyn Negotiator>>,
    social: Option<Arc<dyn SocialTransport>>,
    agents: Option<Arc<dyn AgentTransport>>,
    timeouts: BridgeTimeouts,
    session: SessionSettings,
}

impl BridgeBuilder {
    /// Share a registry with other bridges. Each bridge gets its own otherwise.
    pub fn registry(mut self, registry: Arc<ProtocolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn negotiator(mut self, negotiator: Arc<dyn Negotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    pub fn social_transport(mut self, social: Arc<dyn SocialTransport>) -> Self {
        self.social = Some(social);
        self
    }

    pub fn agent_transport(mut self, agents: Arc<dyn AgentTransport>) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn timeouts(mut self, timeouts: BridgeTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn session_settings(mut self, settings: SessionSettings) -> Self {
        self.session = settings;
        self
    }

    pub fn build(self) -> Result<ProtocolBridge> {
        let missing = |what: &str| BridgeError::Config(format!("bridge requires a {what}"));
        let negotiator = self.negotiator.ok_or_else(|| missing("negotiator"))?;
        let social = self.social.ok_or_else(|| missing("social transport"))?;
        let agents = self.agents.ok_or_else(|| missing("agent transport"))?;

        let session = SessionSettings {
            auth_timeout: self.timeouts.auth,
            ..self.session
        };

        Ok(ProtocolBridge {
            sessions: SessionManager::new(Arc::clone(&social), session),
            agent: self.agent,
            registry: self.registry.unwrap_or_default(),
            events: self.events.unwrap_or_default(),
            negotiator,
            social,
            agents,
            timeouts: self.timeouts,
            message_types: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        })
    }
}

/// Membership in the set of callers awaiting one negotiation.
///
/// Entries leave the map once no caller holds them, so a failed
/// negotiation is retried by the next caller.
struct InflightSlot<'a> {
    map: &'a InflightMap,
    key: String,
    flight: Arc<Negotiation>,
}

impl<'a> InflightSlot<'a> {
    fn join(map: &'a InflightMap, key: &str, start: impl FnOnce() -> Negotiation) -> Self {
        let flight = Arc::clone(
            map.lock()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(start())),
        );
        Self {
            map,
            key: key.to_string(),
            flight,
        }
    }
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        let mut map = self.map.lock();
        map.retain(|key, flight| {
            let ours = key == &self.key && Arc::ptr_eq(flight, &self.flight);
            Arc::strong_count(flight) - usize::from(ours) > 1
        });
    }
}

/// What a message headed to the AT Protocol side asks for.
#[derive(Debug, Clone, PartialEq)]
enum AtprotoAction {
    Post { record: Value },
    Feed { algorithm: Option<String>, limit: u32 },
    Mentions { since: Option<DateTime<Utc>> },
}

impl AtprotoAction {
    fn parse(content: &Value) -> Result<Self> {
        let kind = content.get("type").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "post" => {
                let text = content
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BridgeError::InvalidInput("post requires a text field".into()))?;

                let mut record = json!({
                    "$type": POST_COLLECTION,
                    "text": text,
                    "createdAt": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                });
                for optional in ["facets", "langs", "reply"] {
                    if let Some(value) = content.get(optional) {
                        record[optional] = value.clone();
                    }
                }
                Ok(AtprotoAction::Post { record })
            }
            "get_feed" => Ok(AtprotoAction::Feed {
                algorithm: content
                    .get("algorithm")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                limit: content
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map_or(DEFAULT_FEED_LIMIT, |l| l.clamp(1, MAX_FEED_LIMIT as u64) as u32),
            }),
            "get_mentions" => {
                let since = match content.get("since").and_then(Value::as_str) {
                    Some(raw) => Some(
                        DateTime::parse_from_rfc3339(raw)
                            .map_err(|e| BridgeError::InvalidInput(format!("since: {e}")))?
                            .with_timezone(&Utc),
                    ),
                    None => None,
                };
                Ok(AtprotoAction::Mentions { since })
            }
            other => Err(BridgeError::UnsupportedMessage(other.to_string())),
        }
    }

    fn required_capability(&self) -> Capability {
        match self {
            AtprotoAction::Post { .. } => Capability::WritePosts,
            AtprotoAction::Feed { .. } | AtprotoAction::Mentions { .. } => Capability::ReadPublic,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            AtprotoAction::Post { .. } => "post",
            AtprotoAction::Feed { .. } => "get_feed",
            AtprotoAction::Mentions { .. } => "get_mentions",
        }
    }
}

async fn bounded<T, F>(operation: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| BridgeError::Timeout { operation, after })?
}

/// Negotiate, store and announce one protocol. Shared by every concurrent
/// caller asking for the same description.
async fn run_negotiation(
    negotiator: Arc<dyn Negotiator>,
    registry: Arc<ProtocolRegistry>,
    events: Arc<EventDispatcher>,
    after: Duration,
    description: String,
) -> Result<NegotiatedProtocol> {
    if let Some(protocol) = registry.find(&description) {
        tracing::debug!("Protocol for {:?} negotiated by a concurrent caller", description);
        return Ok(protocol);
    }

    tracing::info!("Negotiating protocol for {:?}", normalize_description(&description));
    let outcome = bounded("negotiation", after, negotiator.negotiate(&description)).await?;

    let protocol = NegotiatedProtocol::new(&description, outcome.version, outcome.schema);
    registry.store(protocol.clone())?;

    events.emit(
        EventKind::ProtocolNegotiated,
        json!({
            "id": protocol.id,
            "version": protocol.version,
            "description": protocol.description,
        }),
    );
    Ok(protocol)
}

impl ProtocolBridge {
    pub fn builder(agent: Agent) -> BridgeBuilder {
        BridgeBuilder {
            agent,
            registry: None,
            events: None,
            negotiator: None,
            social: None,
            agents: None,
            timeouts: BridgeTimeouts::default(),
            session: SessionSettings::default(),
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Resolve the protocol for a task, negotiating it on first use.
    ///
    /// Concurrent calls for the same normalized description share one
    /// negotiation and observe the same outcome, error included. A failed
    /// negotiation is not cached; the next caller after it tries again.
    pub async fn negotiate_protocol(&self, description: &str) -> Result<NegotiatedProtocol> {
        let result = self.negotiate(description).await;
        if let Err(e) = &result {
            self.emit_error("negotiate_protocol", e);
        }
        result
    }

    async fn negotiate(&self, description: &str) -> Result<NegotiatedProtocol> {
        let key = normalize_description(description);
        if key.is_empty() {
            return Err(BridgeError::InvalidInput("empty task description".to_string()));
        }
        if let Some(protocol) = self.registry.find(&key) {
            tracing::debug!("Protocol cache hit for {:?}", key);
            return Ok(protocol);
        }

        let slot = InflightSlot::join(&self.inflight, &key, || self.start_negotiation(description));
        let flight = Negotiation::clone(&slot.flight);
        bounded("negotiation", self.timeouts.negotiation, flight).await
    }

    fn start_negotiation(&self, description: &str) -> Negotiation {
        run_negotiation(
            Arc::clone(&self.negotiator),
            Arc::clone(&self.registry),
            Arc::clone(&self.events),
            self.timeouts.negotiation,
            description.to_string(),
        )
        .boxed()
        .shared()
    }

    /// Store `protocol` if needed and route messages tagged `message_type` through it.
    pub fn register_protocol(&self, message_type: &str, protocol: &NegotiatedProtocol) -> Result<()> {
        // Statistics belong to the registry copy; only the schema is compared.
        self.registry.store(NegotiatedProtocol {
            stats: None,
            ..protocol.clone()
        })?;

        tracing::info!("Routing {:?} messages through protocol {}", message_type, protocol.id);
        self.message_types
            .write()
            .insert(message_type.to_string(), protocol.id.clone());
        Ok(())
    }

    fn protocol_for_type(&self, message_type: Option<&str>) -> Option<NegotiatedProtocol> {
        let id = self.message_types.read().get(message_type?).cloned()?;
        self.registry.get(&id)
    }

    /// Translate a message, resolving its protocol from the registered
    /// message types when none is attached. Never fails.
    pub fn translate(&self, mut message: BridgeMessage) -> BridgeMessage {
        if message.protocol.is_none() {
            message.protocol = self.protocol_for_type(message.message_type());
        }
        translate::translate(message)
    }

    /// Deliver content to the AT Protocol network on behalf of the agent.
    ///
    /// `message_type` selects a registered protocol; it defaults to the
    /// content's own `type` field.
    pub async fn send_to_atproto(
        &self,
        content: Value,
        message_type: Option<&str>,
    ) -> Result<DeliveryResult> {
        let tag = message_type
            .map(str::to_string)
            .or_else(|| content.get("type").and_then(Value::as_str).map(str::to_string));
        let protocol = self.protocol_for_type(tag.as_deref());

        let outcome = match BridgeMessage::new(ProtocolSide::Agora, ProtocolSide::Atproto, content) {
            Ok(message) => {
                let message = translate::translate(message.with_protocol(protocol));
                self.dispatch_atproto(message).await
            }
            Err(e) => Err(e),
        };
        self.report("send_to_atproto", outcome)
    }

    /// Accept an envelope from an Agora agent and forward it to the AT
    /// Protocol network.
    pub async fn relay_from_agora(&self, envelope: AgoraEnvelope) -> Result<DeliveryResult> {
        let outcome = match self.receive_from_agora(envelope) {
            Ok(message) => self.dispatch_atproto(message).await,
            Err(e) => Err(e),
        };
        self.report("relay_from_agora", outcome)
    }

    async fn dispatch_atproto(&self, message: BridgeMessage) -> Result<DeliveryResult> {
        let started = Instant::now();
        let action = AtprotoAction::parse(&message.content)?;
        self.agent.require(action.required_capability())?;

        let session = self.sessions.ensure_fresh().await?;
        let token = self.sessions.access_token()?;
        let after = self.timeouts.transport;

        let response = match &action {
            AtprotoAction::Post { record } => {
                let post = bounded(
                    "post",
                    after,
                    self.social.post(&token, &session.did, record.clone()),
                )
                .await?;
                serde_json::to_value(post)?
            }
            AtprotoAction::Feed { algorithm, limit } => {
                let feed = bounded(
                    "get_feed",
                    after,
                    self.social.get_timeline(&token, algorithm.as_deref(), *limit),
                )
                .await?;
                json!({ "feed": feed })
            }
            AtprotoAction::Mentions { since } => {
                let mentions = bounded(
                    "get_mentions",
                    after,
                    self.social.get_mentions(&token, *since),
                )
                .await?;
                json!({ "mentions": mentions })
            }
        };

        let protocol_id = message.protocol.as_ref().map(|p| p.id.clone());
        if let Some(id) = &protocol_id {
            self.record_usage(id, started, &message);
        }

        tracing::info!("Delivered {} to AT Protocol as {}", action.name(), session.handle);
        self.events.emit(
            EventKind::MessageSent,
            json!({
                "target": ProtocolSide::Atproto,
                "type": action.name(),
                "protocolId": protocol_id,
            }),
        );

        Ok(DeliveryResult {
            target: ProtocolSide::Atproto,
            protocol_id,
            response,
            delivered_at: Utc::now(),
        })
    }

    /// Deliver content to the configured Agora agent.
    pub async fn send_to_agora(
        &self,
        content: Value,
        message_type: Option<&str>,
    ) -> Result<DeliveryResult> {
        let outcome = self.deliver_to_agora(content, message_type).await;
        self.report("send_to_agora", outcome)
    }

    async fn deliver_to_agora(
        &self,
        content: Value,
        message_type: Option<&str>,
    ) -> Result<DeliveryResult> {
        let started = Instant::now();
        let message = BridgeMessage::new(ProtocolSide::Atproto, ProtocolSide::Agora, content)?;
        let tag = message_type.or_else(|| message.message_type()).map(str::to_string);
        let protocol = self.protocol_for_type(tag.as_deref());
        let message = translate::translate(message.with_protocol(protocol));

        let protocol_id = message.protocol.as_ref().map(|p| p.id.clone());
        let envelope = AgoraEnvelope {
            protocol_hash: protocol_id.clone(),
            body: message.content.clone(),
        };

        let response = bounded(
            "agora delivery",
            self.timeouts.transport,
            self.agents.send(&self.agent.endpoint, &envelope),
        )
        .await?;

        if let Some(id) = &protocol_id {
            self.record_usage(id, started, &message);
        }

        self.events.emit(
            EventKind::MessageSent,
            json!({
                "target": ProtocolSide::Agora,
                "endpoint": self.agent.endpoint,
                "protocolId": protocol_id,
            }),
        );

        Ok(DeliveryResult {
            target: ProtocolSide::Agora,
            protocol_id,
            response,
            delivered_at: Utc::now(),
        })
    }

    /// Turn an inbound Agora envelope into a message for the AT Protocol side.
    ///
    /// An unknown protocol hash degrades to natural-language passthrough.
    pub fn receive_from_agora(&self, envelope: AgoraEnvelope) -> Result<BridgeMessage> {
        let protocol = match &envelope.protocol_hash {
            Some(hash) => {
                let found = self.registry.get(hash);
                if found.is_none() {
                    tracing::warn!("Unknown protocol hash {} from Agora, passing through", hash);
                }
                found
            }
            None => None,
        };

        let message = BridgeMessage::new(ProtocolSide::Agora, ProtocolSide::Atproto, envelope.body)?
            .with_protocol(protocol);
        let message = translate::translate(message);

        self.events.emit(
            EventKind::MessageReceived,
            json!({
                "source": ProtocolSide::Agora,
                "protocolId": message.protocol.as_ref().map(|p| &p.id),
            }),
        );
        Ok(message)
    }

    /// Fetch mentions of the agent's account, oldest first.
    pub async fn poll_mentions(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Mention>> {
        let outcome = self.fetch_mentions(since).await;
        self.report("poll_mentions", outcome)
    }

    async fn fetch_mentions(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Mention>> {
        self.agent.require(Capability::ReadPublic)?;
        self.sessions.ensure_fresh().await?;
        let token = self.sessions.access_token()?;

        let mentions = bounded(
            "get_mentions",
            self.timeouts.transport,
            self.social.get_mentions(&token, since),
        )
        .await?;

        for mention in &mentions {
            self.events.emit(
                EventKind::MessageReceived,
                json!({
                    "source": ProtocolSide::Atproto,
                    "uri": mention.uri,
                    "author": mention.author_did,
                }),
            );
        }
        Ok(mentions)
    }

    pub async fn login_atproto(&self, handle: &str, credential: &SecretString) -> Result<Session> {
        let outcome = self.sessions.login(handle, credential).await;
        self.report("login_atproto", outcome)
    }

    fn record_usage(&self, protocol_id: &str, started: Instant, message: &BridgeMessage) {
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        self.registry
            .record_usage(protocol_id, elapsed, translate::compression_ratio(message));
    }

    fn report<T>(&self, operation: &'static str, outcome: Result<T>) -> Result<T> {
        if let Err(e) = &outcome {
            self.emit_error(operation, e);
        }
        outcome
    }

    fn emit_error(&self, operation: &str, error: &BridgeError) {
        tracing::warn!("{} failed: {}", operation, error);
        self.events.emit(
            EventKind::Error,
            json!({
                "operation": operation,
                "error": error.to_string(),
                "retryable": error.is_retryable(),
                "requiresReauth": error.requires_reauth(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parsing() {
        let post = AtprotoAction::parse(&json!({"type": "post", "text": "hi", "langs": ["en"]})).unwrap();
        assert_eq!(post.required_capability(), Capability::WritePosts);
        match post {
            AtprotoAction::Post { record } => {
                assert_eq!(record["$type"], POST_COLLECTION);
                assert_eq!(record["text"], "hi");
                assert_eq!(record["langs"], json!(["en"]));
            }
            other => panic!("unexpected action {other:?}"),
        }

        let feed = AtprotoAction::parse(&json!({"type": "get_feed", "limit": 1000})).unwrap();
        assert_eq!(
            feed,
            AtprotoAction::Feed {
                algorithm: None,
                limit: MAX_FEED_LIMIT
            }
        );
        assert_eq!(feed.required_capability(), Capability::ReadPublic);
    }

    #[test]
    fn test_action_rejects_unknown_and_malformed() {
        assert!(matches!(
            AtprotoAction::parse(&json!({"type": "delete_everything"})),
            Err(BridgeError::UnsupportedMessage(_))
        ));
        assert!(matches!(
            AtprotoAction::parse(&json!({"type": "post"})),
            Err(BridgeError::InvalidInput(_))
        ));
        assert!(matches!(
            AtprotoAction::parse(&json!({"type": "get_mentions", "since": "yesterday"})),
            Err(BridgeError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_inflight_slots_are_released() {
        let map: InflightMap = Mutex::new(HashMap::new());
        let idle = || -> Negotiation {
            futures::future::ready(Err(BridgeError::Delivery("unused".to_string())))
                .boxed()
                .shared()
        };
        {
            let first = InflightSlot::join(&map, "summarize a post", idle);
            let second = InflightSlot::join(&map, "summarize a post", || unreachable!());
            assert!(Arc::ptr_eq(&first.flight, &second.flight));
            assert_eq!(map.lock().len(), 1);
            drop(first);
            assert_eq!(map.lock().len(), 1);
        }
        assert!(map.lock().is_empty());
    }
}
