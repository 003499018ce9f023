//! # agora-at - Agent identities and an Agora/AT Protocol bridge
//!
//! Verifiable `did:web` identities for autonomous agents, and a bridge that
//! negotiates, caches and applies structured protocols between Agora agents
//! and the AT Protocol social network.
//!
//! ## Architecture
//!
//! - **Identity**: P-256 key generation, DID documents, staging for hosting, validation
//! - **Registry**: Negotiated protocols keyed by normalized task description
//! - **Session**: AT Protocol login and single-flight token refresh
//! - **Bridge**: Single-flight negotiation, translation and delivery in both directions
//! - **Events**: Synchronous lifecycle notifications with isolated handlers

pub mod bridge;
pub mod config;
pub mod did;
pub mod error;
pub mod events;
pub mod keys;
pub mod model;
pub mod publisher;
pub mod registry;
pub mod session;
pub mod translate;
pub mod transport;
pub mod validator;

pub use bridge::{BridgeBuilder, BridgeTimeouts, ProtocolBridge};
pub use config::AppConfig;
pub use did::{AgentIdentityRecord, DidDocument, DidDocumentBuilder, WebDid};
pub use error::{BridgeError, Result};
pub use events::{BridgeEvent, EventDispatcher, EventKind, SubscriptionId};
pub use keys::{KeyPair, KeyPairFactory};
pub use model::{
    Agent, AgentPermission, AgoraEnvelope, BridgeMessage, Capability, DeliveryResult,
    NegotiatedProtocol, ProtocolSide, ProtocolStats,
};
pub use publisher::{IdentityPublisher, StagedIdentity};
pub use registry::ProtocolRegistry;
pub use session::{AccessToken, Session, SessionManager, SessionPhase, SessionSettings, SessionTokens};
pub use transport::{
    AgentTransport, AgoraHttpClient, HttpNegotiator, Mention, NegotiationOutcome, Negotiator,
    PostRef, SocialTransport, XrpcClient,
};
pub use validator::{AgentReport, CheckReport, IdentityValidator};
