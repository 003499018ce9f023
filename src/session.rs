//! Authentication state for the AT Protocol side of the bridge.
//!
//! ```text
//! LoggedOut -> Authenticating -> Active -> Refreshing -> Active
//!                                               \-> Expired -> LoggedOut
//! ```
//!
//! Raw tokens never leave this module except as an [`AccessToken`] handed to
//! a transport for a single call.

use crate::transport::SocialTransport;
use crate::{BridgeError, Result};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    LoggedOut,
    Authenticating,
    Active,
    Refreshing,
    Expired,
}

/// Opaque handle describing the current session. Carries no credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub did: String,
    pub handle: String,
    pub created_at: DateTime<Utc>,
    pub access_expires_at: DateTime<Utc>,
}

/// Tokens issued by the PDS on login or refresh.
pub struct SessionTokens {
    pub did: String,
    pub handle: String,
    pub access_jwt: SecretString,
    pub refresh_jwt: SecretString,
}

impl fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokens")
            .field("did", &self.did)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Bearer token lent to a transport for one call.
pub struct AccessToken(SecretString);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Upper bound for every authenticate/refresh call.
    pub auth_timeout: Duration,
    /// Refresh when the access token expires within this window.
    pub refresh_margin: ChronoDuration,
    /// Lifetime assumed for access tokens without an `exp` claim.
    pub default_token_lifetime: ChronoDuration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            refresh_margin: ChronoDuration::seconds(60),
            default_token_lifetime: ChronoDuration::hours(2),
        }
    }
}

struct LiveSession {
    session: Session,
    tokens: SessionTokens,
}

enum SessionState {
    LoggedOut,
    Authenticating,
    Active(LiveSession),
    Refreshing(LiveSession),
    Expired,
}

impl SessionState {
    fn phase(&self) -> SessionPhase {
        match self {
            SessionState::LoggedOut => SessionPhase::LoggedOut,
            SessionState::Authenticating => SessionPhase::Authenticating,
            SessionState::Active(_) => SessionPhase::Active,
            SessionState::Refreshing(_) => SessionPhase::Refreshing,
            SessionState::Expired => SessionPhase::Expired,
        }
    }

    fn live(&self) -> Result<&LiveSession> {
        match self {
            SessionState::Active(live) | SessionState::Refreshing(live) => Ok(live),
            SessionState::Expired => Err(BridgeError::SessionExpired),
            SessionState::LoggedOut | SessionState::Authenticating => {
                Err(BridgeError::NotAuthenticated)
            }
        }
    }
}

pub struct SessionManager {
    transport: Arc<dyn SocialTransport>,
    settings: SessionSettings,
    state: Mutex<SessionState>,
    login_lock: tokio::sync::Mutex<()>,
    refresh_lock: tokio::sync::Mutex<()>,
    refresh_generation: AtomicU64,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("phase", &self.state())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(transport: Arc<dyn SocialTransport>, settings: SessionSettings) -> Self {
        Self {
            transport,
            settings,
            state: Mutex::new(SessionState::LoggedOut),
            login_lock: tokio::sync::Mutex::new(()),
            refresh_lock: tokio::sync::Mutex::new(()),
            refresh_generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionPhase {
        self.state.lock().phase()
    }

    pub async fn login(&self, handle: &str, credential: &SecretString) -> Result<Session> {
        let _login = self.login_lock.lock().await;
        // A refresh in flight owns the state until it settles.
        let _refresh = self.refresh_lock.lock().await;

        let previous = std::mem::replace(&mut *self.state.lock(), SessionState::Authenticating);
        let mut guard = RestoreOnDrop {
            state: &self.state,
            previous: Some(previous),
        };

        let outcome = tokio::time::timeout(
            self.settings.auth_timeout,
            self.transport.authenticate(handle, credential),
        )
        .await;

        let tokens = match outcome {
            Err(_) => {
                tracing::warn!("Login for {} timed out", handle);
                return Err(BridgeError::Timeout {
                    operation: "login",
                    after: self.settings.auth_timeout,
                });
            }
            Ok(Err(e)) => {
                guard.previous = None;
                *self.state.lock() = SessionState::LoggedOut;
                tracing::warn!("Login for {} rejected: {}", handle, e);
                return Err(match e {
                    BridgeError::Auth(_) | BridgeError::Timeout { .. } => e,
                    other => BridgeError::Auth(other.to_string()),
                });
            }
            Ok(Ok(tokens)) => tokens,
        };

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            did: tokens.did.clone(),
            handle: tokens.handle.clone(),
            created_at: now,
            access_expires_at: self.expiry_of(&tokens.access_jwt, now),
        };

        guard.previous = None;
        *self.state.lock() = SessionState::Active(LiveSession {
            session: session.clone(),
            tokens,
        });
        self.refresh_generation.fetch_add(1, Ordering::SeqCst);

        tracing::info!("Logged in as {} ({})", session.handle, session.did);
        Ok(session)
    }

    pub fn current_session(&self) -> Result<Session> {
        self.state.lock().live().map(|live| live.session.clone())
    }

    /// Return a session whose access token is not about to expire,
    /// refreshing it first when needed.
    ///
    /// Concurrent callers share a single refresh call.
    pub async fn ensure_fresh(&self) -> Result<Session> {
        let generation = self.refresh_generation.load(Ordering::SeqCst);
        if let Some(session) = self.fresh_session()? {
            return Ok(session);
        }

        let _refresh = self.refresh_lock.lock().await;

        if self.refresh_generation.load(Ordering::SeqCst) != generation {
            // Another caller refreshed or logged in while we waited.
            return self.current_session();
        }
        if let Some(session) = self.fresh_session()? {
            return Ok(session);
        }

        let refresh_token = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, SessionState::LoggedOut) {
                SessionState::Active(live) => {
                    let token = SecretString::from(live.tokens.refresh_jwt.expose_secret().to_owned());
                    *state = SessionState::Refreshing(live);
                    token
                }
                other => {
                    let err = other.live().err().unwrap_or(BridgeError::NotAuthenticated);
                    *state = other;
                    return Err(err);
                }
            }
        };
        let _guard = RefreshingToActive { state: &self.state };

        tracing::debug!("Refreshing AT Protocol session");
        let outcome = tokio::time::timeout(
            self.settings.auth_timeout,
            self.transport.refresh(&refresh_token),
        )
        .await;

        match outcome {
            Err(_) => Err(BridgeError::Timeout {
                operation: "session refresh",
                after: self.settings.auth_timeout,
            }),
            Ok(Err(e)) => {
                tracing::warn!("Session refresh rejected: {}", e);
                *self.state.lock() = SessionState::Expired;
                self.refresh_generation.fetch_add(1, Ordering::SeqCst);
                Err(BridgeError::SessionExpired)
            }
            Ok(Ok(tokens)) => {
                let mut state = self.state.lock();
                let previous = match std::mem::replace(&mut *state, SessionState::LoggedOut) {
                    SessionState::Refreshing(live) => live.session,
                    other => {
                        *state = other;
                        return Err(BridgeError::NotAuthenticated);
                    }
                };

                let now = Utc::now();
                let session = Session {
                    access_expires_at: self.expiry_of(&tokens.access_jwt, now),
                    did: tokens.did.clone(),
                    handle: tokens.handle.clone(),
                    ..previous
                };
                *state = SessionState::Active(LiveSession {
                    session: session.clone(),
                    tokens,
                });
                self.refresh_generation.fetch_add(1, Ordering::SeqCst);

                tracing::info!("Session refreshed, expires at {}", session.access_expires_at);
                Ok(session)
            }
        }
    }

    /// Drop any session or expired marker and return to `LoggedOut`.
    pub fn logout(&self) -> bool {
        let previous = std::mem::replace(&mut *self.state.lock(), SessionState::LoggedOut);
        self.refresh_generation.fetch_add(1, Ordering::SeqCst);
        !matches!(previous, SessionState::LoggedOut)
    }

    pub(crate) fn access_token(&self) -> Result<AccessToken> {
        let state = self.state.lock();
        let live = state.live()?;
        Ok(AccessToken::new(live.tokens.access_jwt.expose_secret()))
    }

    fn fresh_session(&self) -> Result<Option<Session>> {
        let state = self.state.lock();
        match &*state {
            SessionState::Active(live) => {
                let remaining = live.session.access_expires_at - Utc::now();
                if remaining > self.settings.refresh_margin {
                    Ok(Some(live.session.clone()))
                } else {
                    Ok(None)
                }
            }
            SessionState::Refreshing(_) => Ok(None),
            other => other.live().map(|_| None),
        }
    }

    fn expiry_of(&self, access_jwt: &SecretString, now: DateTime<Utc>) -> DateTime<Utc> {
        token_expiry(access_jwt.expose_secret())
            .unwrap_or(now + self.settings.default_token_lifetime)
    }
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: Option<i64>,
}

/// Read the `exp` claim of a JWT without verifying it.
///
/// The PDS verifies its own tokens; the bridge only needs the expiry to
/// schedule refreshes.
pub fn token_expiry(jwt: &str) -> Option<DateTime<Utc>> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<ExpiryClaim>(jwt, &DecodingKey::from_secret(&[]), &validation).ok()?;
    data.claims
        .exp
        .and_then(|exp| Utc.timestamp_opt(exp, 0).single())
}

/// Puts the pre-login state back if a login is cancelled or times out.
struct RestoreOnDrop<'a> {
    state: &'a Mutex<SessionState>,
    previous: Option<SessionState>,
}

impl Drop for RestoreOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self.state.lock() = previous;
        }
    }
}

/// Returns a session left in `Refreshing` to `Active`.
struct RefreshingToActive<'a> {
    state: &'a Mutex<SessionState>,
}

impl Drop for RefreshingToActive<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if matches!(&*state, SessionState::Refreshing(_)) {
            if let SessionState::Refreshing(live) =
                std::mem::replace(&mut *state, SessionState::LoggedOut)
            {
                *state = SessionState::Active(live);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Mention, PostRef};
    use async_trait::async_trait;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    fn jwt_expiring_in(seconds: i64) -> String {
        let exp = (Utc::now() + ChronoDuration::seconds(seconds)).timestamp();
        encode(
            &Header::default(),
            &json!({"sub": "did:web:alice.example.test", "exp": exp}),
            &EncodingKey::from_secret(b"pds-secret"),
        )
        .unwrap()
    }

    /// Issues short-lived tokens on login and long-lived ones on refresh.
    struct FakePds {
        refresh_calls: AtomicUsize,
        reject_refresh: bool,
        refresh_delay: Duration,
    }

    impl FakePds {
        fn new() -> Self {
            Self {
                refresh_calls: AtomicUsize::new(0),
                reject_refresh: false,
                refresh_delay: Duration::from_millis(50),
            }
        }

        fn tokens(access: String) -> SessionTokens {
            SessionTokens {
                did: "did:web:alice.example.test".to_string(),
                handle: "alice.example.test".to_string(),
                access_jwt: SecretString::from(access),
                refresh_jwt: SecretString::from("refresh-token".to_string()),
            }
        }
    }

    #[async_trait]
    impl SocialTransport for FakePds {
        async fn authenticate(&self, _handle: &str, credential: &SecretString) -> Result<SessionTokens> {
            if credential.expose_secret() != "app-password" {
                return Err(BridgeError::Auth("invalid identifier or password".to_string()));
            }
            Ok(Self::tokens(jwt_expiring_in(10)))
        }

        async fn refresh(&self, _refresh_token: &SecretString) -> Result<SessionTokens> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.refresh_delay).await;
            if self.reject_refresh {
                return Err(BridgeError::Auth("refresh token revoked".to_string()));
            }
            Ok(Self::tokens(jwt_expiring_in(3600)))
        }

        async fn post(&self, _token: &AccessToken, _repo: &str, _record: Value) -> Result<PostRef> {
            unimplemented!()
        }

        async fn get_timeline(&self, _token: &AccessToken, _algorithm: Option<&str>, _limit: u32) -> Result<Vec<Value>> {
            unimplemented!()
        }

        async fn get_mentions(&self, _token: &AccessToken, _since: Option<DateTime<Utc>>) -> Result<Vec<Mention>> {
            unimplemented!()
        }
    }

    fn manager(pds: FakePds) -> (Arc<FakePds>, SessionManager) {
        let pds = Arc::new(pds);
        let manager = SessionManager::new(pds.clone(), SessionSettings::default());
        (pds, manager)
    }

    fn password() -> SecretString {
        SecretString::from("app-password".to_string())
    }

    #[tokio::test]
    async fn test_login_transitions_to_active() {
        let (_, manager) = manager(FakePds::new());
        assert_eq!(manager.state(), SessionPhase::LoggedOut);
        assert!(matches!(manager.current_session(), Err(BridgeError::NotAuthenticated)));

        let session = manager.login("alice.example.test", &password()).await.unwrap();
        assert_eq!(manager.state(), SessionPhase::Active);
        assert_eq!(session.did, "did:web:alice.example.test");
        assert_eq!(manager.current_session().unwrap(), session);
    }

    #[tokio::test]
    async fn test_rejected_login_returns_to_logged_out() {
        let (_, manager) = manager(FakePds::new());
        let wrong = SecretString::from("nope".to_string());
        let err = manager.login("alice.example.test", &wrong).await.unwrap_err();
        assert!(matches!(err, BridgeError::Auth(_)));
        assert_eq!(manager.state(), SessionPhase::LoggedOut);
    }

    #[tokio::test]
    async fn test_expiry_read_from_jwt() {
        let (_, manager) = manager(FakePds::new());
        let session = manager.login("alice.example.test", &password()).await.unwrap();
        let remaining = session.access_expires_at - Utc::now();
        assert!(remaining <= ChronoDuration::seconds(10));
    }

    #[tokio::test]
    async fn test_login_waits_for_inflight_refresh() {
        let (pds, manager) = manager(FakePds::new());
        let manager = Arc::new(manager);
        manager.login("alice.example.test", &password()).await.unwrap();

        let refreshing = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.ensure_fresh().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.state(), SessionPhase::Refreshing);

        let relogin = manager.login("alice.example.test", &password()).await.unwrap();
        let refreshed = refreshing.await.unwrap().unwrap();

        assert_eq!(pds.refresh_calls.load(Ordering::SeqCst), 1);
        assert_ne!(refreshed.id, relogin.id);
        assert_eq!(manager.state(), SessionPhase::Active);
        assert_eq!(manager.current_session().unwrap(), relogin);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_coalesced() {
        let (pds, manager) = manager(FakePds::new());
        let manager = Arc::new(manager);
        manager.login("alice.example.test", &password()).await.unwrap();

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.ensure_fresh().await })
            })
            .collect();

        let mut ids = Vec::new();
        for call in calls {
            ids.push(call.await.unwrap().unwrap().id);
        }

        assert_eq!(pds.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(manager.state(), SessionPhase::Active);
    }

    #[tokio::test]
    async fn test_fresh_session_skips_refresh() {
        let (pds, manager) = manager(FakePds::new());
        manager.login("alice.example.test", &password()).await.unwrap();
        manager.ensure_fresh().await.unwrap();
        manager.ensure_fresh().await.unwrap();
        assert_eq!(pds.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_refresh_expires_session() {
        let mut pds = FakePds::new();
        pds.reject_refresh = true;
        let (_, manager) = manager(pds);
        manager.login("alice.example.test", &password()).await.unwrap();

        let err = manager.ensure_fresh().await.unwrap_err();
        assert!(matches!(err, BridgeError::SessionExpired));
        assert_eq!(manager.state(), SessionPhase::Expired);
        assert!(matches!(manager.access_token(), Err(BridgeError::SessionExpired)));

        assert!(manager.logout());
        assert_eq!(manager.state(), SessionPhase::LoggedOut);
    }

    #[tokio::test]
    async fn test_refresh_timeout_leaves_session_active() {
        let mut pds = FakePds::new();
        pds.refresh_delay = Duration::from_millis(200);
        let pds = Arc::new(pds);
        let manager = SessionManager::new(
            pds.clone(),
            SessionSettings {
                auth_timeout: Duration::from_millis(20),
                ..SessionSettings::default()
            },
        );
        let before = manager.login("alice.example.test", &password()).await.unwrap();

        let err = manager.ensure_fresh().await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
        assert_eq!(manager.state(), SessionPhase::Active);
        assert_eq!(manager.current_session().unwrap(), before);
    }

    #[tokio::test]
    async fn test_ensure_fresh_requires_login() {
        let (pds, manager) = manager(FakePds::new());
        assert!(matches!(
            manager.ensure_fresh().await,
            Err(BridgeError::NotAuthenticated)
        ));
        assert_eq!(pds.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_token_expiry_without_exp_claim() {
        assert!(token_expiry("not-a-jwt").is_none());
        let token = encode(
            &Header::default(),
            &json!({"sub": "x"}),
            &EncodingKey::from_secret(b"k"),
        )
        .unwrap();
        assert!(token_expiry(&token).is_none());
    }

    #[test]
    fn test_access_token_debug_is_redacted() {
        let token = AccessToken::new("secret-jwt");
        assert_eq!(format!("{:?}", token), "AccessToken([REDACTED])");
        assert_eq!(token.expose_secret(), "secret-jwt");
    }
}
