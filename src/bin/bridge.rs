use agora_at::{
    config::{create_default_config_file, AppConfig},
    events::EventKind,
    model::AgoraEnvelope,
    transport::{AgoraHttpClient, HttpNegotiator, XrpcClient},
    BridgeError, ProtocolBridge,
};
use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

#[derive(Parser)]
#[command(name = "bridge")]
#[command(about = "Bridge between Agora agents and the AT Protocol network")]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write a default configuration to --config and exit
    #[arg(long)]
    init: bool,
}

#[derive(Clone)]
struct AppState {
    bridge: Arc<ProtocolBridge>,
}

#[derive(Deserialize)]
struct NegotiateRequest {
    description: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.init {
        create_default_config_file(&args.config)?;
        println!("Wrote default configuration to {}", args.config);
        return Ok(());
    }

    let config = AppConfig::load_with_env_overrides(&args.config)?;
    config.logging.init();
    config.validate()?;

    let timeouts = config.bridge_timeouts();
    let bridge = ProtocolBridge::builder(config.agent())
        .negotiator(Arc::new(HttpNegotiator::new(&config.agora.endpoint, timeouts.negotiation)?))
        .social_transport(Arc::new(XrpcClient::new(&config.atproto.service_url, timeouts.transport)?))
        .agent_transport(Arc::new(AgoraHttpClient::new(timeouts.transport)?))
        .timeouts(timeouts)
        .session_settings(config.session_settings())
        .build()?;

    for kind in [
        EventKind::ProtocolNegotiated,
        EventKind::MessageSent,
        EventKind::MessageReceived,
    ] {
        bridge.events().subscribe(kind, |event| {
            tracing::info!(kind = ?event.kind, payload = %event.payload, "bridge event");
            Ok(())
        });
    }

    match &config.atproto.handle {
        Some(handle) => {
            let credential = config.credentials.resolve()?;
            bridge
                .login_atproto(handle, &credential)
                .await
                .with_context(|| format!("login as {handle} failed"))?;
        }
        None => tracing::warn!("No AT Protocol handle configured; deliveries will be rejected"),
    }

    let app_state = AppState {
        bridge: Arc::new(bridge),
    };

    let app = Router::new()
        .route("/message", post(relay_message))
        .route("/negotiate", post(negotiate))
        .route("/protocols", get(list_protocols))
        .route("/health", get(health_check))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let address = config.get_server_address();
    let listener = TcpListener::bind(&address).await?;
    tracing::info!("Bridge listening on {}", address);

    axum::serve(listener, app).await?;

    Ok(())
}

fn status_for(error: &BridgeError) -> StatusCode {
    match error {
        BridgeError::InvalidInput(_) | BridgeError::UnsupportedMessage(_) => StatusCode::BAD_REQUEST,
        BridgeError::MissingCapability { .. } => StatusCode::FORBIDDEN,
        BridgeError::Conflict(_) => StatusCode::CONFLICT,
        BridgeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        BridgeError::Delivery(_) => StatusCode::BAD_GATEWAY,
        e if e.requires_reauth() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(error: BridgeError) -> (StatusCode, Json<serde_json::Value>) {
    (
        status_for(&error),
        Json(serde_json::json!({
            "status": "error",
            "error": error.to_string()
        })),
    )
}

async fn relay_message(
    State(state): State<AppState>,
    Json(envelope): Json<AgoraEnvelope>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.bridge.relay_from_agora(envelope).await {
        Ok(delivery) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "success",
                "body": delivery.response
            })),
        ),
        Err(e) => error_reply(e),
    }
}

async fn negotiate(
    State(state): State<AppState>,
    Json(request): Json<NegotiateRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.bridge.negotiate_protocol(&request.description).await {
        Ok(protocol) => (StatusCode::OK, Json(serde_json::json!(protocol))),
        Err(e) => error_reply(e),
    }
}

async fn list_protocols(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.bridge.registry().protocols()))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "session": state.bridge.sessions().state(),
        "protocols": state.bridge.registry().len()
    }))
}
