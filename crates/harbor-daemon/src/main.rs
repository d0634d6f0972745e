use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use harbor_crypto::{LocalCrypto, NullMediaSink, RetryQueue};
use harbor_gateway::{CommandHost, Gateway, GatewayConfig, ResumeQuery, connection};
use harbor_store::Store;
use harbor_sync::paginate::PaginationRegistry;
use harbor_sync::{ClientOps, Paginator, Processor, SyncLoop};
use harbor_types::{Account, SyncPayload, UserId};

mod bridge;

use bridge::Bridge;

#[derive(Clone)]
struct DaemonState {
    gateway: Gateway,
    bridge: Arc<Bridge>,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harbor=debug,tower_http=debug".into()),
        )
        .init();

    let db_path = env_or("HARBOR_DB_PATH", "harbor.db");
    let host = env_or("HARBOR_HOST", "127.0.0.1");
    let port: u16 = env_or("HARBOR_PORT", "3010").parse()?;
    let buffer_cap: usize = env_or("HARBOR_BUFFER_CAP", "4096").parse()?;
    let keepalive: u64 = env_or("HARBOR_KEEPALIVE_SECS", "15").parse()?;

    let store = Arc::new(Store::open(&db_path)?);
    seed_account(&store)?;

    let crypto = Arc::new(LocalCrypto::new());
    let bridge = Arc::new(Bridge::new(256));
    let (publish_tx, publish_rx) = tokio::sync::mpsc::channel(1024);

    let retry = Arc::new(RetryQueue::new(
        store.clone(),
        crypto.clone(),
        bridge.clone(),
        bridge.clone(),
        publish_tx.clone(),
    ));
    let paginations = Arc::new(PaginationRegistry::new());
    let processor = Processor::new(
        store.clone(),
        crypto.clone(),
        Arc::new(NullMediaSink),
        retry.waker(),
        paginations.clone(),
    );
    let (sync_loop, status_rx) = SyncLoop::new(
        store.clone(),
        processor,
        bridge.clone(),
        retry.clone(),
        publish_tx.clone(),
    );

    let ops = Arc::new(ClientOps::new(
        store.clone(),
        crypto.clone(),
        bridge.clone(),
        publish_tx.clone(),
    ));
    let paginator = Arc::new(Paginator::new(
        store.clone(),
        crypto.clone(),
        bridge.clone(),
        paginations,
        publish_tx.clone(),
    ));
    drop(publish_tx);

    let gateway = Gateway::new(
        store.clone(),
        CommandHost::new(store.clone(), ops, paginator),
        status_rx,
        GatewayConfig {
            buffer_cap,
            keepalive: Duration::from_secs(keepalive),
            ..GatewayConfig::default()
        },
    );

    let cancel = CancellationToken::new();
    tokio::spawn(gateway.clone().pump(publish_rx, cancel.child_token()));
    tokio::spawn(sync_loop.run(cancel.child_token()));
    tokio::spawn(retry.run(cancel.child_token()));

    let state = DaemonState {
        gateway,
        bridge,
    };
    let app = Router::new()
        .route("/gateway", get(ws_upgrade))
        .route("/bridge/sync", post(bridge_sync))
        .route("/bridge/outbox", get(bridge_outbox))
        .route("/bridge/reply", post(bridge_reply))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("harbor daemon listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    cancel.cancel();
    Ok(())
}

/// Writes the account row from the environment on first start, so the
/// sync loop has an identity before the first batch arrives.
fn seed_account(store: &Store) -> anyhow::Result<()> {
    if store.account()?.is_some() {
        return Ok(());
    }
    let Ok(user_id) = std::env::var("HARBOR_USER_ID") else {
        return Ok(());
    };
    store.put_account(&Account {
        user_id: UserId(user_id),
        device_id: env_or("HARBOR_DEVICE_ID", "HARBOR"),
        access_token: env_or("HARBOR_ACCESS_TOKEN", ""),
        next_batch: None,
    })?;
    Ok(())
}

async fn ws_upgrade(
    State(state): State<DaemonState>,
    Query(query): Query<ResumeQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.gateway, query))
}

async fn bridge_sync(
    State(state): State<DaemonState>,
    Json(payload): Json<SyncPayload>,
) -> impl IntoResponse {
    match state.bridge.ingest(payload).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Long-poll for the next engine-originated frame; 204 when the poll
/// window passes quietly.
async fn bridge_outbox(State(state): State<DaemonState>) -> impl IntoResponse {
    match tokio::time::timeout(Duration::from_secs(25), state.bridge.next_outbox()).await {
        Ok(Some(frame)) => Json(frame).into_response(),
        Ok(None) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(_) => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(serde::Deserialize)]
struct BridgeReply {
    tag: u64,
    data: serde_json::Value,
}

async fn bridge_reply(
    State(state): State<DaemonState>,
    Json(reply): Json<BridgeReply>,
) -> impl IntoResponse {
    if state.bridge.reply(reply.tag, reply.data) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}
