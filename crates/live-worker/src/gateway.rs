//! HTTP front ends for the pool.
//!
//! - Gateway (`LW_GATEWAY_BIND_ADDRESS`): `GET /<token>` subscribes to the
//!   channel, waits for it and answers `302 Found` with the playback URL.
//!   The subscription is released when the request finishes or the client
//!   goes away.
//! - Admin (merged onto the health listener):
//!   - `GET /admin/channels` - snapshot of every tracked channel
//!   - `GET /admin/channels/:resource_id` - the live channel for one id
//!   - `GET /admin/status` - pool counters
//!   - `PUT /admin/max-parallel` - `{"max_parallel": n}`, answers 204

use crate::actors::PoolActorHandle;
use crate::errors::LwError;
use crate::pool::{ChannelHandle, ChannelSnapshot, PoolStatus, PortHints};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, instrument};

/// Releases a subscription when dropped.
struct ChannelGuard {
    pool: PoolActorHandle,
    handle: ChannelHandle,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.pool.release(self.handle.take());
    }
}

/// Router for the public gateway listener.
pub fn gateway_router(pool: PoolActorHandle) -> Router {
    Router::new()
        .route("/", get(play))
        .route("/*token", get(play))
        .layer(
            // The path is the signed token; keep it out of the span
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                info_span!("lw.gateway.request", method = %request.method())
            }),
        )
        .with_state(pool)
}

/// `GET /<token>`.
///
/// The whole path is the token. The query string is carried over to the
/// playback URL.
#[instrument(skip_all, name = "lw.gateway.play")]
async fn play(State(pool): State<PoolActorHandle>, uri: Uri) -> Result<Response, LwError> {
    let (handle, completion) = pool
        .start_channel(uri.path(), PortHints::default())
        .await?
        .into_parts();
    let _guard = ChannelGuard {
        pool: pool.clone(),
        handle,
    };

    let url = completion.recv().await?;
    let location = match uri.query() {
        Some(query) => format!("{url}?{query}"),
        None => url,
    };
    debug!(target: "lw.gateway", location = %location, "Redirecting to channel");
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

/// Router for the admin endpoints.
pub fn admin_router(pool: PoolActorHandle) -> Router {
    Router::new()
        .route("/admin/channels", get(list_channels))
        .route("/admin/channels/:resource_id", get(get_channel))
        .route("/admin/status", get(pool_status))
        .route("/admin/max-parallel", put(set_max_parallel))
        .with_state(pool)
}

async fn list_channels(
    State(pool): State<PoolActorHandle>,
) -> Result<Json<Vec<ChannelSnapshot>>, LwError> {
    Ok(Json(pool.dump_channels().await?))
}

async fn get_channel(
    State(pool): State<PoolActorHandle>,
    Path(resource_id): Path<String>,
) -> Result<Response, LwError> {
    Ok(match pool.lookup(resource_id).await? {
        Some(snapshot) => Json(snapshot).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}

async fn pool_status(State(pool): State<PoolActorHandle>) -> Result<Json<PoolStatus>, LwError> {
    Ok(Json(pool.status().await?))
}

#[derive(Debug, Deserialize)]
struct MaxParallelRequest {
    max_parallel: usize,
}

async fn set_max_parallel(
    State(pool): State<PoolActorHandle>,
    Json(request): Json<MaxParallelRequest>,
) -> Result<StatusCode, LwError> {
    info!(
        target: "lw.gateway",
        max_parallel = request.max_parallel,
        "Admin changed admission limit"
    );
    pool.set_max_parallel(request.max_parallel).await?;
    Ok(StatusCode::NO_CONTENT)
}
