//! The HTTP control plane: listing and editing the slot mapping, direct
//! device writes, health, and power-strip actions.
//!
//! Thin glue over the core: every mapping edit persists the document, then
//! hands the freshly reloaded mapping to the supervisor for replacement.

use std::sync::Arc;

use axum::{
    extract::Path,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, TypedHeader,
};
use serde_json::json;
use tracing::info;

use crate::{
    device::Slot,
    error::Error,
    health,
    mapping::{MappingRequest, MappingStore, SlotSpec},
    router::{Router, WriteKind},
    strip::StripFleet,
    supervisor::ConnectionSupervisor,
};

/// Everything a request handler may need to reach.
#[derive(Clone)]
pub(crate) struct AppContext {
    pub(crate) router: Router,
    pub(crate) store: Arc<MappingStore>,
    pub(crate) supervisor: Arc<ConnectionSupervisor>,
    /// `None` on plain UART racks.
    pub(crate) strips: Option<Arc<StripFleet>>,
}

/// The control plane routes, to be nested under `/api`.
pub(crate) fn routes() -> axum::Router {
    axum::Router::new()
        .route("/devices", get(list_devices))
        .route("/device/:slot/write", post(write_device))
        .route("/slot-mapping", post(apply_full_mapping))
        .route(
            "/slot-mapping/:slot",
            put(apply_slot_mapping).delete(delete_slot_mapping),
        )
        .route("/health", get(health_snapshot))
        .route("/reboot", post(reboot_strips))
        .route("/profile", post(push_profile))
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::UnknownSlot(_) => StatusCode::NOT_FOUND,
            Error::InvalidEncoding(_)
            | Error::Decode(_)
            | Error::MappingValidation(_)
            | Error::BadConfig(_) => StatusCode::BAD_REQUEST,
            Error::DeviceIo(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

async fn list_devices(Extension(ctx): Extension<AppContext>) -> impl IntoResponse {
    Json((*ctx.store.snapshot()).clone())
}

/// Write a payload straight to a device, bypassing the websocket.
///
/// An `application/octet-stream` body is written as-is; any other body is
/// taken as hex text for backward compatibility.
async fn write_device(
    Path(slot): Path<String>,
    content_type: Option<TypedHeader<headers::ContentType>>,
    Extension(ctx): Extension<AppContext>,
    body: bytes::Bytes,
) -> Result<impl IntoResponse, Error> {
    let slot: Slot = slot.parse()?;

    let kind = match content_type {
        Some(TypedHeader(content_type))
            if content_type == headers::ContentType::octet_stream() =>
        {
            WriteKind::Binary
        }
        _ => WriteKind::Hex,
    };

    ctx.router.route_to_device(slot, &body, kind).await?;

    Ok(success())
}

async fn apply_full_mapping(
    Extension(ctx): Extension<AppContext>,
    Json(request): Json<MappingRequest>,
) -> Result<impl IntoResponse, Error> {
    let mapping = ctx.store.apply_full(request)?;
    ctx.supervisor.replace(&mapping).await;

    Ok(success())
}

async fn apply_slot_mapping(
    Path(slot): Path<String>,
    Extension(ctx): Extension<AppContext>,
    Json(spec): Json<SlotSpec>,
) -> Result<impl IntoResponse, Error> {
    info!(%slot, ?spec, "Slot mapping edit");

    let mapping = ctx.store.apply_slot(&slot, spec)?;
    ctx.supervisor.replace(&mapping).await;

    Ok(success())
}

async fn delete_slot_mapping(
    Path(slot): Path<String>,
    Extension(ctx): Extension<AppContext>,
) -> Result<impl IntoResponse, Error> {
    info!(%slot, "Slot mapping delete");

    let mapping = ctx.store.delete_slot(&slot)?;
    ctx.supervisor.replace(&mapping).await;

    Ok(success())
}

async fn health_snapshot(Extension(ctx): Extension<AppContext>) -> impl IntoResponse {
    Json(health::snapshot(&ctx.router, &ctx.store, ctx.strips.as_deref()).await)
}

async fn reboot_strips(
    Extension(ctx): Extension<AppContext>,
) -> Result<impl IntoResponse, Response> {
    let fleet = require_strips(&ctx)?;
    fleet.reboot_all().await;

    Ok(success())
}

async fn push_profile(
    Extension(ctx): Extension<AppContext>,
) -> Result<impl IntoResponse, Response> {
    let fleet = require_strips(&ctx)?;
    fleet.push_passthrough_profile_all().await;

    Ok(success())
}

fn require_strips(ctx: &AppContext) -> Result<Arc<StripFleet>, Response> {
    ctx.strips.clone().ok_or_else(|| {
        (StatusCode::NOT_FOUND, "No power strips on this rack").into_response()
    })
}

fn success() -> impl IntoResponse {
    Json(json!({ "success": true }))
}
