use std::net::SocketAddr;
use std::sync::Arc;

use axum::{response::IntoResponse, routing::get, Extension, Router};
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::Config, gateway, http, http::AppContext, mapping::MappingStore, router,
    strip::StripFleet, supervisor::ConnectionSupervisor,
};

/// The default port to run the server on.
pub const DEFAULT_PORT: u16 = 15080;

async fn run(config: Config, port: Option<u16>, allocated_port: Option<oneshot::Sender<u16>>) {
    config.validate().expect("Configuration must be valid");

    let store = Arc::new(
        MappingStore::load(&config.mapping_path).expect("The mapping document must load"),
    );
    let mapping = store.snapshot();

    let slot_router = router::Router::new();
    let supervisor = Arc::new(ConnectionSupervisor::new(
        slot_router.clone(),
        config.log_dir.clone(),
    ));

    // Plain UART racks have no strips to manage; everything else gets its
    // fleet discovered up front.
    let strips = if mapping.is_uart_only() {
        None
    } else {
        config
            .strips
            .clone()
            .map(|settings| Arc::new(StripFleet::new(settings.with_env_overrides())))
    };

    if let Some(fleet) = &strips {
        if let Err(e) = fleet.discover().await {
            warn!("Strip discovery failed: {e}");
        }
    }

    supervisor.connect_all(&mapping).await;

    let ctx = AppContext {
        router: slot_router,
        store,
        supervisor,
        strips,
    };

    let app = Router::new()
        .route("/", get(alive))
        .route("/ws/:slot", get(gateway::ws_handler))
        .nest("/api", http::routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Every handler needs to be able to reach the core.
                .layer(Extension(ctx)),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(0)));
    let server =
        axum::Server::bind(&addr).serve(app.into_make_service_with_connect_info::<SocketAddr>());
    let addr = server.local_addr();

    if let Some(port_reply) = allocated_port {
        port_reply
            .send(addr.port())
            .expect("The receiver of which port was allocated should not be dropped");
    }

    info!("listening on {}", addr);

    server.await.unwrap();
}

/// Start the server on an arbitrary available port.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(config: Config, allocated_port: oneshot::Sender<u16>) {
    run(config, None, Some(allocated_port)).await
}

/// Start the server on the given port.
pub async fn run_on_port(config: Config, port: u16) {
    run(config, Some(port), None).await
}

async fn alive() -> impl IntoResponse {
    format!("Slotline v{} is up\n", env!("CARGO_PKG_VERSION"))
}
