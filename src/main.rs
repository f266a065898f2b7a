use std::{net::SocketAddr, sync::Arc, time::Duration};

use http::HeaderValue;
use tokio::{signal, sync::watch};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};
use tracing::{error, info};

use booking_reconciler as api;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Gateway client and notification pipeline
    let gateway: Arc<dyn api::gateway::GatewayClient> =
        Arc::new(api::gateway::phonepe::PhonePeClient::new(&cfg.gateway)?);
    let message_queue: Arc<dyn api::message_queue::MessageQueue> =
        Arc::new(api::message_queue::InMemoryMessageQueue::new());
    let dispatcher: Arc<dyn api::notifications::NotificationDispatcher> = Arc::new(
        api::notifications::QueueNotificationDispatcher::new(message_queue.clone()),
    );

    // Aggregate app services used by HTTP handlers and workers
    let services =
        api::handlers::AppServices::new(db_arc.clone(), &cfg, gateway, dispatcher);

    // The notifier stops last so its final drain sees every enqueued booking
    let (poller_stop_tx, poller_stop_rx) = watch::channel(false);
    let (notifier_stop_tx, notifier_stop_rx) = watch::channel(false);
    let notifier = api::notifications::NotificationWorker::new(
        message_queue,
        Arc::new(api::notifications::LoggingSink),
    )
    .start(notifier_stop_rx);

    let poller = if cfg.poller.enabled {
        Some(services.poller.clone().start(poller_stop_rx))
    } else {
        info!("Auto-completion poller disabled by configuration");
        None
    };

    // Compose shared app state
    let app_state = api::AppState {
        db: db_arc.clone(),
        config: cfg.clone(),
        services,
    };

    // Build CORS layer from config
    let configured_origins: Option<Vec<HeaderValue>> = cfg
        .cors_allowed_origins
        .as_ref()
        .map(|raw| {
            raw.split(',')
                .filter_map(|origin| {
                    let trimmed = origin.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        HeaderValue::from_str(trimmed).ok()
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty());

    let cors_layer = match configured_origins {
        Some(origins) => CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any),
        None if cfg.is_development() => {
            info!("Using permissive CORS in development");
            CorsLayer::permissive()
        }
        None => CorsLayer::new(),
    };

    // Redirect resolution has its own deadline; this only caps runaway requests
    let request_timeout =
        Duration::from_secs(cfg.redirect_timeout_secs.max(cfg.gateway.timeout_secs) + 30);

    let app = api::app_router(app_state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(cors_layer);

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    info!("booking-reconciler listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = poller_stop_tx.send(true);
    if let Some(poller) = poller {
        if let Err(e) = poller.await {
            error!("Auto-completion poller ended abnormally: {}", e);
        }
    }
    let _ = notifier_stop_tx.send(true);
    if let Err(e) = notifier.await {
        error!("Notification worker ended abnormally: {}", e);
    }
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
