//! Server lifecycle management helpers.
//!
//! Bootstrapping (pool, registries, schema bootstrap, background tasks),
//! HTTP server wiring, and graceful shutdown live here so `main.rs` stays
//! a thin orchestrator.

use crate::config::AppConfig;
use actix_web::middleware::NormalizePath;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use log::{info, warn};
use std::sync::Arc;
use trellis_data::AccessorRegistry;
use trellis_gateway::{routes, DataService};
use trellis_live::{InvalidationEngine, InvalidationRegistry, NotificationRouter};
use trellis_schema::{MaintenanceTask, SchemaCoordinator, SchemaManager};
use trellis_store::{change_channel, Database, SCHEMA_EVENT_CHANNEL};

/// Everything the HTTP server and shutdown path share.
pub struct Components {
    pub db: Database,
    pub service: DataService,
}

/// Open the pool, ensure the global schema, and start the notification
/// router and maintenance task.
pub async fn bootstrap(config: &AppConfig) -> Result<Components> {
    let db = Database::connect(&config.database).await?;
    info!(
        "connected to postgres at {}:{}/{}",
        config.database.host, config.database.port, config.database.database
    );

    let registry = Arc::new(AccessorRegistry::standard());
    let manager = Arc::new(SchemaManager::new(
        db.clone(),
        Arc::clone(&registry),
        InvalidationRegistry::standard(),
        config.schema.clone(),
    ));
    manager.bootstrap().await?;

    // Change pipeline: every tracked table feeds the invalidation engine;
    // the structural channel feeds the schema coordinator.
    let engine = Arc::new(InvalidationEngine::new(
        db.clone(),
        InvalidationRegistry::standard(),
    ));
    let coordinator = Arc::new(SchemaCoordinator::new(Arc::clone(&manager)));
    let mut router = NotificationRouter::new(db.clone());
    for table in registry.tables() {
        router.subscribe(change_channel(&table), engine.clone());
    }
    router.subscribe(SCHEMA_EVENT_CHANNEL, coordinator);
    router.spawn();

    MaintenanceTask::new(db.clone(), Arc::clone(&registry), config.maintenance.clone()).spawn();

    let service = DataService::new(db.clone(), registry, manager, config.server.clone());
    Ok(Components { db, service })
}

/// Start the HTTP server and manage graceful shutdown.
pub async fn run(config: &AppConfig, components: Components) -> Result<()> {
    let bind_addr = config.server.bind_address();
    info!("starting HTTP server on {}:{}", bind_addr.0, bind_addr.1);

    let service = components.service.clone();
    let mut server = HttpServer::new(move || {
        App::new()
            .wrap(NormalizePath::trim())
            .app_data(web::Data::new(service.clone()))
            .configure(routes::configure)
    })
    .bind(bind_addr)?;
    if config.server.workers > 0 {
        server = server.workers(config.server.workers);
    }
    let server = server.run();
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            if let Err(e) = result {
                log::error!("server task failed: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping HTTP server");
            // Stop accepting requests; in-flight ones finish first
            server_handle.stop(true).await;
        }
    }

    // Open transactions roll back as their connections close
    components.db.close().await;
    info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!("cannot install SIGTERM handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
