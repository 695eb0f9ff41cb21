use std::net::SocketAddr;
use std::sync::Arc;

use api_router::{api_state::ApiState, app_router};
use clap::Parser;
use common::{
    config::get_config,
    ontology::OntologyRegistry,
    storage::{db::SurrealDbClient, object::ObjectStorage},
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "graph-memory", about = "Knowledge-graph memory service")]
struct Cli {
    /// Overrides the configured HTTP port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let mut config = get_config()?;
    if let Some(port) = cli.port {
        config.http_port = port;
    }

    // Ontologies load before anything touches the stores; a malformed
    // document fails startup here.
    let ontologies = OntologyRegistry::load_dir(&config.ontology_dir)?;
    info!(ontologies = ?ontologies.names(), "ontology registry ready");

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized(config.embedding_dimensions as usize)
        .await?;

    let storage = ObjectStorage::new(&config).await?;

    let state = ApiState::new(&config, db, storage, ontologies).await?;
    let app = app_router(state);

    let serve_address = format!("0.0.0.0:{}", config.http_port);
    info!("Starting server listening on {serve_address}");
    let listener = tokio::net::TcpListener::bind(serve_address).await?;

    // Connect info feeds the loopback carve-out on the streaming endpoints.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received, draining connections");
}
