use anyhow::Result;
use chat_mesh::logging::{init_logging, init_logging_pretty};
use chat_mesh::{BleRadio, LoggingObserver, MeshConfig, MeshController, PeerIdentity};
use rand::Rng;
use std::env;
use std::sync::Arc;

/// Local identity: `MESH_IDENTITY`, or a generated `user#NNNN`
fn local_identity() -> PeerIdentity {
    match env::var("MESH_IDENTITY") {
        Ok(identity) if !identity.trim().is_empty() => PeerIdentity::new(identity.trim()),
        _ => {
            let digits: u16 = rand::thread_rng().gen_range(0..10_000);
            PeerIdentity::new(format!("user#{:04}", digits))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    if env::var("MESH_LOG_FORMAT").unwrap_or_default() == "pretty" {
        init_logging_pretty();
    } else {
        init_logging();
    }

    let config = MeshConfig::from_env()?;
    tracing::info!("Configuration loaded successfully");

    let identity = local_identity();
    let radio = Arc::new(BleRadio::new(&config));
    let controller = MeshController::new(identity.clone(), config, radio, Arc::new(LoggingObserver));

    controller.start().await?;
    tracing::info!("mesh-node running as {}, press Ctrl-C to stop", identity);

    tokio::signal::ctrl_c().await?;

    tracing::info!(
        relayed = controller.relay_count(),
        pending = controller.pending_outbox().await,
        "Shutting down"
    );
    controller.stop().await?;

    Ok(())
}
