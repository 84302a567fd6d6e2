//! sqlsink daemon
//!
//! Loads the backend configuration, registers every backend and accepts
//! admin commands on stdin, one per line. On Ctrl-C every backend is drained
//! with a bounded wait before exit.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | SQLSINK_CONFIG | sqlsink.toml | Configuration file |
//! | SQLSINK_LOG_FORMAT | text | `text` or `json` |
//! | RUST_LOG | info | Log filter |

use sqlsink::admin::AdminRegistry;
use sqlsink::config::{load_config, PersistenceConfig};
use sqlsink::observability::{init_tracing, LogFormat};
use sqlsink::{InMemoryValueStore, PersistenceManager};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(LogFormat::from_env());

    let config_path = PersistenceConfig::path_from_env();
    let config = load_config(&config_path)?;
    let drain_wait = config
        .backends
        .iter()
        .map(|b| b.drain_wait)
        .max()
        .unwrap_or_default();

    let manager = PersistenceManager::from_config(&config, Arc::new(InMemoryValueStore::new()))?;
    info!(
        config = %config_path.display(),
        backends = config.backends.len(),
        "sqlsink started"
    );

    let admin = AdminRegistry::new(config_path);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupt received, draining backends");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match admin.dispatch(&manager, &line).await {
                    Ok(out) if !out.is_empty() => println!("{}", out),
                    Ok(_) => {}
                    Err(e) => println!("error: {}", e),
                },
                Ok(None) => {
                    info!("Admin input closed, running until interrupted");
                    stdin_open = false;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read admin input");
                    stdin_open = false;
                }
            }
        }
    }

    let failed = manager.shutdown(drain_wait).await;
    for (backend, e) in &failed {
        warn!(backend = %backend, error = %e, "Rows left unflushed at exit");
    }
    Ok(())
}
