//! Headless sync daemon for a slideshow device.
//!
//! Run with:
//! ```bash
//! LOOKOUT_CLIENT_ID=... LOOKOUT_REDIRECT_URI=http://localhost:8080/callback \
//!     cargo run -p core-service --example slideshow_sync
//!
//! # Credential in the OS keyring instead of the token file
//! LOOKOUT_SECRETS=keyring cargo run -p core-service --example slideshow_sync
//!
//! # JSON logs
//! cargo run -p core-service --example slideshow_sync -- json
//! ```
//!
//! Without a stored credential the consent URL is printed; paste the `code`
//! and `state` query parameters of the redirect on one line to authorize.
//! Ctrl-C stops the daemon.

use bridge_traits::time::LogLevel;
use core_auth::{CredentialState, OAuthConfig};
use core_runtime::events::{CoreEvent, SyncEvent};
use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
use core_service::{desktop_config, AppDirectories, CoreService, SecretBackend};
use std::env;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let format = match env::args().nth(1).as_deref() {
        Some("json") => LogFormat::Json,
        Some("compact") => LogFormat::Compact,
        _ => LogFormat::default(),
    };
    init_logging(LoggingConfig::default().with_format(format).with_level(LogLevel::Info))?;

    let client_id = env::var("LOOKOUT_CLIENT_ID")?;
    let redirect_uri = env::var("LOOKOUT_REDIRECT_URI")?;
    let client_secret = env::var("LOOKOUT_CLIENT_SECRET").ok();
    let oauth = OAuthConfig::google_photos(client_id, client_secret, redirect_uri);

    let secrets = match env::var("LOOKOUT_SECRETS").as_deref() {
        Ok("keyring") => SecretBackend::Keyring,
        _ => SecretBackend::File,
    };
    let config = desktop_config(&AppDirectories::resolve(), secrets).await?;
    let service = CoreService::bootstrap(config, oauth).await?;
    info!(entries = service.current_entries(None).len(), "Cache opened");

    if service.credential_state().await.needs_authorization() {
        authorize(&service).await?;
    }

    let mut events = service.subscribe_events();
    service.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(CoreEvent::Sync(SyncEvent::Completed { downloaded, evicted, .. })) => {
                    let status = service.sync_status().await;
                    info!(
                        downloaded,
                        evicted,
                        bytes_used = status.bytes_used,
                        quota_bytes = status.quota_bytes,
                        "Cache in sync"
                    );
                }
                Ok(CoreEvent::Sync(SyncEvent::Failed { message, recoverable, .. })) => {
                    warn!(%message, recoverable, "Sync failed");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Event stream lagged"),
            },
        }
    }

    service.shutdown().await?;
    Ok(())
}

async fn authorize(service: &CoreService) -> Result<(), Box<dyn std::error::Error>> {
    println!("Open this URL to grant read access to your photos:");
    println!("{}", service.authorization_url().await?);
    println!("Then paste `<code> <state>` from the redirect:");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        let (Some(code), Some(state)) = (parts.next(), parts.next()) else {
            println!("Expected `<code> <state>`");
            continue;
        };
        match service.complete_authorization(code, state).await {
            Ok(()) => break,
            Err(e) => {
                error!(error = %e, "Authorization failed");
                println!("{}", service.authorization_url().await?);
            }
        }
    }

    if service.credential_state().await != CredentialState::Valid {
        warn!("Continuing without authorization; cached photos remain available");
    }
    Ok(())
}
