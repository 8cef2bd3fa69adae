/// Drives a running server through the client coordinator.
///
/// Start the server with the dev settings first:
/// $ cargo run
/// $ cargo run --bin session_demo -- --settings=settings/dev.toml
use futures_util::future::join_all;
use scriptorium::client::*;
use scriptorium::logger::*;
use scriptorium::settings::*;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let logger = Logger::new_bootstrap();
    let cli = Cli::parse();
    let project_settings = parse_settings(cli.settings.as_deref())?;
    logger.reload_from_config(&LogConfig::from(&project_settings.log))?;

    let vault = Arc::new(MemoryVault::new());
    let client = AuthorizedClient::from_settings(&project_settings.client, vault.clone())?;

    let mut status = client.coordinator().subscribe();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let now = *status.borrow();
            info!(?now, "session status changed");
        }
    });

    let principal = client.login("editor", "editor-dev-password").await?;
    info!(?principal, "logged in");

    // Pretend the access token went stale on every in-flight call at once.
    if let Some(mut pair) = vault.load() {
        pair.access_token = scriptorium::application_port::AccessToken("stale".into());
        client.coordinator().sign_in(pair);
    }
    let calls = (0..5).map(|_| client.me());
    for (i, result) in join_all(calls).await.into_iter().enumerate() {
        info!(i, ?result, "me");
    }

    let active = client.active_sessions().await?;
    info!(count = active.count, "active sessions");

    client.logout().await?;
    info!(after_logout = ?client.me().await, "logged out");

    Ok(())
}
