//! Subcommand implementations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use auth_engine::{
    AuthClient, AuthError, CredentialStore, HttpBackend, LoginOutcome, PendingAuthorization,
};
use homeguard_core::Config;
use realtime_relay::{Event, EventFilter, HandlerError, RealtimeClient, RealtimeStatus};
use rest_transport::RestTransport;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

pub async fn login(auth: &AuthClient, email: &str, poll_interval: Duration) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        eprintln!("Password for {}:", email);
        let Some(password) = lines.next_line().await? else {
            bail!("no password provided");
        };

        let outcome = match auth.login_with_credentials(email, password.trim_end()).await {
            Ok(outcome) => outcome,
            Err(AuthError::InvalidCredentials(message)) => {
                eprintln!("Login failed: {}", message);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let credential = match outcome {
            LoginOutcome::Authenticated(credential) => credential,
            LoginOutcome::PendingAuthorization(pending) => {
                println!("{}", pending.message());
                match wait_for_approval(auth, &pending, poll_interval).await? {
                    Some(credential) => credential,
                    None => continue,
                }
            }
        };

        print_refresh_token(auth, &credential);
        return Ok(());
    }
}

/// Poll until the challenge is approved. `None` if it was rejected.
async fn wait_for_approval(
    auth: &AuthClient,
    pending: &PendingAuthorization,
    poll_interval: Duration,
) -> anyhow::Result<Option<Arc<CredentialStore>>> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                auth.abandon_authorization(pending.clone())?;
                bail!("login cancelled");
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }

        match auth.complete_authorization(pending).await {
            Ok(credential) => return Ok(Some(credential)),
            Err(AuthError::AuthorizationPending(_)) => debug!("Waiting for MFA approval"),
            Err(AuthError::InvalidCredentials(message)) => {
                eprintln!("MFA challenge rejected: {}", message);
                return Ok(None);
            }
            Err(e) if e.is_transient() => warn!(error = %e, "MFA poll failed, retrying"),
            Err(e) => return Err(e.into()),
        }
    }
}

fn print_refresh_token(auth: &AuthClient, credential: &CredentialStore) {
    eprintln!(
        "Logged in as client {}. Refresh token (pass to --refresh-token):",
        auth.client_id()
    );
    println!("{}", credential.refresh_token());
}

pub async fn watch(
    config: &Config,
    auth: Arc<AuthClient>,
    refresh_token: &str,
    types: Vec<String>,
) -> anyhow::Result<()> {
    auth.login_with_refresh_token(refresh_token)
        .await
        .context("could not restore session")?;

    let client = RealtimeClient::with_websocket(config.realtime.clone(), auth.clone());
    let _subscription = client.subscribe_fn(
        EventFilter::only(types),
        |event: &Event| -> Result<(), HandlerError> {
            println!("{}", serde_json::to_string(event)?);
            Ok(())
        },
    );

    let mut status = client.status_events();
    client.start()?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = status.recv() => match update {
                Ok(RealtimeStatus::Stopped) | Err(RecvError::Closed) => break,
                Ok(update) => info!(status = ?update, "Realtime status"),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Status updates skipped"),
            },
        }
    }

    client.stop().await;
    Ok(())
}

pub async fn get(
    auth: Arc<AuthClient>,
    backend: Arc<dyn HttpBackend>,
    refresh_token: &str,
    path: &str,
) -> anyhow::Result<()> {
    auth.login_with_refresh_token(refresh_token)
        .await
        .context("could not restore session")?;

    let transport = RestTransport::new(auth, backend);
    let body = transport.get(path).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
