//! Realtime client.
//!
//! A supervisor task owns the socket. It authenticates with the current
//! access token, dispatches event frames to subscriptions, re-authenticates
//! before the token expires, and reconnects with backoff whenever the
//! connection is lost. Subscriptions live on the client, not the socket, so
//! they survive reconnects.

use crate::backoff::{BackoffState, ReconnectBackoff};
use crate::messages::{ClientFrame, Event, ServerFrame};
use crate::subscription::{
    EventFilter, EventHandler, EventSubscription, HandlerError, SubscriptionId,
    SubscriptionRegistry,
};
use crate::transport::{Connector, FrameTransport, WsConnector};
use crate::{RelayError, RelayResult};
use auth_engine::{CredentialSource, CredentialStore};
use chrono::Utc;
use homeguard_core::RealtimeConfig;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

const STATUS_CHANNEL_CAPACITY: usize = 100;
const MIN_REAUTH_INTERVAL: Duration = Duration::from_secs(1);

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Connected,
    WaitingToReconnect,
    Stopped,
}

/// Status notifications emitted by the realtime client.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeStatus {
    /// Opening a connection; `attempt` counts failures since the last success.
    Connecting { attempt: u32 },
    /// Handshake accepted.
    Connected,
    /// Connection lost or never established.
    Disconnected { reason: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// The live socket was re-authenticated with a refreshed credential.
    Reauthenticated,
    /// The server rejected the credential, or no credential could be obtained.
    AuthFailed { reason: String },
    HandlerFailed {
        subscription: SubscriptionId,
        error: String,
    },
    Stopped,
}

struct Shared {
    registry: SubscriptionRegistry,
    status_tx: broadcast::Sender<RealtimeStatus>,
    state: RwLock<ConnectionState>,
    backoff: Mutex<BackoffState>,
}

impl Shared {
    fn emit(&self, status: RealtimeStatus) {
        let _ = self.status_tx.send(status);
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Push-event client with automatic reconnection.
pub struct RealtimeClient {
    config: RealtimeConfig,
    credentials: Arc<dyn CredentialSource>,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl RealtimeClient {
    pub fn new(
        config: RealtimeConfig,
        credentials: Arc<dyn CredentialSource>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            config,
            credentials,
            connector,
            shared: Arc::new(Shared {
                registry: SubscriptionRegistry::new(),
                status_tx,
                state: RwLock::new(ConnectionState::Idle),
                backoff: Mutex::new(BackoffState::default()),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Client over a real WebSocket connection.
    pub fn with_websocket(config: RealtimeConfig, credentials: Arc<dyn CredentialSource>) -> Self {
        Self::new(config, credentials, Arc::new(WsConnector::new()))
    }

    /// Start the supervisor task. Subscriptions registered before this call
    /// receive events from the first connection on.
    pub fn start(&self) -> RelayResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(RelayError::AlreadyStarted);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| RelayError::Runtime(e.to_string()))?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor {
            config: self.config.clone(),
            credentials: self.credentials.clone(),
            connector: self.connector.clone(),
            shared: self.shared.clone(),
        };

        let handle = runtime.spawn(supervisor.run(Shutdown(shutdown_rx)));
        *worker = Some(Worker {
            shutdown: shutdown_tx,
            handle,
        });

        info!(
            url = %self.config.url,
            subscriptions = self.shared.registry.len(),
            "Realtime client started"
        );
        Ok(())
    }

    /// Close the connection, cancel any pending reconnect and drop every
    /// subscription. Once this returns no handler is invoked again. Safe to
    /// call more than once.
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(true);
            if let Err(e) = worker.handle.await {
                error!(error = %e, "Realtime supervisor task failed");
            }
            info!("Realtime client stopped");
        }
        self.shared.registry.clear();
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Register a handler. Safe while connected; no reconnect is needed.
    pub fn subscribe(
        &self,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> EventSubscription {
        let subscription = self.shared.registry.register(filter, handler);
        debug!(subscription = %subscription.id(), filter = ?subscription.filter(), "Subscribed");
        subscription
    }

    pub fn subscribe_fn<F>(&self, filter: EventFilter, handler: F) -> EventSubscription
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(filter, Arc::new(handler))
    }

    /// Returns false if the subscription was already removed. If its handler
    /// is running on another thread, waits for it to return.
    pub fn unsubscribe(&self, subscription: &EventSubscription) -> bool {
        let removed = self.shared.registry.remove(subscription);
        if removed {
            debug!(subscription = %subscription.id(), "Unsubscribed");
        }
        removed
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn status_events(&self) -> broadcast::Receiver<RealtimeStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn backoff_state(&self) -> BackoffState {
        *self.shared.backoff.lock()
    }
}

struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    async fn wait(&mut self) {
        loop {
            let stopping = *self.0.borrow_and_update();
            if stopping || self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

enum Step {
    Continue,
    Shutdown,
    Lost(String),
    Rejected(String),
    Reauthenticate,
}

struct Supervisor {
    config: RealtimeConfig,
    credentials: Arc<dyn CredentialSource>,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
}

impl Supervisor {
    async fn run(self, mut shutdown: Shutdown) {
        let mut backoff = ReconnectBackoff::from_config(&self.config);

        loop {
            let reason = match self.connect_and_serve(&mut shutdown, &mut backoff).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(reason) => reason,
            };

            warn!(reason = %reason, "Realtime connection lost");
            self.shared.emit(RealtimeStatus::Disconnected { reason });

            let delay = backoff.next_delay();
            let state = backoff.state();
            *self.shared.backoff.lock() = state;
            self.shared.set_state(ConnectionState::WaitingToReconnect);
            info!(
                attempt = state.attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling realtime reconnect"
            );
            self.shared.emit(RealtimeStatus::ReconnectScheduled {
                attempt: state.attempt,
                delay,
            });

            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = sleep(delay) => {}
            }
        }

        self.shared.set_state(ConnectionState::Stopped);
        self.shared.emit(RealtimeStatus::Stopped);
    }

    async fn connect_and_serve(
        &self,
        shutdown: &mut Shutdown,
        backoff: &mut ReconnectBackoff,
    ) -> SessionEnd {
        self.shared.set_state(ConnectionState::Connecting);
        self.shared.emit(RealtimeStatus::Connecting {
            attempt: backoff.state().attempt,
        });

        // Refreshed first if it would expire soon after the handshake.
        let credential = tokio::select! {
            biased;
            _ = shutdown.wait() => return SessionEnd::Shutdown,
            result = self.credentials.credentials(self.config.refresh_margin()) => match result {
                Ok(credential) => credential,
                Err(e) => {
                    self.shared.emit(RealtimeStatus::AuthFailed { reason: e.to_string() });
                    return SessionEnd::Lost(format!("no usable credential: {}", e));
                }
            },
        };

        let mut transport = tokio::select! {
            biased;
            _ = shutdown.wait() => return SessionEnd::Shutdown,
            result = timeout(self.config.handshake_timeout(), self.connector.connect(&self.config.url)) => {
                match result {
                    Ok(Ok(transport)) => transport,
                    Ok(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    Err(_) => return SessionEnd::Lost(RelayError::Timeout.to_string()),
                }
            }
        };

        self.shared.set_state(ConnectionState::Authenticating);
        let handshake = tokio::select! {
            biased;
            _ = shutdown.wait() => Err(None),
            result = timeout(
                self.config.handshake_timeout(),
                self.authenticate(transport.as_mut(), &credential),
            ) => result.unwrap_or(Err(RelayError::Timeout)).map_err(Some),
        };

        match handshake {
            Ok(()) => {}
            Err(None) => {
                transport.close().await;
                return SessionEnd::Shutdown;
            }
            Err(Some(RelayError::AuthRejected(reason))) => {
                return self
                    .rejected(shutdown, transport, &credential, reason)
                    .await;
            }
            Err(Some(e)) => {
                transport.close().await;
                return SessionEnd::Lost(e.to_string());
            }
        }

        backoff.reset();
        *self.shared.backoff.lock() = backoff.state();
        self.shared.set_state(ConnectionState::Connected);
        info!(url = %self.config.url, "Realtime connection established");
        self.shared.emit(RealtimeStatus::Connected);

        self.serve(shutdown, transport, credential).await
    }

    /// Send the auth frame and wait for the server's verdict.
    async fn authenticate(
        &self,
        transport: &mut dyn FrameTransport,
        credential: &CredentialStore,
    ) -> RelayResult<()> {
        let frame = ClientFrame::auth(credential.access_token(), self.credentials.user_id());
        transport.send(frame.to_json()?).await?;
        debug!("Sent realtime auth frame");

        loop {
            let text = match transport.recv().await {
                Some(frame) => frame?,
                None => return Err(RelayError::Closed),
            };
            match ServerFrame::parse(&text) {
                Ok(ServerFrame::AuthOk) => return Ok(()),
                Ok(ServerFrame::AuthRejected { message }) => {
                    return Err(RelayError::AuthRejected(message))
                }
                Ok(ServerFrame::Event(event)) => self.dispatch(&event),
                Err(e) => warn!(error = %e, "Skipping malformed realtime frame"),
            }
        }
    }

    async fn serve(
        &self,
        shutdown: &mut Shutdown,
        mut transport: Box<dyn FrameTransport>,
        mut credential: Arc<CredentialStore>,
    ) -> SessionEnd {
        let margin = self.config.refresh_margin();

        loop {
            let step = tokio::select! {
                biased;
                _ = shutdown.wait() => Step::Shutdown,
                frame = transport.recv() => match frame {
                    Some(Ok(text)) => self.handle_frame(&text),
                    Some(Err(e)) => Step::Lost(e.to_string()),
                    None => Step::Lost(RelayError::Closed.to_string()),
                },
                _ = sleep(reauth_delay(&credential, margin)) => Step::Reauthenticate,
            };

            match step {
                Step::Continue => {}
                Step::Shutdown => {
                    transport.close().await;
                    return SessionEnd::Shutdown;
                }
                Step::Lost(reason) => {
                    transport.close().await;
                    return SessionEnd::Lost(reason);
                }
                Step::Rejected(reason) => {
                    return self
                        .rejected(shutdown, transport, &credential, reason)
                        .await;
                }
                Step::Reauthenticate => {
                    let fresh = tokio::select! {
                        biased;
                        _ = shutdown.wait() => {
                            transport.close().await;
                            return SessionEnd::Shutdown;
                        }
                        result = self.credentials.credentials(margin) => result,
                    };

                    match fresh {
                        Ok(fresh) if Arc::ptr_eq(&fresh, &credential) => {}
                        Ok(fresh) => {
                            let frame =
                                ClientFrame::auth(fresh.access_token(), self.credentials.user_id());
                            let sent = match frame.to_json() {
                                Ok(json) => transport.send(json).await,
                                Err(e) => Err(e),
                            };
                            if let Err(e) = sent {
                                transport.close().await;
                                return SessionEnd::Lost(e.to_string());
                            }
                            info!("Re-authenticated realtime socket with refreshed credential");
                            self.shared.emit(RealtimeStatus::Reauthenticated);
                            credential = fresh;
                        }
                        Err(e) if e.is_transient() => {
                            warn!(error = %e, "Credential refresh failed, keeping current socket");
                        }
                        Err(e) => {
                            self.shared.emit(RealtimeStatus::AuthFailed {
                                reason: e.to_string(),
                            });
                            transport.close().await;
                            return SessionEnd::Lost(format!("credential refresh failed: {}", e));
                        }
                    }
                }
            }
        }
    }

    /// The server refused `credential`: replace it so the next connection
    /// authenticates with a fresh one.
    async fn rejected(
        &self,
        shutdown: &mut Shutdown,
        mut transport: Box<dyn FrameTransport>,
        credential: &Arc<CredentialStore>,
        reason: String,
    ) -> SessionEnd {
        warn!(reason = %reason, "Realtime credential rejected");
        self.shared.emit(RealtimeStatus::AuthFailed {
            reason: reason.clone(),
        });
        transport.close().await;

        tokio::select! {
            biased;
            _ = shutdown.wait() => return SessionEnd::Shutdown,
            result = self.credentials.renew(credential) => {
                if let Err(e) = result {
                    warn!(error = %e, "Could not renew rejected credential");
                }
            }
        }
        SessionEnd::Lost(format!("authentication rejected: {}", reason))
    }

    fn handle_frame(&self, text: &str) -> Step {
        match ServerFrame::parse(text) {
            Ok(ServerFrame::Event(event)) => {
                self.dispatch(&event);
                Step::Continue
            }
            Ok(ServerFrame::AuthOk) => {
                debug!("Realtime credential accepted");
                Step::Continue
            }
            Ok(ServerFrame::AuthRejected { message }) => Step::Rejected(message),
            Err(e) => {
                warn!(error = %e, "Skipping malformed realtime frame");
                Step::Continue
            }
        }
    }

    fn dispatch(&self, event: &Event) {
        let report = self.shared.registry.dispatch(event);
        debug!(
            event_type = %event.event_type(),
            system_id = event.system_id(),
            delivered = report.delivered,
            "Dispatched realtime event"
        );
        for failure in report.failures {
            self.shared.emit(RealtimeStatus::HandlerFailed {
                subscription: failure.subscription,
                error: failure.error,
            });
        }
    }
}

/// Time until the live socket should re-authenticate: `margin` before expiry,
/// but never sooner than half the remaining lifetime.
fn reauth_delay(credential: &CredentialStore, margin: Duration) -> Duration {
    let remaining = credential.remaining_at(Utc::now()).unwrap_or(Duration::ZERO);
    remaining
        .saturating_sub(margin)
        .max(remaining / 2)
        .max(MIN_REAUTH_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn credential_expiring_in(secs: i64) -> CredentialStore {
        let now = Utc::now();
        CredentialStore::new("a", "r", now + ChronoDuration::seconds(secs), now)
    }

    #[test]
    fn test_reauth_delay_leaves_margin() {
        let delay = reauth_delay(&credential_expiring_in(3600), Duration::from_secs(120));
        assert!(delay <= Duration::from_secs(3480));
        assert!(delay >= Duration::from_secs(3470));
    }

    #[test]
    fn test_reauth_delay_short_lifetime_uses_half() {
        let delay = reauth_delay(&credential_expiring_in(10), Duration::from_secs(120));
        assert!(delay <= Duration::from_secs(5));
        assert!(delay >= Duration::from_secs(4));
    }

    #[test]
    fn test_reauth_delay_has_floor() {
        let delay = reauth_delay(&credential_expiring_in(-5), Duration::from_secs(120));
        assert_eq!(delay, MIN_REAUTH_INTERVAL);
    }
}
