use super::error::ClientError;
use super::vault::TokenVault;
use crate::application_port::{AccessToken, SessionPair};
use crate::domain_model::RefreshToken;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// The calls the coordinator makes on the wire.
#[async_trait::async_trait]
pub trait RefreshTransport: Send + Sync {
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<SessionPair, ClientError>;

    /// Best-effort revocation of a pair nobody will use.
    async fn revoke(&self, _refresh_token: &RefreshToken) -> Result<(), ClientError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    SignedOut,
    Active,
    Refreshing,
    Expired,
}

type Outcome = Result<AccessToken, ClientError>;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct FlightState {
    in_flight: bool,
    waiters: Vec<Waiter>,
    next_id: u64,
    // Bumped by sign_in/sign_out; a refresh started under an older epoch is discarded.
    epoch: u64,
}

struct Shared {
    transport: Arc<dyn RefreshTransport>,
    vault: Arc<dyn TokenVault>,
    // Never held across an await.
    state: Mutex<FlightState>,
    status: watch::Sender<SessionStatus>,
    refresh_timeout: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FlightState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Single-flight refresh: however many calls see a rejected access token at
/// once, one refresh goes out and every caller resumes with its result.
#[derive(Clone)]
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

/// Drops the caller's queue entry if it stops waiting.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let id = self.id;
        self.shared.lock().waiters.retain(|w| w.id != id);
    }
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn RefreshTransport>,
        vault: Arc<dyn TokenVault>,
        refresh_timeout: Duration,
    ) -> Self {
        let initial = if vault.load().is_some() {
            SessionStatus::Active
        } else {
            SessionStatus::SignedOut
        };
        let (status, _) = watch::channel(initial);
        RefreshCoordinator {
            shared: Arc::new(Shared {
                transport,
                vault,
                state: Mutex::new(FlightState::default()),
                status,
                refresh_timeout,
            }),
        }
    }

    pub fn sign_in(&self, pair: SessionPair) {
        let mut state = self.shared.lock();
        state.epoch += 1;
        self.shared.vault.save(pair);
        self.shared.status.send_replace(SessionStatus::Active);
    }

    pub fn sign_out(&self) {
        let mut state = self.shared.lock();
        state.epoch += 1;
        self.shared.vault.clear();
        self.shared.status.send_replace(SessionStatus::SignedOut);
    }

    pub fn session(&self) -> Option<SessionPair> {
        self.shared.vault.load()
    }

    pub fn access_token(&self) -> Option<AccessToken> {
        self.shared.vault.load().map(|pair| pair.access_token)
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// Callers currently waiting on a refresh.
    pub fn pending_len(&self) -> usize {
        self.shared.lock().waiters.len()
    }

    /// Returns an access token to retry with after `rejected` was refused.
    pub async fn refreshed_token(&self, rejected: &AccessToken) -> Result<AccessToken, ClientError> {
        let (id, rx) = {
            let mut state = self.shared.lock();

            let refresh_token = if state.in_flight {
                None
            } else {
                let Some(pair) = self.shared.vault.load() else {
                    return Err(ClientError::SessionExpired);
                };
                // Someone already refreshed since this token was sent.
                if pair.access_token != *rejected {
                    debug!("access token already replaced, retrying without refresh");
                    return Ok(pair.access_token);
                }
                state.in_flight = true;
                Some(pair.refresh_token)
            };

            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push(Waiter { id, tx });

            if let Some(refresh_token) = refresh_token {
                self.shared.status.send_replace(SessionStatus::Refreshing);
                // Detached so the flag is cleared even if this caller goes away.
                let shared = self.shared.clone();
                let epoch = state.epoch;
                tokio::spawn(async move { run_refresh(shared, refresh_token, epoch).await });
            }
            (id, rx)
        };

        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };
        rx.await.unwrap_or(Err(ClientError::SessionExpired))
    }

    /// Runs `op` with the current access token. On `Unauthorized` it waits
    /// for a refreshed token and retries once; a second `Unauthorized` is final.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ClientError>
    where
        F: Fn(AccessToken) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let token = self.access_token().ok_or(ClientError::SessionExpired)?;
        match op(token.clone()).await {
            Err(ClientError::Unauthorized) => {
                let fresh = self.refreshed_token(&token).await?;
                op(fresh).await
            }
            other => other,
        }
    }
}

/// Whether a failed refresh means the refresh token is gone. A 5xx or an
/// unreadable body leaves it usable for a later attempt.
fn ends_session(error: &ClientError) -> bool {
    match error {
        ClientError::Server { status, .. } => *status < 500,
        ClientError::InvalidResponse(_) => false,
        _ => true,
    }
}

async fn run_refresh(shared: Arc<Shared>, refresh_token: RefreshToken, epoch: u64) {
    let result = match tokio::time::timeout(
        shared.refresh_timeout,
        shared.transport.refresh(&refresh_token),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout),
    };

    let orphaned = {
        let mut state = shared.lock();
        let waiters = std::mem::take(&mut state.waiters);
        state.in_flight = false;

        if state.epoch != epoch {
            // Signed in or out while the refresh was on the wire.
            let current = shared.vault.load().map(|pair| pair.access_token);
            debug!(waiters = waiters.len(), "session changed during refresh, dropping result");
            for waiter in waiters {
                let _ = waiter
                    .tx
                    .send(current.clone().ok_or(ClientError::SessionExpired));
            }
            result.ok().map(|pair| pair.refresh_token)
        } else {
            settle(&shared, waiters, result);
            None
        }
    };

    if let Some(token) = orphaned {
        if let Err(e) = shared.transport.revoke(&token).await {
            debug!(error = %e, "revoking orphaned refresh token failed");
        }
    }
}

fn settle(shared: &Shared, waiters: Vec<Waiter>, result: Result<SessionPair, ClientError>) {
    match result {
        Ok(pair) => {
            let access = pair.access_token.clone();
            shared.vault.save(pair);
            shared.status.send_replace(SessionStatus::Active);
            info!(waiters = waiters.len(), "session refreshed");
            for waiter in waiters {
                let _ = waiter.tx.send(Ok(access.clone()));
            }
        }
        Err(e) if ends_session(&e) => {
            warn!(error = %e, waiters = waiters.len(), "refresh failed, clearing session");
            shared.vault.clear();
            shared.status.send_replace(SessionStatus::Expired);
            for waiter in waiters {
                let _ = waiter.tx.send(Err(ClientError::SessionExpired));
            }
        }
        Err(e) => {
            warn!(error = %e, waiters = waiters.len(), "refresh failed, keeping session");
            shared.status.send_replace(SessionStatus::Active);
            for waiter in waiters {
                let _ = waiter.tx.send(Err(e.clone()));
            }
        }
    }
}
