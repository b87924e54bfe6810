//! Single-flight credential renewal.
//!
//! Every request that fails with an expired credential asks the
//! [`RefreshCoordinator`] for a fresh access token. The first one starts a
//! renewal cycle; everyone arriving while it runs is parked as a waiter. When
//! the cycle settles, all waiters of that cycle receive the same outcome and
//! the coordinator becomes idle again.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::sync::oneshot;

use crate::{
    credentials::{CredentialPair, CredentialStore},
    error::{Error, RenewalError, Result},
    pipeline::bearer_header,
    renewal::Renewer,
};

type Delivery = std::result::Result<String, RenewalError>;

/// Invoked once per failed renewal cycle, after the credentials were cleared.
///
/// Typically redirects the application to its sign-in screen. Runs on the
/// renewal task and should return quickly.
pub trait SignOutHandler: Send + Sync + 'static {
    fn sign_out(&self, reason: &RenewalError);
}

impl<F> SignOutHandler for F
where
    F: Fn(&RenewalError) + Send + Sync + 'static,
{
    fn sign_out(&self, reason: &RenewalError) {
        self(reason);
    }
}

/// [`SignOutHandler`] that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSignOut;

impl SignOutHandler for LogSignOut {
    fn sign_out(&self, reason: &RenewalError) {
        tracing::warn!("Session ended after failed credential renewal: {reason}");
    }
}

#[derive(Debug, Default)]
enum CoordinatorState {
    #[default]
    Idle,
    Refreshing {
        cycle: u64,
        waiters: HashMap<u64, oneshot::Sender<Delivery>>,
    },
}

/// State and waiter set, guarded together.
#[derive(Debug, Default)]
struct Registry {
    state: CoordinatorState,
    cycles: u64,
    waiter_ids: u64,
}

struct Ticket {
    cycle: u64,
    id: u64,
    started: bool,
    receiver: oneshot::Receiver<Delivery>,
}

impl Registry {
    /// Registers a waiter, entering `Refreshing` if idle.
    fn join(&mut self) -> Ticket {
        self.waiter_ids += 1;
        let id = self.waiter_ids;
        let (sender, receiver) = oneshot::channel();

        match &mut self.state {
            CoordinatorState::Refreshing { cycle, waiters } => {
                waiters.insert(id, sender);
                Ticket {
                    cycle: *cycle,
                    id,
                    started: false,
                    receiver,
                }
            }
            CoordinatorState::Idle => {
                self.cycles += 1;
                let cycle = self.cycles;
                self.state = CoordinatorState::Refreshing {
                    cycle,
                    waiters: HashMap::from([(id, sender)]),
                };
                Ticket {
                    cycle,
                    id,
                    started: true,
                    receiver,
                }
            }
        }
    }

    /// Returns to `Idle`, handing out the waiters of `cycle`.
    fn finish(&mut self, cycle: u64) -> HashMap<u64, oneshot::Sender<Delivery>> {
        match std::mem::take(&mut self.state) {
            CoordinatorState::Refreshing {
                cycle: current,
                waiters,
            } if current == cycle => waiters,
            other => {
                self.state = other;
                HashMap::new()
            }
        }
    }

    fn leave(&mut self, cycle: u64, id: u64) {
        if let CoordinatorState::Refreshing {
            cycle: current,
            waiters,
        } = &mut self.state
        {
            if *current == cycle {
                waiters.remove(&id);
            }
        }
    }
}

struct Core {
    registry: Mutex<Registry>,
    store: Arc<CredentialStore>,
    sign_out: Box<dyn SignOutHandler>,
}

impl Core {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies the outcome to the store and hands it to every waiter.
    ///
    /// Performs storage I/O; called on a blocking thread.
    fn settle(&self, cycle: u64, outcome: std::result::Result<CredentialPair, RenewalError>) {
        let delivery = match outcome {
            Ok(pair) => {
                if let Err(e) = self.store.replace(&pair) {
                    tracing::error!("Renewed credentials are in use but could not be persisted: {e}");
                }
                Ok(pair.access_token().to_string())
            }
            Err(reason) => {
                tracing::error!("Credential renewal failed: {reason}. Signing out.");
                if let Err(e) = self.store.clear() {
                    tracing::error!("Failed to remove persisted credentials: {e}");
                }
                self.sign_out.sign_out(&reason);
                Err(reason)
            }
        };
        self.deliver(cycle, &delivery);
    }

    /// Fails the waiters of `cycle` with [`RenewalError::Interrupted`] and
    /// leaves the credentials untouched.
    fn abandon(&self, cycle: u64) {
        tracing::warn!(cycle, "Credential renewal abandoned. Keeping current credentials.");
        self.deliver(cycle, &Err(RenewalError::Interrupted));
    }

    fn deliver(&self, cycle: u64, delivery: &Delivery) {
        let waiters = self.registry().finish(cycle);
        tracing::debug!(
            cycle,
            waiters = waiters.len(),
            renewed = delivery.is_ok(),
            "Credential renewal settled"
        );
        for waiter in waiters.into_values() {
            // The receiver is gone if its request was cancelled.
            let _ = waiter.send(delivery.clone());
        }
    }
}

struct Shared<R> {
    core: Arc<Core>,
    renewer: R,
    renewal_timeout: Duration,
}

impl<R: Renewer> Shared<R> {
    async fn renew(&self) -> std::result::Result<CredentialPair, RenewalError> {
        let Some(current) = self.core.store.read() else {
            return Err(RenewalError::MissingRefreshToken);
        };

        tokio::time::timeout(
            self.renewal_timeout,
            self.renewer.renew(current.refresh_token()),
        )
        .await
        .unwrap_or_else(|_elapsed| Err(RenewalError::Timeout(self.renewal_timeout)))
    }
}

/// Settles its cycle once the renewal finished.
///
/// Dropped unsettled while panicking, the cycle counts as a failed renewal.
/// Dropped unsettled otherwise (runtime shutdown), the waiters fail with
/// [`RenewalError::Interrupted`] and the credentials are kept.
struct Settlement {
    core: Arc<Core>,
    cycle: u64,
    settled: bool,
}

impl Settlement {
    async fn settle(&mut self, outcome: std::result::Result<CredentialPair, RenewalError>) {
        let core = self.core.clone();
        let cycle = self.cycle;
        let result = tokio::task::spawn_blocking(move || core.settle(cycle, outcome)).await;
        self.settled = true;
        if let Err(e) = result {
            tracing::error!(cycle, "Settling credential renewal failed: {e}");
            self.core.abandon(cycle);
        }
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if std::thread::panicking() {
            self.core.settle(self.cycle, Err(RenewalError::Interrupted));
        } else {
            self.core.abandon(self.cycle);
        }
    }
}

/// Removes a cancelled waiter from its cycle.
struct WaiterGuard<'a> {
    core: &'a Core,
    cycle: u64,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.core.registry().leave(self.cycle, self.id);
    }
}

async fn run_cycle<R: Renewer>(shared: Arc<Shared<R>>, cycle: u64) {
    let mut settlement = Settlement {
        core: shared.core.clone(),
        cycle,
        settled: false,
    };
    let outcome = shared.renew().await;
    settlement.settle(outcome).await;
}

/// Ensures at most one renewal is in flight and fans its outcome out to every
/// request waiting on it.
///
/// The only component that replaces or clears the [`CredentialStore`].
/// Uses `Arc` internally for cheap cloning.
pub struct RefreshCoordinator<R> {
    shared: Arc<Shared<R>>,
}

impl<R> Clone for RefreshCoordinator<R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<R: Renewer> RefreshCoordinator<R> {
    pub fn new(
        store: Arc<CredentialStore>,
        renewer: R,
        renewal_timeout: Duration,
        sign_out: impl SignOutHandler,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Arc::new(Core {
                    registry: Mutex::new(Registry::default()),
                    store,
                    sign_out: Box::new(sign_out),
                }),
                renewer,
                renewal_timeout,
            }),
        }
    }

    /// Waits for a renewed access token.
    ///
    /// `sent_with` is the access token the failed request carried. If the
    /// store already holds a different one, that token is returned without
    /// renewing. If the store was cleared since, the call fails with
    /// [`RenewalError::SessionEnded`] without signing out again. Otherwise
    /// the caller joins the in-flight renewal, starting one if none is
    /// running.
    ///
    /// Dropping the returned future leaves the renewal and the other waiters
    /// untouched.
    ///
    /// # Errors
    /// Fails with [`Error::Renewal`] if the renewal failed. The store is
    /// cleared and the sign-out handler has run by then.
    pub async fn renewed_access_token(&self, sent_with: Option<&str>) -> Result<String> {
        let core: &Core = &self.shared.core;

        let ticket = {
            let mut registry = core.registry();
            if matches!(registry.state, CoordinatorState::Idle) {
                match (core.store.read(), sent_with) {
                    (Some(current), _) if Some(current.access_token()) != sent_with => {
                        tracing::debug!(
                            "Credentials changed since the request was sent. Not renewing."
                        );
                        return Ok(current.access_token().to_string());
                    }
                    // Signed out since the request was sent; the sign-out already happened.
                    (None, Some(_)) => return Err(RenewalError::SessionEnded.into()),
                    _ => {}
                }
            }
            registry.join()
        };

        let _guard = WaiterGuard {
            core,
            cycle: ticket.cycle,
            id: ticket.id,
        };

        if ticket.started {
            tracing::debug!(cycle = ticket.cycle, "Starting credential renewal");
            tokio::spawn(run_cycle(self.shared.clone(), ticket.cycle));
        }

        match ticket.receiver.await {
            Ok(Ok(access_token)) => Ok(access_token),
            Ok(Err(reason)) => Err(reason.into()),
            Err(_) => Err(RenewalError::Interrupted.into()),
        }
    }

    /// Installs a pair issued by an external sign-in.
    ///
    /// # Errors
    /// - Fails with [`Error::IncompleteCredentials`] if either token is empty.
    /// - Fails with [`Error::InvalidHeaderValue`] if the access token cannot be sent as a header.
    /// - Fails with [`Error::Persistence`] if the pair could not be persisted. It is in use regardless.
    pub fn sign_in(&self, pair: &CredentialPair) -> Result<()> {
        if pair.access_token().is_empty() || pair.refresh_token().is_empty() {
            return Err(Error::IncompleteCredentials);
        }
        bearer_header(pair.access_token())?;
        self.shared.core.store.replace(pair)
    }

    /// Clears the credentials. The sign-out handler is not invoked.
    ///
    /// # Errors
    /// Fails with [`Error::Persistence`] if the persisted record could not be removed.
    pub fn sign_out(&self) -> Result<()> {
        self.shared.core.store.clear()
    }

    /// `true` while a renewal is in flight.
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        matches!(
            self.shared.core.registry().state,
            CoordinatorState::Refreshing { .. }
        )
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        match &self.shared.core.registry().state {
            CoordinatorState::Idle => 0,
            CoordinatorState::Refreshing { waiters, .. } => waiters.len(),
        }
    }
}

impl<R> fmt::Debug for RefreshCoordinator<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = &self.shared.core;
        f.debug_struct("RefreshCoordinator")
            .field("registry", &*core.registry())
            .field("store", &core.store)
            .field("renewal_timeout", &self.shared.renewal_timeout)
            .finish_non_exhaustive()
    }
}
