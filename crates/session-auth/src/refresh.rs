//! Single-flight credential refresh
//!
//! Refresh tokens are single-use: if two callers refreshed independently, the
//! second call would present a token the first call already rotated, and the
//! server would end the session. `RefreshCoordinator` keeps at most one refresh
//! in flight. The first caller starts a flight; everyone arriving before it
//! lands awaits the same shared future and observes the same outcome.
//!
//! The flight slot is released by a drop guard inside the flight itself, so
//! success, failure and panic all leave the coordinator ready for the next
//! refresh. A flight nobody is awaiting stays in the slot and is driven by the
//! next caller that attaches.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::credentials::CredentialStore;
use crate::error::Error;
use crate::token::{Refresher, TokenResponse};

/// The in-flight refresh, tagged so a stale guard never releases a newer one.
struct Flight {
    id: u64,
    outcome: Shared<BoxFuture<'static, bool>>,
}

type FlightSlot = Arc<Mutex<Option<Flight>>>;

/// Coordinates refreshes of the credentials in one `CredentialStore`.
pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    refresher: Arc<dyn Refresher>,
    slot: FlightSlot,
    next_flight: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<CredentialStore>, refresher: Arc<dyn Refresher>) -> Self {
        Self {
            store,
            refresher,
            slot: Arc::new(Mutex::new(None)),
            next_flight: AtomicU64::new(0),
        }
    }

    /// Refresh the stored credentials, joining any refresh already in flight.
    ///
    /// Returns true when the store now holds freshly issued credentials and
    /// false when refresh was impossible or failed, in which case the store
    /// has been cleared.
    pub async fn ensure_fresh(&self) -> bool {
        let outcome = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(flight) => {
                    debug!(flight = flight.id, "joining in-flight credential refresh");
                    flight.outcome.clone()
                }
                None => {
                    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                    let outcome = run_flight(
                        id,
                        self.store.clone(),
                        self.refresher.clone(),
                        self.slot.clone(),
                    )
                    .boxed()
                    .shared();
                    *slot = Some(Flight {
                        id,
                        outcome: outcome.clone(),
                    });
                    outcome
                }
            }
        };
        outcome.await
    }

    /// Whether a refresh is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// Releases the flight slot when the flight ends, however it ends.
struct FlightRelease {
    id: u64,
    slot: FlightSlot,
}

impl Drop for FlightRelease {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|flight| flight.id == self.id) {
            *slot = None;
        }
    }
}

async fn run_flight(
    id: u64,
    store: Arc<CredentialStore>,
    refresher: Arc<dyn Refresher>,
    slot: FlightSlot,
) -> bool {
    let _release = FlightRelease { id, slot };
    debug!(flight = id, "starting credential refresh");

    match AssertUnwindSafe(refresh_credentials(&store, refresher.as_ref()))
        .catch_unwind()
        .await
    {
        Ok(refreshed) => refreshed,
        Err(_) => {
            error!(flight = id, "credential refresh panicked, clearing session");
            clear_session(&store);
            false
        }
    }
}

/// One refresh attempt. Never retried.
async fn refresh_credentials(store: &CredentialStore, refresher: &dyn Refresher) -> bool {
    let Some(current) = store.get() else {
        info!("no refresh token available, session is unauthenticated");
        clear_session(store);
        return false;
    };

    let TokenResponse {
        access_token,
        refresh_token,
        expires_in,
    } = match refresher.refresh(current.refresh_token.expose()).await {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!(error = %e, "credential refresh failed, clearing session");
            clear_session(store);
            return false;
        }
    };

    match store.set(access_token, refresh_token, expires_in) {
        Ok(()) => {
            info!(expires_in_secs = expires_in, "credentials refreshed");
            true
        }
        Err(Error::InvalidCredentials(msg)) => {
            warn!(error = %msg, "refresh returned an incomplete token pair, clearing session");
            clear_session(store);
            false
        }
        Err(e) => {
            // In-memory pair is already replaced; only durability was lost
            warn!(error = %e, "failed to persist refreshed credentials");
            true
        }
    }
}

fn clear_session(store: &CredentialStore) {
    if let Err(e) = store.clear() {
        warn!(error = %e, "failed to clear persisted credentials");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use futures_util::future::join_all;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Reject,
        EmptyAccessToken,
        Panic,
    }

    /// Refresher that sleeps, counts calls and answers per `behavior`.
    struct ScriptedRefresher {
        calls: AtomicUsize,
        delay: Duration,
        behavior: Mutex<Behavior>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedRefresher {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(50),
                behavior: Mutex::new(behavior),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Refresher for ScriptedRefresher {
        fn refresh<'a>(
            &'a self,
            refresh_token: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                self.seen.lock().push(refresh_token.to_string());
                tokio::time::sleep(self.delay).await;
                let behavior = *self.behavior.lock();
                match behavior {
                    Behavior::Succeed => Ok(TokenResponse {
                        access_token: format!("at_new_{n}"),
                        refresh_token: format!("rt_new_{n}"),
                        expires_in: 3600,
                    }),
                    Behavior::Reject => Err(Error::InvalidCredentials("refresh token revoked".into())),
                    Behavior::EmptyAccessToken => Ok(TokenResponse {
                        access_token: String::new(),
                        refresh_token: format!("rt_new_{n}"),
                        expires_in: 3600,
                    }),
                    Behavior::Panic => panic!("refresh endpoint client bug"),
                }
            })
        }
    }

    fn seeded_store() -> Arc<CredentialStore> {
        let store = Arc::new(CredentialStore::in_memory());
        store.set("at_old".into(), "rt_old".into(), 10).unwrap();
        store
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let store = seeded_store();
        let refresher = ScriptedRefresher::new(Behavior::Succeed);
        let coordinator = RefreshCoordinator::new(store.clone(), refresher.clone());

        let outcomes = join_all((0..8).map(|_| coordinator.ensure_fresh())).await;

        assert!(outcomes.iter().all(|refreshed| *refreshed));
        assert_eq!(refresher.calls(), 1, "exactly one refresh call");
        assert_eq!(*refresher.seen.lock(), vec!["rt_old".to_string()]);
        let credentials = store.get().unwrap();
        assert_eq!(credentials.access_token.expose(), "at_new_1");
        assert_eq!(credentials.refresh_token.expose(), "rt_new_1");
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn failed_refresh_clears_store_for_all_waiters() {
        let store = seeded_store();
        let refresher = ScriptedRefresher::new(Behavior::Reject);
        let coordinator = RefreshCoordinator::new(store.clone(), refresher.clone());

        let outcomes = join_all((0..4).map(|_| coordinator.ensure_fresh())).await;

        assert!(outcomes.iter().all(|refreshed| !refreshed));
        assert_eq!(refresher.calls(), 1, "failure is never retried");
        assert!(store.get().is_none(), "both tokens must be gone");
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn incomplete_token_pair_clears_store() {
        let store = seeded_store();
        let refresher = ScriptedRefresher::new(Behavior::EmptyAccessToken);
        let coordinator = RefreshCoordinator::new(store.clone(), refresher.clone());

        let outcomes = join_all((0..3).map(|_| coordinator.ensure_fresh())).await;

        assert!(outcomes.iter().all(|refreshed| !refreshed));
        assert_eq!(refresher.calls(), 1);
        assert!(store.get().is_none(), "old pair must not survive a bad rotation");
        assert!(!store.is_authenticated());
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn no_refresh_token_returns_false_without_calling_endpoint() {
        let store = Arc::new(CredentialStore::in_memory());
        let refresher = ScriptedRefresher::new(Behavior::Succeed);
        let coordinator = RefreshCoordinator::new(store.clone(), refresher.clone());

        assert!(!coordinator.ensure_fresh().await);
        assert_eq!(refresher.calls(), 0);
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn later_refresh_starts_a_new_flight() {
        let store = seeded_store();
        let refresher = ScriptedRefresher::new(Behavior::Succeed);
        let coordinator = RefreshCoordinator::new(store.clone(), refresher.clone());

        assert!(coordinator.ensure_fresh().await);
        assert!(coordinator.ensure_fresh().await);

        assert_eq!(refresher.calls(), 2);
        // Second flight presented the token rotated by the first
        assert_eq!(
            *refresher.seen.lock(),
            vec!["rt_old".to_string(), "rt_new_1".to_string()]
        );
        assert_eq!(store.get().unwrap().access_token.expose(), "at_new_2");
    }

    #[tokio::test]
    async fn panicking_refresh_releases_slot_and_clears_store() {
        let store = seeded_store();
        let refresher = ScriptedRefresher::new(Behavior::Panic);
        let coordinator = RefreshCoordinator::new(store.clone(), refresher.clone());

        let outcomes = join_all((0..3).map(|_| coordinator.ensure_fresh())).await;
        assert!(outcomes.iter().all(|refreshed| !refreshed));
        assert!(!coordinator.is_refreshing(), "slot must not stay stuck");
        assert!(store.get().is_none());

        // The coordinator keeps working once a session is re-established
        store.set("at_login".into(), "rt_login".into(), 10).unwrap();
        *refresher.behavior.lock() = Behavior::Succeed;
        assert!(coordinator.ensure_fresh().await);
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn dropped_caller_leaves_flight_for_next_caller() {
        let store = seeded_store();
        let refresher = ScriptedRefresher::new(Behavior::Succeed);
        let coordinator = RefreshCoordinator::new(store.clone(), refresher.clone());

        // Start a flight and abandon it mid-refresh
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), coordinator.ensure_fresh()).await;
        assert!(abandoned.is_err());
        assert!(coordinator.is_refreshing());

        // The next caller drives the same flight to completion
        assert!(coordinator.ensure_fresh().await);
        assert_eq!(refresher.calls(), 1);
        assert!(!coordinator.is_refreshing());
    }
}
