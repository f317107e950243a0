//! Scripted collaborators shared by the pipeline and client tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use session_auth::{CredentialStore, Error as AuthError, Refresher, TokenResponse};
use transport::{Transport, TransportRequest, TransportResponse};

type Responder =
    Box<dyn Fn(&TransportRequest, usize) -> transport::Result<TransportResponse> + Send + Sync>;

/// Transport that counts calls, records every request, waits `delay`, then
/// answers through `respond(request, call_number)`.
pub(crate) struct ScriptedTransport {
    calls: AtomicUsize,
    delay: Duration,
    seen: Mutex<Vec<TransportRequest>>,
    respond: Responder,
}

impl ScriptedTransport {
    pub(crate) fn new(
        delay: Duration,
        respond: impl Fn(&TransportRequest, usize) -> transport::Result<TransportResponse>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            seen: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    /// Always answer with `status` and `body`.
    pub(crate) fn fixed(status: u16, body: &'static str) -> Arc<Self> {
        Self::new(Duration::from_millis(10), move |_, _| {
            Ok(TransportResponse::new(status, body))
        })
    }

    /// 200 for requests carrying `token`, 401 for everything else.
    pub(crate) fn accepting(token: &'static str) -> Arc<Self> {
        Self::new(Duration::from_millis(10), move |request, _| {
            if request.bearer_token() == Some(token) {
                Ok(TransportResponse::new(200, r#"{"ok":true}"#))
            } else {
                Ok(TransportResponse::new(401, r#"{"message":"token expired"}"#))
            }
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<TransportRequest> {
        self.seen.lock().clone()
    }

    pub(crate) fn bearer_tokens(&self) -> Vec<Option<String>> {
        self.seen
            .lock()
            .iter()
            .map(|request| request.bearer_token().map(str::to_string))
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn send(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = transport::Result<TransportResponse>> + Send + '_>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen.lock().push(request.clone());
            tokio::time::sleep(self.delay).await;
            (self.respond)(&request, n)
        })
    }
}

/// Refresher that counts calls and issues `at_new_{n}` / `rt_new_{n}`, or
/// rejects every call once `reject` is set.
pub(crate) struct ScriptedRefresher {
    calls: AtomicUsize,
    delay: Duration,
    reject: AtomicBool,
}

impl ScriptedRefresher {
    pub(crate) fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
            reject: AtomicBool::new(false),
        })
    }

    pub(crate) fn rejecting() -> Arc<Self> {
        let refresher = Self::succeeding();
        refresher.reject.store(true, Ordering::SeqCst);
        refresher
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Refresher for ScriptedRefresher {
    fn refresh<'a>(
        &'a self,
        _refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = session_auth::Result<TokenResponse>> + Send + 'a>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.reject.load(Ordering::SeqCst) {
                return Err(AuthError::InvalidCredentials("refresh token revoked".into()));
            }
            Ok(TokenResponse {
                access_token: format!("at_new_{n}"),
                refresh_token: format!("rt_new_{n}"),
                expires_in: 3600,
            })
        })
    }
}

/// In-memory store holding `access_token`, expiring in `expires_in_secs`.
pub(crate) fn store_with(access_token: &str, expires_in_secs: u64) -> Arc<CredentialStore> {
    let store = Arc::new(CredentialStore::in_memory());
    store
        .set(access_token.to_string(), "rt_old".to_string(), expires_in_secs)
        .unwrap();
    store
}
