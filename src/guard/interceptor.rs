use log::{error, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{transition, GuardError, GuardMode, GuardSpec, LockPhase};
use crate::keys::{Arg, KeyDeriver, KeyError};
use crate::lock::{LockClient, LockKind, LockToken};
use crate::settings::LockSettings;

/// Values used when a [`GuardSpec`] does not override them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardDefaults {
    pub wait: Duration,
    pub lease: Option<Duration>,
    pub kind: LockKind,
}

impl From<&LockSettings> for GuardDefaults {
    fn from(settings: &LockSettings) -> Self {
        Self {
            wait: settings.wait(),
            lease: settings.lease(),
            kind: settings.kind,
        }
    }
}

#[derive(Clone)]
pub struct MutexInterceptor {
    locks: Arc<dyn LockClient>,
    keys: KeyDeriver,
    defaults: GuardDefaults,
}

impl MutexInterceptor {
    pub fn new(locks: Arc<dyn LockClient>, keys: KeyDeriver, defaults: GuardDefaults) -> Self {
        Self {
            locks,
            keys,
            defaults,
        }
    }

    pub fn from_settings(locks: Arc<dyn LockClient>, settings: &LockSettings) -> Self {
        Self::new(locks, settings.key_deriver(), GuardDefaults::from(settings))
    }

    pub fn defaults(&self) -> &GuardDefaults {
        &self.defaults
    }

    pub fn derive_key(&self, spec: &GuardSpec, args: &[Arg]) -> Result<String, KeyError> {
        self.keys
            .operation_key(spec.operation(), args, spec.expression())
    }

    /// Run `op` while holding the lock for this call's key.
    ///
    /// The lock is released before the outcome is returned. If the returned
    /// future is dropped, or `op` panics, the [`HeldLock`] guard releases it.
    pub async fn invoke<T, E, F, Fut>(
        &self,
        spec: &GuardSpec,
        args: &[Arg],
        op: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let held = self.lock::<E>(spec, args).await?;
        let outcome = op().await;
        held.release().await;
        outcome.map_err(GuardError::Operation)
    }

    /// Acquire the lock for this call without running anything under it.
    pub async fn lock<E>(&self, spec: &GuardSpec, args: &[Arg]) -> Result<HeldLock, GuardError<E>> {
        let key = self.derive_key(spec, args)?;
        let lease = spec.lease_or(self.defaults.lease);
        transition(&key, LockPhase::Idle, LockPhase::Acquiring);

        let acquired = match spec.mode() {
            GuardMode::Idempotent => self.locks.try_acquire(&key, lease).await,
            GuardMode::Concurrent => {
                let kind = spec.kind_or(self.defaults.kind);
                let wait = spec.wait_or(self.defaults.wait);
                self.locks.acquire(&key, kind, wait, lease).await
            }
        };
        let acquired = acquired.map_err(|e| {
            error!("Lock server failed acquiring {}: {}", key, e);
            transition(&key, LockPhase::Acquiring, LockPhase::Idle);
            e
        })?;

        match (acquired, spec.mode()) {
            (Some(token), _) => {
                transition(&key, LockPhase::Acquiring, LockPhase::Held);
                Ok(HeldLock {
                    locks: self.locks.clone(),
                    token: Some(token),
                })
            }
            (None, GuardMode::Idempotent) => {
                transition(&key, LockPhase::Acquiring, LockPhase::Rejected);
                Err(GuardError::IdempotentConflict { key })
            }
            (None, GuardMode::Concurrent) => {
                transition(&key, LockPhase::Acquiring, LockPhase::TimedOut);
                Err(GuardError::LockTimeout {
                    key,
                    waited: spec.wait_or(self.defaults.wait),
                })
            }
        }
    }
}

/// A held lock. Released explicitly with [`release`](Self::release), or on drop.
pub struct HeldLock {
    locks: Arc<dyn LockClient>,
    token: Option<LockToken>,
}

impl HeldLock {
    pub fn key(&self) -> &str {
        self.token.as_ref().map_or("", LockToken::key)
    }

    /// Returns whether this holder still owned the lock.
    ///
    /// The token stays with the guard until the release completes, so a
    /// release cancelled midway is retried from `Drop`.
    pub async fn release(mut self) -> bool {
        let Some(token) = self.token.clone() else {
            return false;
        };
        let released = release_token(self.locks.as_ref(), &token).await;
        self.token = None;
        released
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let locks = self.locks.clone();
                handle.spawn(async move {
                    release_token(locks.as_ref(), &token).await;
                });
            }
            Err(_) => warn!(
                "No runtime to release lock {}; it stays held until its lease expires",
                token.key()
            ),
        }
    }
}

async fn release_token(locks: &dyn LockClient, token: &LockToken) -> bool {
    transition(token.key(), LockPhase::Held, LockPhase::Releasing);
    let released = match locks.release(token).await {
        Ok(true) => true,
        Ok(false) => {
            warn!("Lock {} was no longer held at release; lease too short?", token.key());
            false
        }
        Err(e) => {
            warn!("Failed to release lock {}: {}", token.key(), e);
            false
        }
    };
    transition(token.key(), LockPhase::Releasing, LockPhase::Idle);
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockClient;
    use std::io;
    use std::sync::Mutex;

    fn interceptor(locks: &MemoryLockClient) -> MutexInterceptor {
        MutexInterceptor::new(
            Arc::new(locks.clone()),
            KeyDeriver::default(),
            GuardDefaults {
                wait: Duration::from_millis(500),
                lease: Some(Duration::from_secs(30)),
                kind: LockKind::Exclusive,
            },
        )
    }

    /// Let spawned releases run.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idempotent_duplicate_rejected() {
        let locks = MemoryLockClient::new();
        let guard = interceptor(&locks);
        let spec = GuardSpec::idempotent("submit");
        let args = [Arg::new("order", "o-1")];

        let held = guard.lock::<io::Error>(&spec, &args).await.unwrap();
        assert_eq!(held.key(), "submit:o-1");

        let second = guard
            .invoke(&spec, &args, || async { Ok::<_, io::Error>(()) })
            .await;
        assert!(matches!(second, Err(GuardError::IdempotentConflict { ref key }) if key == "submit:o-1"));

        assert!(held.release().await);
        assert!(!locks.is_held("submit:o-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_after_operation_error() {
        let locks = MemoryLockClient::new();
        let guard = interceptor(&locks);
        let spec = GuardSpec::idempotent("submit");

        let result: Result<(), _> = guard
            .invoke(&spec, &[], || async {
                Err(io::Error::new(io::ErrorKind::Other, "boom"))
            })
            .await;
        assert!(matches!(result, Err(GuardError::Operation(_))));
        assert!(!locks.is_held("submit"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_after_cancellation() {
        let locks = MemoryLockClient::new();
        let guard = interceptor(&locks);
        let spec = GuardSpec::idempotent("slow");

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            guard.invoke(&spec, &[], || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, io::Error>(())
            }),
        )
        .await;
        assert!(cancelled.is_err());

        settle().await;
        assert!(!locks.is_held("slow"));
    }

    /// Lock client whose release takes a while to reach the server.
    struct SlowRelease(MemoryLockClient);

    #[async_trait::async_trait]
    impl LockClient for SlowRelease {
        async fn try_acquire(
            &self,
            key: &str,
            lease: Option<Duration>,
        ) -> Result<Option<LockToken>, crate::lock::LockError> {
            self.0.try_acquire(key, lease).await
        }

        async fn acquire(
            &self,
            key: &str,
            kind: LockKind,
            wait: Duration,
            lease: Option<Duration>,
        ) -> Result<Option<LockToken>, crate::lock::LockError> {
            self.0.acquire(key, kind, wait, lease).await
        }

        async fn release(&self, token: &LockToken) -> Result<bool, crate::lock::LockError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.release(token).await
        }

        async fn force_release(&self, key: &str) -> Result<bool, crate::lock::LockError> {
            self.0.force_release(key).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_when_cancelled_during_release() {
        let locks = MemoryLockClient::new();
        let guard = MutexInterceptor::new(
            Arc::new(SlowRelease(locks.clone())),
            KeyDeriver::default(),
            GuardDefaults {
                wait: Duration::from_millis(500),
                lease: None,
                kind: LockKind::Exclusive,
            },
        );
        let spec = GuardSpec::idempotent("settle");

        // op finishes at 10ms, release is still in flight at 15ms
        let cancelled = tokio::time::timeout(
            Duration::from_millis(15),
            guard.invoke(&spec, &[], || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, io::Error>(())
            }),
        )
        .await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!locks.is_held("settle"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_after_panic() {
        let locks = MemoryLockClient::new();
        let guard = interceptor(&locks);

        let task = {
            let guard = guard.clone();
            tokio::spawn(async move {
                let spec = GuardSpec::idempotent("explode");
                guard
                    .invoke(&spec, &[], || async {
                        if true {
                            panic!("operation panicked");
                        }
                        Ok::<_, io::Error>(())
                    })
                    .await
            })
        };
        assert!(task.await.unwrap_err().is_panic());

        settle().await;
        assert!(!locks.is_held("explode"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_timeout() {
        let locks = MemoryLockClient::new();
        let guard = interceptor(&locks);
        let spec = GuardSpec::concurrent("report", LockKind::Exclusive)
            .with_wait(Duration::from_millis(200));

        let held = guard.lock::<io::Error>(&spec, &[]).await.unwrap();
        let started = tokio::time::Instant::now();
        let result = guard
            .invoke(&spec, &[], || async { Ok::<_, io::Error>(()) })
            .await;
        match result {
            Err(err @ GuardError::LockTimeout { .. }) => assert!(err.is_retryable()),
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
        assert!(started.elapsed() >= Duration::from_millis(200));
        held.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fair_waiters_run_in_arrival_order() {
        let locks = MemoryLockClient::new();
        let guard = interceptor(&locks);
        let spec = GuardSpec::concurrent("ledger", LockKind::Fair)
            .with_wait(Duration::from_secs(5));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = guard.lock::<io::Error>(&spec, &[]).await.unwrap();
        let mut tasks = Vec::new();
        for caller in 0..4 {
            let guard = guard.clone();
            let spec = spec.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                guard
                    .invoke(&spec, &[], move || async move {
                        order.lock().unwrap().push(caller);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok::<_, io::Error>(())
                    })
                    .await
            }));
            // queue in spawn order
            settle().await;
        }

        first.release().await;
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expression_key() {
        let locks = MemoryLockClient::new();
        let guard = interceptor(&locks);
        let spec = GuardSpec::idempotent("transfer")
            .with_expression("'acct:' + #account")
            .unwrap();

        let held = guard
            .lock::<io::Error>(&spec, &[Arg::new("account", &42), Arg::new("amount", &10)])
            .await
            .unwrap();
        assert_eq!(held.key(), "acct:42");
        assert!(locks.is_held("acct:42"));
        held.release().await;
    }

    #[tokio::test]
    async fn test_undefined_variable_fails_fast() {
        let locks = MemoryLockClient::new();
        let guard = interceptor(&locks);
        let spec = GuardSpec::idempotent("transfer")
            .with_expression("#missing")
            .unwrap();

        let result = guard
            .invoke(&spec, &[Arg::new("account", &42)], || async {
                Ok::<_, io::Error>(())
            })
            .await;
        assert!(matches!(
            result,
            Err(GuardError::Key(KeyError::UndefinedVariable(_)))
        ));
    }
}
