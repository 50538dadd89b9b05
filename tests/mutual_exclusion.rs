use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shared_guard::guard::{GuardDefaults, GuardError, GuardSpec, MutexInterceptor};
use shared_guard::keys::{Arg, KeyDeriver};
use shared_guard::lock::{LockClient, LockKind, MemoryLockClient};
use shared_guard::settings::LockSettings;

struct HttpRequest;

fn interceptor(locks: &MemoryLockClient) -> MutexInterceptor {
    let settings = LockSettings {
        wait_ms: 1_000,
        lease_ms: 2_000,
        ignored_types: vec!["HttpRequest".to_string()],
        ..LockSettings::default()
    };
    MutexInterceptor::from_settings(Arc::new(locks.clone()), &settings)
}

fn transfer_args(account: u64) -> Vec<Arg> {
    vec![
        Arg::new("account_id", &account),
        Arg::opaque::<HttpRequest>("request"),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_transfer_rejected_other_account_proceeds() {
    let locks = MemoryLockClient::new();
    let guard = interceptor(&locks);
    let spec = GuardSpec::idempotent("transfer");
    let entered = Arc::new(AtomicUsize::new(0));

    let first = {
        let guard = guard.clone();
        let spec = spec.clone();
        let entered = entered.clone();
        tokio::spawn(async move {
            guard
                .invoke(&spec, &transfer_args(42), move || async move {
                    entered.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok::<_, io::Error>("done")
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(locks.is_held("transfer:42"));

    let duplicate = guard
        .invoke(&spec, &transfer_args(42), || async { Ok::<_, io::Error>("dup") })
        .await;
    assert!(matches!(
        duplicate,
        Err(GuardError::IdempotentConflict { ref key }) if key == "transfer:42"
    ));

    let other = guard
        .invoke(&spec, &transfer_args(43), || async { Ok::<_, io::Error>("other") })
        .await;
    assert_eq!(other.unwrap(), "other");

    assert_eq!(first.await.unwrap().unwrap(), "done");
    assert_eq!(entered.load(Ordering::SeqCst), 1);
    assert!(!locks.is_held("transfer:42"));
}

#[tokio::test(start_paused = true)]
async fn test_crashed_holder_lock_expires_with_lease() {
    let locks = MemoryLockClient::new();

    // acquired and never released
    let abandoned = locks
        .try_acquire("transfer:42", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(abandoned.is_some());

    tokio::time::advance(Duration::from_millis(1_900)).await;
    assert!(locks
        .try_acquire("transfer:42", Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .is_none());

    tokio::time::advance(Duration::from_millis(200)).await;
    let next = locks
        .try_acquire("transfer:42", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(next.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_blocking_waiter_admitted_when_lease_lapses() {
    let locks = MemoryLockClient::new();
    let guard = interceptor(&locks);
    let spec = GuardSpec::concurrent("rebuild", LockKind::Exclusive)
        .with_wait(Duration::from_secs(5));

    let stale = locks
        .try_acquire("rebuild", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(stale.is_some());

    let started = tokio::time::Instant::now();
    let result = guard
        .invoke(&spec, &[], || async { Ok::<_, io::Error>(()) })
        .await;
    assert!(result.is_ok());
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_wait_times_out() {
    let locks = MemoryLockClient::new();
    let guard = interceptor(&locks);
    let spec = GuardSpec::blocking("rebuild").without_lease();

    let held = guard.lock::<io::Error>(&spec, &[]).await.unwrap();
    let result = guard
        .invoke(&spec, &[], || async { Ok::<_, io::Error>(()) })
        .await;
    match result {
        Err(GuardError::LockTimeout { key, waited }) => {
            assert_eq!(key, "rebuild");
            assert_eq!(waited, Duration::from_secs(1));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(held.release().await);
}

#[tokio::test(start_paused = true)]
async fn test_fair_mode_admits_in_arrival_order() {
    let locks = MemoryLockClient::new();
    let guard = MutexInterceptor::new(
        Arc::new(locks.clone()),
        KeyDeriver::default(),
        GuardDefaults {
            wait: Duration::from_secs(10),
            lease: None,
            kind: LockKind::Fair,
        },
    );
    let spec = GuardSpec::blocking("ledger").with_expression("'ledger:' + #book").unwrap();
    let admitted = Arc::new(Mutex::new(Vec::new()));

    let holder = guard
        .lock::<io::Error>(&spec, &[Arg::new("book", "eu")])
        .await
        .unwrap();

    let mut callers = Vec::new();
    for caller in 0..5usize {
        let guard = guard.clone();
        let spec = spec.clone();
        let admitted = admitted.clone();
        callers.push(tokio::spawn(async move {
            guard
                .invoke(&spec, &[Arg::new("book", "eu")], move || async move {
                    admitted.lock().unwrap().push(caller);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, io::Error>(())
                })
                .await
        }));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    holder.release().await;
    for caller in callers {
        caller.await.unwrap().unwrap();
    }
    assert_eq!(*admitted.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn test_exclusive_mode_never_overlaps() {
    let locks = MemoryLockClient::new();
    let guard = interceptor(&locks);
    let spec = GuardSpec::concurrent("counter", LockKind::Exclusive)
        .with_wait(Duration::from_secs(30));
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut callers = Vec::new();
    for _ in 0..8 {
        let guard = guard.clone();
        let spec = spec.clone();
        let inside = inside.clone();
        let peak = peak.clone();
        callers.push(tokio::spawn(async move {
            guard
                .invoke(&spec, &[], move || async move {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, io::Error>(())
                })
                .await
        }));
    }
    for caller in callers {
        caller.await.unwrap().unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}
