//! Multi-threaded registry and arbitration tests.

use std::sync::{Arc, Barrier, Once};
use std::thread;

use rand::Rng;
use tracing_subscriber::EnvFilter;

use tarn::{
    AcquireMode, DataSource, HandleRegistry, MemorySource, ReleaseAction, ResolveOptions,
    SessionContext, SessionId, TarnError,
};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tarn=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn registry() -> (HandleRegistry, Arc<MemorySource>) {
    let source = Arc::new(MemorySource::default());
    let registry = HandleRegistry::new(source.clone() as Arc<dyn DataSource>);
    (registry, source)
}

#[test]
fn racing_resolves_create_exactly_one_handle() {
    let (registry, source) = registry();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let registry = registry.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let session = SessionContext::new(SessionId(i as u64));
                barrier.wait();
                registry
                    .resolve(&session, "table:shared", None, ResolveOptions::create())
                    .expect("create or join the single handle")
            })
        })
        .collect();
    let refs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(registry.len(), 1);
    assert_eq!(source.open_count(), 1);
    for r in &refs {
        assert!(Arc::ptr_eq(r.handle(), refs[0].handle()));
    }
    drop(refs);
    assert_eq!(registry.len(), 1);
}

#[test]
fn exclusive_race_has_exactly_one_winner() {
    let (registry, _) = registry();
    let setup_session = SessionContext::new(SessionId(0));
    let href = registry
        .resolve(&setup_session, "table:contested", None, ResolveOptions::create())
        .unwrap();

    let threads = 4;
    // Two waits: everyone attempts inside the window, nobody releases
    // until all attempts are in.
    let barrier = Arc::new(Barrier::new(threads));
    let workers: Vec<_> = (0..threads)
        .map(|i| {
            let href = href.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let session = SessionContext::new(SessionId(i as u64 + 1));
                barrier.wait();
                let outcome = href.acquire(&session, AcquireMode::Exclusive);
                let won = outcome.is_ok();
                if let Err(err) = &outcome {
                    assert!(matches!(err, TarnError::Busy));
                }
                barrier.wait();
                won
            })
        })
        .collect();
    let winners = workers
        .into_iter()
        .map(|w| w.join().unwrap())
        .filter(|&won| won)
        .count();
    assert_eq!(winners, 1);
    assert_eq!(href.exclusive_owner(), None);
    assert_eq!(href.in_use(), 0);
}

#[test]
fn busy_is_transient_once_readers_drain() {
    let (registry, _) = registry();
    let session = SessionContext::new(SessionId(1));
    let href = registry
        .resolve(&session, "table:t", None, ResolveOptions::create())
        .unwrap();

    let reader = {
        let href = href.clone();
        thread::spawn(move || {
            let session = SessionContext::new(SessionId(2));
            let guard = href.acquire(&session, AcquireMode::Shared).unwrap();
            thread::sleep(std::time::Duration::from_millis(20));
            drop(guard);
        })
    };

    // Retry until the reader lets go; every rejection must be Busy.
    let guard = loop {
        match href.acquire(&session, AcquireMode::Exclusive) {
            Ok(g) => break g,
            Err(TarnError::Busy) => thread::yield_now(),
            Err(other) => panic!("unexpected error: {other}"),
        }
    };
    drop(guard);
    reader.join().unwrap();
    assert_eq!(href.in_use(), 0);
}

#[test]
fn iterators_survive_concurrent_open_close_and_drop() {
    init_tracing();
    let (registry, _) = registry();
    let names: Vec<String> = (0..4).map(|i| format!("table:t{i}")).collect();
    let iterations = 200;

    let mutators: Vec<_> = (0..3)
        .map(|t| {
            let registry = registry.clone();
            let names = names.clone();
            thread::spawn(move || {
                let session = SessionContext::new(SessionId(t as u64 + 1));
                let mut rng = rand::thread_rng();
                for _ in 0..iterations {
                    let name = &names[rng.gen_range(0..names.len())];
                    let href = match registry.resolve(
                        &session,
                        name,
                        None,
                        ResolveOptions::create(),
                    ) {
                        Ok(h) => h,
                        // A racing open holds the handle lock, or the
                        // handle died between lookup and open.
                        Err(TarnError::Busy) | Err(TarnError::InvalidState(_)) => continue,
                        Err(err) => panic!("resolve failed: {err}"),
                    };
                    match rng.gen_range(0..10) {
                        0 => {
                            // Occasionally drop the object outright.
                            if let Ok(g) = href.acquire(&session, AcquireMode::Exclusive) {
                                href.mark_dropped();
                                g.release_with(ReleaseAction::DiscardKill);
                            }
                        }
                        1..=3 => {
                            if let Ok(g) = href.acquire(&session, AcquireMode::Shared) {
                                g.release_with(ReleaseAction::Discard);
                            }
                        }
                        _ => {
                            if let Ok(g) = href.acquire(&session, AcquireMode::Shared) {
                                drop(g);
                            }
                        }
                    }
                }
            })
        })
        .collect();

    let walkers: Vec<_> = (0..2)
        .map(|_| {
            let registry = registry.clone();
            thread::spawn(move || {
                for _ in 0..iterations {
                    let mut cursor = registry.cursor();
                    while let Some(h) = cursor.next() {
                        // The cursor's reference keeps the struct alive
                        // whatever the mutators do.
                        assert!(h.refs() >= 1);
                        let _ = h.flag_bits();
                        let _ = h.name();
                    }
                }
            })
        })
        .collect();

    for t in mutators {
        t.join().unwrap();
    }
    for t in walkers {
        t.join().unwrap();
    }

    // Quiesced: nothing is in use, no dropped carcasses remain reachable,
    // and every name is resolvable again.
    registry.walk(|h| {
        assert_eq!(h.in_use(), 0);
        assert!(!h.is_dropped());
        true
    });
    let session = SessionContext::new(SessionId(99));
    for name in &names {
        let href = registry
            .resolve(&session, name, None, ResolveOptions::create())
            .unwrap();
        assert!(href.is_open());
    }
}

#[test]
fn concurrent_shared_holders_count_correctly() {
    let (registry, _) = registry();
    let session = SessionContext::new(SessionId(1));
    let href = registry
        .resolve(&session, "table:t", None, ResolveOptions::create())
        .unwrap();

    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads + 1));
    let workers: Vec<_> = (0..threads)
        .map(|i| {
            let href = href.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let session = SessionContext::new(SessionId(i as u64 + 2));
                let guard = href.acquire(&session, AcquireMode::Shared).unwrap();
                barrier.wait(); // all holding
                barrier.wait(); // main observed the count
                drop(guard);
            })
        })
        .collect();
    barrier.wait();
    assert_eq!(href.in_use(), threads as i32);
    barrier.wait();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(href.in_use(), 0);
    assert_eq!(
        href.stats_snapshot().shared_grants,
        threads as u64
    );
}
