//! ResourceCache 单元测试
//!
//! 测试资源注册、一次性加载、监听器通知以及 GUID 格式

use crate::runtime::cache::{
    CacheError, Guid, ListenerId, LoadOutcome, LoadRequest, LoadStatus, ResourceCache,
};
use crate::runtime::identifier::Identifier;
use crate::runtime::scheduler::{Batch, Priority, RunnerPool, SchedulerConfig, Stage, StageOutcome};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

/// Loader that parks every request so the test decides when loads finish.
fn parking_cache(
    calls: Arc<AtomicUsize>,
    parked: Arc<Mutex<Vec<LoadRequest<String>>>>,
) -> ResourceCache<String> {
    ResourceCache::from_fn(move |request: LoadRequest<String>| {
        calls.fetch_add(1, Ordering::SeqCst);
        parked.lock().push(request);
        Batch::default()
    })
}

/// Loader that schedules a stage which publishes the GUID's text.
fn staged_cache(calls: Arc<AtomicUsize>) -> ResourceCache<String> {
    ResourceCache::from_fn(move |request: LoadRequest<String>| {
        calls.fetch_add(1, Ordering::SeqCst);
        let stage = Stage::from_fn(Priority::NORMAL, move |_| {
            let text = request.guid().map(|guid| guid.to_string()).unwrap_or_default();
            request.finish(text).unwrap();
            StageOutcome::Finished
        });
        Batch::new(stage)
    })
}

fn recorder() -> (
    Arc<Mutex<Vec<(Identifier, Option<String>)>>>,
    impl Fn() -> Box<dyn FnOnce(Identifier, LoadOutcome<String>) + Send>,
) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let make = {
        let log = log.clone();
        move || {
            let log = log.clone();
            Box::new(move |id: Identifier, outcome: LoadOutcome<String>| {
                log.lock()
                    .push((id, outcome.payload().map(|p| p.as_ref().clone())));
            }) as Box<dyn FnOnce(Identifier, LoadOutcome<String>) + Send>
        }
    };
    (log, make)
}

#[cfg(test)]
mod registration_tests {
    use super::*;

    #[test]
    fn test_find_or_register_is_idempotent() {
        let cache = staged_cache(Arc::new(AtomicUsize::new(0)));
        let guid = Guid::from_name("meshes/rock.mesh");
        let first = cache.find_or_register(guid).unwrap();
        let second = cache.find_or_register(guid).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.find_identifier(guid), Some(first));
        assert_eq!(cache.guid_of(first), Some(guid));
        assert!(cache.is_valid(first));
        assert_eq!(cache.status(first), Some(LoadStatus::NotLoaded));
    }

    #[test]
    fn test_distinct_guids_get_distinct_identifiers() {
        let cache = staged_cache(Arc::new(AtomicUsize::new(0)));
        let a = cache.find_or_register(Guid::from_name("a")).unwrap();
        let b = cache.find_or_register(Guid::from_name("b")).unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.maximum_used_identifier_count(), 2);
        assert_eq!(cache.identifiers(), vec![a, b]);
    }

    #[test]
    fn test_concurrent_registration_agrees() {
        let cache = staged_cache(Arc::new(AtomicUsize::new(0)));
        let guid = Guid::generate();
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.find_or_register(guid).unwrap()
                })
            })
            .collect();
        let ids: Vec<Identifier> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_exhaustion() {
        let cache: ResourceCache<String> =
            ResourceCache::with_capacity(2, |_request: LoadRequest<String>| Batch::default());
        cache.find_or_register(Guid::from_name("a")).unwrap();
        cache.find_or_register(Guid::from_name("b")).unwrap();
        assert_eq!(
            cache.find_or_register(Guid::from_name("c")),
            Err(CacheError::IdentifiersExhausted { capacity: 2 })
        );
        assert!(cache.find_identifier(Guid::from_name("c")).is_none());
    }

    #[test]
    fn test_unknown_identifier() {
        let cache = staged_cache(Arc::new(AtomicUsize::new(0)));
        let bogus = Identifier::new(5, 0);
        assert!(!cache.is_valid(bogus));
        assert_eq!(
            cache.try_load(bogus, ListenerId::unique(), |_, _| {}).unwrap_err(),
            CacheError::UnknownIdentifier(bogus)
        );
        assert!(cache.try_reload(Identifier::INVALID).is_err());
        assert!(cache.payload(bogus).is_none());
    }

    #[test]
    fn test_deregister_recycles_identifier() {
        let cache = staged_cache(Arc::new(AtomicUsize::new(0)));
        let guid = Guid::from_name("temp");
        let old = cache.find_or_register(guid).unwrap();
        cache.deregister(old).unwrap();

        assert!(!cache.is_valid(old));
        assert!(cache.find_identifier(guid).is_none());
        assert_eq!(cache.deregister(old), Err(CacheError::UnknownIdentifier(old)));

        let new = cache.find_or_register(guid).unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new.salt(), old.salt());
        assert!(cache.is_valid(new));
        assert!(!cache.is_valid(old));
    }

    #[test]
    fn test_deregister_refused_while_loading() {
        let parked = Arc::new(Mutex::new(Vec::new()));
        let cache = parking_cache(Arc::new(AtomicUsize::new(0)), parked.clone());
        let id = cache.find_or_register(Guid::from_name("busy")).unwrap();
        let _ = cache.try_load(id, ListenerId::unique(), |_, _| {}).unwrap();
        assert_eq!(cache.deregister(id), Err(CacheError::LoadInProgress(id)));

        let request = parked.lock().pop().unwrap();
        request.finish("done".to_string()).unwrap();
        cache.deregister(id).unwrap();
    }

    #[test]
    fn test_register_procedural() {
        let cache = staged_cache(Arc::new(AtomicUsize::new(0)));
        let id = cache
            .register_procedural(|request: LoadRequest<String>| {
                request.finish("generated".to_string()).unwrap();
                Batch::default()
            })
            .unwrap();
        assert_eq!(cache.guid_of(id), None);

        let (log, make) = recorder();
        let batch = cache.try_load(id, ListenerId::unique(), make()).unwrap();
        assert!(!batch.is_valid());
        assert_eq!(*log.lock(), vec![(id, Some("generated".to_string()))]);
        assert_eq!(cache.payload(id).as_deref().map(String::as_str), Some("generated"));
    }
}

#[cfg(test)]
mod loading_tests {
    use super::*;

    #[test]
    fn test_first_request_claims_and_later_requests_wait() {
        let calls = Arc::new(AtomicUsize::new(0));
        let parked = Arc::new(Mutex::new(Vec::new()));
        let cache = parking_cache(calls.clone(), parked.clone());
        let id = cache.find_or_register(Guid::from_name("tex")).unwrap();
        let (log, make) = recorder();

        let _ = cache.try_load(id, ListenerId::new(1), make()).unwrap();
        assert!(cache.is_loading(id));
        let _ = cache.try_load(id, ListenerId::new(2), make()).unwrap();
        let _ = cache.try_load(id, ListenerId::new(3), make()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.pending_listener_count(id), 3);
        assert!(log.lock().is_empty());

        let request = parked.lock().pop().unwrap();
        request.finish("pixels".to_string()).unwrap();

        assert_eq!(log.lock().len(), 3);
        assert!(log
            .lock()
            .iter()
            .all(|(got, payload)| *got == id && payload.as_deref() == Some("pixels")));
        assert!(!cache.is_loading(id));
        assert!(cache.has_finished_loading(id));
        assert_eq!(cache.pending_listener_count(id), 0);
    }

    #[test]
    fn test_request_after_completion_fires_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let parked = Arc::new(Mutex::new(Vec::new()));
        let cache = parking_cache(calls.clone(), parked.clone());
        let id = cache.find_or_register(Guid::from_name("late")).unwrap();

        let _ = cache.try_load(id, ListenerId::unique(), |_, _| {}).unwrap();
        parked
            .lock()
            .pop()
            .unwrap()
            .finish("ready".to_string())
            .unwrap();

        let (log, make) = recorder();
        let batch = cache.try_load(id, ListenerId::unique(), make()).unwrap();
        assert!(!batch.is_valid());
        assert_eq!(*log.lock(), vec![(id, Some("ready".to_string()))]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_failed_load_notifies_and_sticks() {
        let parked = Arc::new(Mutex::new(Vec::new()));
        let cache = parking_cache(Arc::new(AtomicUsize::new(0)), parked.clone());
        let id = cache.find_or_register(Guid::from_name("missing")).unwrap();
        let (log, make) = recorder();

        let _ = cache.try_load(id, ListenerId::unique(), make()).unwrap();
        parked.lock().pop().unwrap().fail().unwrap();
        assert_eq!(*log.lock(), vec![(id, None)]);
        assert_eq!(cache.status(id), Some(LoadStatus::Failed));

        let _ = cache.try_load(id, ListenerId::unique(), make()).unwrap();
        assert_eq!(log.lock().len(), 2);
        assert_eq!(cache.stats().loads_failed, 1);
    }

    #[test]
    fn test_dropped_request_fails_the_load() {
        let cache: ResourceCache<String> = ResourceCache::from_fn(|request: LoadRequest<String>| {
            drop(request);
            Batch::default()
        });
        let id = cache.find_or_register(Guid::from_name("dropped")).unwrap();
        let (log, make) = recorder();
        let batch = cache.try_load(id, ListenerId::unique(), make()).unwrap();
        assert!(!batch.is_valid());
        assert_eq!(*log.lock(), vec![(id, None)]);
        assert!(!cache.is_loading(id));
    }

    #[test]
    fn test_completion_without_claim_is_rejected() {
        let cache = staged_cache(Arc::new(AtomicUsize::new(0)));
        let id = cache.find_or_register(Guid::from_name("unclaimed")).unwrap();
        assert_eq!(
            cache.on_loading_finished(id, "nope".to_string()),
            Err(CacheError::LoadNotClaimed(id))
        );
        assert_eq!(cache.status(id), Some(LoadStatus::NotLoaded));
    }

    #[test]
    fn test_second_completion_does_not_refire() {
        let parked = Arc::new(Mutex::new(Vec::new()));
        let cache = parking_cache(Arc::new(AtomicUsize::new(0)), parked.clone());
        let id = cache.find_or_register(Guid::from_name("twice")).unwrap();
        let (log, make) = recorder();

        let _ = cache.try_load(id, ListenerId::unique(), make()).unwrap();
        parked
            .lock()
            .pop()
            .unwrap()
            .finish("first".to_string())
            .unwrap();
        assert_eq!(
            cache.on_loading_finished(id, "second".to_string()),
            Err(CacheError::LoadNotClaimed(id))
        );
        assert_eq!(log.lock().len(), 1);
        assert_eq!(cache.payload(id).as_deref().map(String::as_str), Some("first"));
    }

    #[test]
    fn test_remove_listener_before_completion() {
        let parked = Arc::new(Mutex::new(Vec::new()));
        let cache = parking_cache(Arc::new(AtomicUsize::new(0)), parked.clone());
        let id = cache.find_or_register(Guid::from_name("withdrawn")).unwrap();
        let (log, make) = recorder();

        let keep = ListenerId::new(10);
        let leave = ListenerId::new(11);
        let _ = cache.try_load(id, keep, make()).unwrap();
        let _ = cache.try_load(id, leave, make()).unwrap();
        assert!(cache.remove_listener(id, leave));
        assert!(!cache.remove_listener(id, leave));

        parked
            .lock()
            .pop()
            .unwrap()
            .finish("kept".to_string())
            .unwrap();
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_listener_may_reenter_cache() {
        let parked = Arc::new(Mutex::new(Vec::new()));
        let cache = parking_cache(Arc::new(AtomicUsize::new(0)), parked.clone());
        let id = cache.find_or_register(Guid::from_name("reentrant")).unwrap();
        let observed = Arc::new(Mutex::new(None));

        let inner_cache = cache.clone();
        let sink = observed.clone();
        let _ = cache
            .try_load(id, ListenerId::unique(), move |id, _| {
                *sink.lock() = Some(inner_cache.has_finished_loading(id));
                let _ = inner_cache.try_load(id, ListenerId::unique(), |_, _| {});
            })
            .unwrap();
        parked
            .lock()
            .pop()
            .unwrap()
            .finish("ok".to_string())
            .unwrap();
        assert_eq!(*observed.lock(), Some(true));
    }

    #[test]
    fn test_reload_replaces_payload() {
        let parked = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = parking_cache(calls.clone(), parked.clone());
        let id = cache.find_or_register(Guid::from_name("hot")).unwrap();

        let _ = cache.try_load(id, ListenerId::unique(), |_, _| {}).unwrap();
        parked.lock().pop().unwrap().finish("v1".to_string()).unwrap();

        let _ = cache.try_reload(id).unwrap();
        assert!(cache.is_loading(id));
        assert!(!cache.try_reload(id).unwrap().is_valid());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let request = parked.lock().pop().unwrap();
        assert!(request.is_reload());
        assert_eq!(cache.payload(id).as_deref().map(String::as_str), Some("v1"));
        request.finish("v2".to_string()).unwrap();
        assert_eq!(cache.payload(id).as_deref().map(String::as_str), Some("v2"));
        assert_eq!(cache.stats().reloads, 1);
    }

    #[test]
    fn test_failed_reload_keeps_last_payload() {
        let parked = Arc::new(Mutex::new(Vec::new()));
        let cache = parking_cache(Arc::new(AtomicUsize::new(0)), parked.clone());
        let id = cache.find_or_register(Guid::from_name("flaky")).unwrap();

        let _ = cache.try_load(id, ListenerId::unique(), |_, _| {}).unwrap();
        parked.lock().pop().unwrap().finish("good".to_string()).unwrap();
        let _ = cache.try_reload(id).unwrap();
        parked.lock().pop().unwrap().fail().unwrap();

        assert_eq!(cache.status(id), Some(LoadStatus::Failed));
        assert_eq!(cache.payload(id).as_deref().map(String::as_str), Some("good"));
    }
}

#[cfg(test)]
mod lifecycle_race_tests {
    use super::*;

    #[test]
    fn test_listener_during_reload_sees_reload_outcome() {
        let calls = Arc::new(AtomicUsize::new(0));
        let parked = Arc::new(Mutex::new(Vec::new()));
        let cache = parking_cache(calls.clone(), parked.clone());
        let id = cache.find_or_register(Guid::from_name("shader")).unwrap();

        let _ = cache.try_load(id, ListenerId::unique(), |_, _| {}).unwrap();
        parked.lock().pop().unwrap().finish("old".to_string()).unwrap();
        let _ = cache.try_reload(id).unwrap();
        assert_eq!(cache.status(id), Some(LoadStatus::NotLoaded));
        assert!(!cache.has_finished_loading(id));
        assert_eq!(cache.payload(id).as_deref().map(String::as_str), Some("old"));

        let (log, make) = recorder();
        let batch = cache.try_load(id, ListenerId::unique(), make()).unwrap();
        assert!(!batch.is_valid());
        assert!(log.lock().is_empty());
        assert_eq!(cache.pending_listener_count(id), 1);

        parked.lock().pop().unwrap().finish("new".to_string()).unwrap();
        assert_eq!(*log.lock(), vec![(id, Some("new".to_string()))]);
        assert_eq!(cache.status(id), Some(LoadStatus::Loaded));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().joined, 1);
    }

    #[test]
    fn test_stale_handle_cannot_claim_recycled_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let parked = Arc::new(Mutex::new(Vec::new()));
        let cache = parking_cache(calls.clone(), parked.clone());
        let old = cache.find_or_register(Guid::from_name("before")).unwrap();
        cache.deregister(old).unwrap();
        let new = cache.find_or_register(Guid::from_name("after")).unwrap();
        assert_eq!(new.index(), old.index());

        assert_eq!(
            cache.try_load(old, ListenerId::unique(), |_, _| {}).unwrap_err(),
            CacheError::UnknownIdentifier(old)
        );
        assert_eq!(cache.try_reload(old).unwrap_err(), CacheError::UnknownIdentifier(old));
        assert_eq!(cache.deregister(old), Err(CacheError::UnknownIdentifier(old)));
        assert!(!cache.is_loading(new));

        let (log, make) = recorder();
        let _ = cache.try_load(new, ListenerId::unique(), make()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        parked.lock().pop().unwrap().finish("fresh".to_string()).unwrap();
        assert_eq!(*log.lock(), vec![(new, Some("fresh".to_string()))]);
    }

    #[test]
    fn test_deregister_racing_try_load_never_strands_listeners() {
        let cache: ResourceCache<String> = ResourceCache::from_fn(|request: LoadRequest<String>| {
            request.finish("ready".to_string()).unwrap();
            Batch::default()
        });

        for round in 0..200 {
            let id = cache
                .find_or_register(Guid::from_name(&format!("churn-{}", round)))
                .unwrap();
            let fired = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(5));

            let loaders: Vec<_> = (0..4)
                .map(|_| {
                    let cache = cache.clone();
                    let fired = fired.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        let fired = fired.clone();
                        let accepted = cache
                            .try_load(id, ListenerId::unique(), move |_, _| {
                                fired.fetch_add(1, Ordering::SeqCst);
                            })
                            .is_ok();
                        usize::from(accepted)
                    })
                })
                .collect();

            barrier.wait();
            loop {
                match cache.deregister(id) {
                    Ok(()) | Err(CacheError::UnknownIdentifier(_)) => break,
                    Err(CacheError::LoadInProgress(_)) => thread::yield_now(),
                    Err(err) => panic!("unexpected {err}"),
                }
            }
            let accepted: usize = loaders.into_iter().map(|h| h.join().unwrap()).sum();
            assert_eq!(fired.load(Ordering::SeqCst), accepted, "round {}", round);
        }

        assert_eq!(cache.inner.loading.count(), 0);
        let id = cache.find_or_register(Guid::from_name("survivor")).unwrap();
        let (log, make) = recorder();
        let _ = cache.try_load(id, ListenerId::unique(), make()).unwrap();
        assert_eq!(*log.lock(), vec![(id, Some("ready".to_string()))]);
    }

    #[test]
    fn test_racing_finish_and_fail_conclude_once() {
        for _ in 0..64 {
            let parked = Arc::new(Mutex::new(Vec::new()));
            let cache = parking_cache(Arc::new(AtomicUsize::new(0)), parked.clone());
            let id = cache.find_or_register(Guid::from_name("contested")).unwrap();
            let (log, make) = recorder();
            let _ = cache.try_load(id, ListenerId::unique(), make()).unwrap();
            let _ = cache.try_load(id, ListenerId::unique(), make()).unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let finisher = {
                let cache = cache.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.on_loading_finished(id, "won".to_string()).is_ok()
                })
            };
            let failer = {
                let cache = cache.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.on_loading_failed(id).is_ok()
                })
            };
            let finished = finisher.join().unwrap();
            let failed = failer.join().unwrap();

            assert!(finished != failed);
            let log = log.lock();
            assert_eq!(log.len(), 2);
            let expected = finished.then(|| "won".to_string());
            assert!(log.iter().all(|(got, payload)| *got == id && *payload == expected));
            let status = if finished { LoadStatus::Loaded } else { LoadStatus::Failed };
            assert_eq!(cache.status(id), Some(status));
            assert!(!cache.is_loading(id));
            let stats = cache.stats();
            assert_eq!(stats.loads_completed + stats.loads_failed, 1);
        }
    }
}

#[cfg(test)]
mod pool_integration_tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_staged_load_runs_on_pool() {
        let pool = RunnerPool::build(SchedulerConfig::with_runners(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = staged_cache(calls.clone());
        let guid = Guid::from_name("staged");
        let id = cache.find_or_register(guid).unwrap();
        let (log, make) = recorder();

        let batch = cache.try_load(id, ListenerId::unique(), make()).unwrap();
        assert!(batch.is_valid());
        assert!(log.lock().is_empty());

        pool.queue_batch(batch).unwrap();
        assert!(pool.run_until_idle(Duration::from_secs(5)));
        assert_eq!(*log.lock(), vec![(id, Some(guid.to_string()))]);
    }

    #[test]
    fn test_concurrent_try_load_starts_one_load() {
        let pool = Arc::new(RunnerPool::with_runners(4).unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = staged_cache(calls.clone());
        let id = cache.find_or_register(Guid::from_name("contended")).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let cache = cache.clone();
                let pool = pool.handle();
                let fired = fired.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let batch = cache
                        .try_load(id, ListenerId::new(i), move |_, outcome| {
                            assert!(outcome.is_loaded());
                            fired.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                    pool.queue_batch(batch).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(pool.run_until_idle(Duration::from_secs(10)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 16);
        assert_eq!(cache.stats().listeners_fired, 16);
    }
}

#[cfg(test)]
mod guid_tests {
    use super::*;

    #[test]
    fn test_guid_display_and_parse() {
        let guid = Guid::from_u128(0x0123_4567_89ab_cdef_0011_2233_4455_6677);
        let text = guid.to_string();
        assert_eq!(text, "01234567-89ab-cdef-0011-223344556677");
        assert_eq!(text.parse::<Guid>().unwrap(), guid);
        assert_eq!("{01234567-89AB-CDEF-0011-223344556677}".parse::<Guid>().unwrap(), guid);
        assert_eq!("0123456789abcdef0011223344556677".parse::<Guid>().unwrap(), guid);
    }

    #[test]
    fn test_guid_parse_errors() {
        assert!("".parse::<Guid>().is_err());
        assert!("not-a-guid".parse::<Guid>().is_err());
        assert!("0123456789abcdef001122334455667".parse::<Guid>().is_err());
        assert!("0123456789abcdef00112233445566zz".parse::<Guid>().is_err());
    }

    #[test]
    fn test_guid_from_name_is_stable() {
        assert_eq!(Guid::from_name("a/b.mesh"), Guid::from_name("a/b.mesh"));
        assert_ne!(Guid::from_name("a/b.mesh"), Guid::from_name("a/c.mesh"));
        assert!(!Guid::from_name("").is_nil());
    }

    #[test]
    fn test_guid_generate_not_nil() {
        let a = Guid::generate();
        let b = Guid::generate();
        assert!(!a.is_nil());
        assert_ne!(a, b);
    }

    #[test]
    fn test_guid_serde_as_string() {
        let guid = Guid::from_name("serde");
        let json = serde_json::to_string(&guid).unwrap();
        assert_eq!(json, format!("\"{}\"", guid));
        let back: Guid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, guid);
    }
}
