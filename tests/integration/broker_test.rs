//! Integration tests for the playback-request broker
//!
//! These tests drive a `Session` against an in-process server that renders
//! in real time to a null output.

use crate::test_utils::{event, paced_server, pcm, spec, wait_until, MemoryResolver, Recorder};
use parking_lot::Mutex;
use r_chime::broker::{FinishCallback, Session, SessionOptions};
use r_chime::error::ErrorKind;
use r_chime::proplist::{self, Proplist};
use r_chime::server::{LocalServer, NullOutput, ServerConfig};
use r_chime::sound::SoundResolver;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
mod broker_integration_tests {
    use super::*;

    /// Three seconds of audio; outlives every assertion made while it plays.
    const LONG_MS: usize = 3000;
    const SHORT_MS: usize = 20;

    fn open(server: &LocalServer, resolver: &Arc<MemoryResolver>) -> Session {
        let mut props = Proplist::new();
        props.sets(proplist::APPLICATION_NAME, "broker-tests").unwrap();
        let resolver: Arc<dyn SoundResolver> = resolver.clone();
        Session::open_with(
            server,
            SessionOptions {
                properties: props,
                resolver: Some(resolver),
                ..SessionOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_cached_sample_without_callback_is_not_tracked() {
        let server = paced_server(true);
        server.insert_sample("bell", spec(), pcm(SHORT_MS));
        let resolver = MemoryResolver::new();
        let session = open(&server, &resolver);

        session.play(1, &event("bell", &[])).unwrap();
        assert_eq!(session.outstanding(), 0);

        let stats = server.stats();
        assert_eq!(stats.play_requests, 1);
        assert_eq!(stats.streams_created, 0);
        assert_eq!(stats.subscribe_requests, 0);
        assert_eq!(resolver.counters.lookups(), 0);

        session.close().unwrap();
        server.shutdown();
    }

    #[test]
    fn test_callback_runs_exactly_once() {
        let server = paced_server(true);
        server.insert_sample("bell", spec(), pcm(SHORT_MS));
        let resolver = MemoryResolver::new();
        let session = open(&server, &resolver);
        let recorder = Recorder::new();

        session
            .play_with(1, &event("bell", &[]), Some(recorder.callback()))
            .unwrap();
        let outcomes = recorder.wait_for(1);
        assert_eq!(outcomes, vec![(1, Ok(()))]);

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(recorder.len(), 1);
        assert_eq!(session.outstanding(), 0);

        session.close().unwrap();
        assert_eq!(recorder.len(), 1);
        server.shutdown();
    }

    #[test]
    fn test_close_destroys_playing_sample() {
        let server = paced_server(true);
        server.insert_sample("long", spec(), pcm(LONG_MS));
        let resolver = MemoryResolver::new();
        let session = open(&server, &resolver);
        let recorder = Recorder::new();

        session
            .play_with(5, &event("long", &[]), Some(recorder.callback()))
            .unwrap();
        assert_eq!(session.outstanding(), 1);

        session.close().unwrap();
        assert_eq!(recorder.outcomes(), vec![(5, Err(ErrorKind::Destroyed))]);
        assert_eq!(session.outstanding(), 0);
        server.shutdown();
    }

    #[test]
    fn test_cancel_without_match_is_a_no_op() {
        let server = paced_server(true);
        server.insert_sample("long", spec(), pcm(LONG_MS));
        let resolver = MemoryResolver::new();
        let session = open(&server, &resolver);
        let recorder = Recorder::new();

        session
            .play_with(1, &event("long", &[]), Some(recorder.callback()))
            .unwrap();
        session.cancel(99).unwrap();

        assert_eq!(recorder.len(), 0);
        assert_eq!(session.outstanding(), 1);
        assert_eq!(server.stats().kill_requests, 0);

        session.close().unwrap();
        server.shutdown();
    }

    #[test]
    fn test_cancel_completes_every_matching_request() {
        let server = paced_server(true);
        server.insert_sample("long", spec(), pcm(LONG_MS));
        let resolver = MemoryResolver::new();
        let session = open(&server, &resolver);
        let recorder = Recorder::new();
        let other = Recorder::new();

        for _ in 0..3 {
            session
                .play_with(7, &event("long", &[]), Some(recorder.callback()))
                .unwrap();
        }
        session
            .play_with(8, &event("long", &[]), Some(other.callback()))
            .unwrap();
        assert_eq!(session.outstanding(), 4);

        session.cancel(7).unwrap();
        // Canceled outcomes are delivered before cancel returns.
        let outcomes = recorder.outcomes();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes
            .iter()
            .all(|outcome| *outcome == (7, Err(ErrorKind::Canceled))));

        wait_until("kill requests", || server.stats().kill_requests == 3);
        assert_eq!(session.outstanding(), 1);
        assert_eq!(other.len(), 0);

        session.close().unwrap();
        assert_eq!(other.outcomes(), vec![(8, Err(ErrorKind::Destroyed))]);
        assert_eq!(recorder.len(), 3);
        server.shutdown();
    }

    #[test]
    fn test_uncached_sample_retries_then_streams() {
        let server = paced_server(false);
        let resolver = MemoryResolver::new();
        resolver.add("chirp", SHORT_MS);
        let session = open(&server, &resolver);
        let recorder = Recorder::new();

        session
            .play_with(
                3,
                &event("chirp", &[(proplist::CACHE_CONTROL, "permanent")]),
                Some(recorder.callback()),
            )
            .unwrap();
        assert_eq!(recorder.wait_for(1), vec![(3, Ok(()))]);

        let stats = server.stats();
        assert_eq!(stats.play_requests, 3);
        assert_eq!(stats.uploads, 2);
        // Two upload streams plus the direct playback.
        assert_eq!(stats.streams_created, 3);
        assert_eq!(resolver.counters.lookups(), 3);
        assert!(!server.has_sample("chirp"));

        session.close().unwrap();
        server.shutdown();
    }

    #[test]
    fn test_cache_control_never_streams_immediately() {
        let server = paced_server(true);
        let resolver = MemoryResolver::new();
        resolver.add("chirp", SHORT_MS);
        let session = open(&server, &resolver);
        let recorder = Recorder::new();

        session
            .play_with(
                4,
                &event("chirp", &[(proplist::CACHE_CONTROL, "never")]),
                Some(recorder.callback()),
            )
            .unwrap();
        assert_eq!(recorder.wait_for(1), vec![(4, Ok(()))]);

        let stats = server.stats();
        assert_eq!(stats.play_requests, 1);
        assert_eq!(stats.uploads, 0);
        assert_eq!(stats.streams_created, 1);

        session.close().unwrap();
        server.shutdown();
    }

    #[test]
    fn test_upload_makes_later_plays_hit_cache() {
        let server = paced_server(true);
        let resolver = MemoryResolver::new();
        resolver.add("chirp", SHORT_MS);
        let session = open(&server, &resolver);
        let recorder = Recorder::new();

        session
            .play_with(
                1,
                &event("chirp", &[(proplist::CACHE_CONTROL, "volatile")]),
                Some(recorder.callback()),
            )
            .unwrap();
        recorder.wait_for(1);
        assert!(server.has_sample("chirp"));
        assert_eq!(server.stats().play_requests, 2);
        assert_eq!(server.stats().uploads, 1);

        session.play(2, &event("chirp", &[])).unwrap();
        assert_eq!(server.stats().play_requests, 3);
        assert_eq!(server.stats().uploads, 1);

        session.close().unwrap();
        server.shutdown();
    }

    #[test]
    fn test_explicit_cache() {
        let server = paced_server(true);
        let resolver = MemoryResolver::new();
        resolver.add("chirp", SHORT_MS);
        let session = open(&server, &resolver);

        session.cache(&event("chirp", &[])).unwrap();
        assert!(server.has_sample("chirp"));
        assert_eq!(server.stats().uploads, 1);
        assert_eq!(session.outstanding(), 0);

        assert_eq!(
            session
                .cache(&event("chirp", &[(proplist::CACHE_CONTROL, "never")]))
                .unwrap_err(),
            ErrorKind::Invalid
        );
        assert_eq!(
            session.cache(&event("missing", &[])).unwrap_err(),
            ErrorKind::NotFound
        );
        assert_eq!(server.stats().uploads, 1);

        session.close().unwrap();
        server.shutdown();
    }

    #[test]
    fn test_single_subscription_across_plays() {
        let server = paced_server(true);
        server.insert_sample("bell", spec(), pcm(SHORT_MS));
        let resolver = MemoryResolver::new();
        let session = open(&server, &resolver);
        let recorder = Recorder::new();

        for id in 1..=3 {
            session
                .play_with(id, &event("bell", &[]), Some(recorder.callback()))
                .unwrap();
        }
        let mut outcomes = recorder.wait_for(3);
        outcomes.sort_by_key(|(id, _)| *id);
        assert_eq!(outcomes, vec![(1, Ok(())), (2, Ok(())), (3, Ok(()))]);
        assert_eq!(server.stats().subscribe_requests, 1);

        session.close().unwrap();
        server.shutdown();
    }

    #[test]
    fn test_teardown_releases_direct_streams() {
        let server = paced_server(true);
        let resolver = MemoryResolver::new();
        resolver.add("speech", LONG_MS);
        let session = open(&server, &resolver);
        let recorder = Recorder::new();

        for id in 1..=3 {
            session
                .play_with(id, &event("speech", &[]), Some(recorder.callback()))
                .unwrap();
        }
        assert_eq!(session.outstanding(), 3);
        assert_eq!(resolver.counters.opened(), 3);

        session.close().unwrap();
        let outcomes = recorder.outcomes();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes
            .iter()
            .all(|(_, outcome)| *outcome == Err(ErrorKind::Destroyed)));

        let counters = Arc::clone(&resolver.counters);
        wait_until("sources released", || counters.dropped() == counters.opened());
        server.shutdown();
    }

    #[test]
    fn test_direct_stream_without_callback_still_finishes() {
        let server = paced_server(true);
        let resolver = MemoryResolver::new();
        resolver.add("chirp", SHORT_MS);
        let session = open(&server, &resolver);

        session
            .play(1, &event("chirp", &[(proplist::VOLUME, "-6")]))
            .unwrap();
        let counters = Arc::clone(&resolver.counters);
        wait_until("stream drained", || counters.dropped() == 1);
        assert_eq!(session.outstanding(), 0);

        session.close().unwrap();
        server.shutdown();
    }

    #[test]
    fn test_update_properties_strips_internal_keys() {
        let server = paced_server(true);
        let resolver = MemoryResolver::new();
        let session = open(&server, &resolver);

        let mut changed = Proplist::new();
        changed.sets(proplist::APPLICATION_NAME, "renamed").unwrap();
        changed.sets(proplist::VOLUME, "-3").unwrap();
        session.update_properties(&changed).unwrap();

        wait_until("property update", || server.stats().proplist_updates.len() == 1);
        let sent = server.stats().proplist_updates[0].clone();
        assert_eq!(sent.gets(proplist::APPLICATION_NAME), Some("renamed"));
        assert!(!sent.contains(proplist::VOLUME));
        assert_eq!(
            session.properties().gets(proplist::APPLICATION_NAME),
            Some("renamed")
        );

        session.close().unwrap();
        assert_eq!(
            session.update_properties(&changed).unwrap_err(),
            ErrorKind::State
        );
        server.shutdown();
    }

    #[test]
    fn test_output_device_switch() {
        let server = paced_server(true);
        let resolver = MemoryResolver::new();
        let session = open(&server, &resolver);

        assert_eq!(session.output_device(), None);
        session.change_output_device(Some("speakers")).unwrap();
        assert_eq!(session.output_device().as_deref(), Some("speakers"));
        session.change_output_device(None).unwrap();
        assert_eq!(session.output_device(), None);

        session.close().unwrap();
        server.shutdown();
    }

    #[test]
    fn test_lost_connection_fails_outstanding() {
        let server = paced_server(true);
        server.insert_sample("long", spec(), pcm(LONG_MS));
        let resolver = MemoryResolver::new();
        let session = open(&server, &resolver);
        let recorder = Recorder::new();

        session
            .play_with(1, &event("long", &[]), Some(recorder.callback()))
            .unwrap();
        server.drop_clients();

        assert_eq!(recorder.wait_for(1), vec![(1, Err(ErrorKind::IO))]);
        assert_eq!(session.outstanding(), 0);

        let _ = session.close();
        assert_eq!(recorder.len(), 1);
        server.shutdown();
    }

    #[test]
    fn test_open_errors() {
        let refusing = LocalServer::new(ServerConfig {
            refuse_connections: true,
            output: Arc::new(NullOutput::new()),
            ..ServerConfig::default()
        })
        .unwrap();
        assert_eq!(
            Session::open(&refusing, None, &Proplist::new()).unwrap_err(),
            ErrorKind::NotAvailable
        );
        refusing.shutdown();

        let server = paced_server(true);
        let options = SessionOptions {
            driver: Some("pulse".to_string()),
            ..SessionOptions::default()
        };
        assert_eq!(
            Session::open_with(&server, options).unwrap_err(),
            ErrorKind::NoDriver
        );
        server.shutdown();
    }

    #[test]
    fn test_closed_session_rejects_requests() {
        let server = paced_server(true);
        let resolver = MemoryResolver::new();
        let session = open(&server, &resolver);

        session.close().unwrap();
        assert!(session.is_closed());
        assert_eq!(session.close().unwrap_err(), ErrorKind::State);
        assert_eq!(
            session.play(1, &event("bell", &[])).unwrap_err(),
            ErrorKind::State
        );
        assert_eq!(session.cancel(1).unwrap_err(), ErrorKind::State);
        assert_eq!(
            session.cache(&event("bell", &[])).unwrap_err(),
            ErrorKind::State
        );
        server.shutdown();
    }

    #[test]
    fn test_malformed_events_are_rejected() {
        let server = paced_server(true);
        server.insert_sample("bell", spec(), pcm(SHORT_MS));
        let resolver = MemoryResolver::new();
        let session = open(&server, &resolver);

        assert_eq!(
            session.play(1, &Proplist::new()).unwrap_err(),
            ErrorKind::Invalid
        );
        assert_eq!(
            session.play(1, &event("", &[])).unwrap_err(),
            ErrorKind::Invalid
        );
        assert_eq!(
            session
                .play(1, &event("bell", &[(proplist::VOLUME, "loud")]))
                .unwrap_err(),
            ErrorKind::Invalid
        );
        assert_eq!(
            session
                .play(1, &event("bell", &[(proplist::CACHE_CONTROL, "sometimes")]))
                .unwrap_err(),
            ErrorKind::Invalid
        );
        assert_eq!(server.stats().play_requests, 0);

        session.close().unwrap();
        server.shutdown();
    }

    #[test]
    fn test_missing_sound_fails_synchronously() {
        let server = paced_server(true);
        let resolver = MemoryResolver::new();
        let session = open(&server, &resolver);
        let recorder = Recorder::new();

        assert_eq!(
            session
                .play_with(1, &event("nothing", &[]), Some(recorder.callback()))
                .unwrap_err(),
            ErrorKind::NotFound
        );
        assert_eq!(session.outstanding(), 0);

        session.close().unwrap();
        assert_eq!(recorder.len(), 0);
        server.shutdown();
    }

    #[test]
    fn test_cancel_from_callback() {
        let server = paced_server(true);
        server.insert_sample("bell", spec(), pcm(SHORT_MS));
        server.insert_sample("long", spec(), pcm(LONG_MS));
        let resolver = MemoryResolver::new();
        let session = open(&server, &resolver);
        let recorder = Recorder::new();
        let cancel_result = Arc::new(Mutex::new(None));

        session
            .play_with(2, &event("long", &[]), Some(recorder.callback()))
            .unwrap();

        let inner = session.clone();
        let result = Arc::clone(&cancel_result);
        let record = recorder.callback();
        let callback: FinishCallback = Box::new(move |id, outcome| {
            *result.lock() = Some(inner.cancel(2));
            record(id, outcome);
        });
        session
            .play_with(1, &event("bell", &[]), Some(callback))
            .unwrap();

        let mut outcomes = recorder.wait_for(2);
        outcomes.sort_by_key(|(id, _)| *id);
        assert_eq!(outcomes, vec![(1, Ok(())), (2, Err(ErrorKind::Canceled))]);
        assert_eq!(*cancel_result.lock(), Some(Ok(())));

        session.close().unwrap();
        server.shutdown();
    }

    #[test]
    fn test_blocking_call_from_callback_is_refused() {
        let server = paced_server(true);
        server.insert_sample("bell", spec(), pcm(SHORT_MS));
        let resolver = MemoryResolver::new();
        let session = open(&server, &resolver);
        let recorder = Recorder::new();
        let nested = Arc::new(Mutex::new(None));

        let inner = session.clone();
        let result = Arc::clone(&nested);
        let record = recorder.callback();
        let callback: FinishCallback = Box::new(move |id, outcome| {
            *result.lock() = Some(inner.play(2, &event("bell", &[])));
            record(id, outcome);
        });
        session
            .play_with(1, &event("bell", &[]), Some(callback))
            .unwrap();

        recorder.wait_for(1);
        assert_eq!(*nested.lock(), Some(Err(ErrorKind::State)));
        assert_eq!(server.stats().play_requests, 1);

        session.close().unwrap();
        server.shutdown();
    }

    /// Staggers `close` against a request running on another thread.
    fn stagger(round: usize) -> Duration {
        Duration::from_micros((round % 10) as u64 * 300)
    }

    #[test]
    fn test_close_during_upload_fails_cache() {
        // Long enough that most closes land mid-upload.
        const UPLOAD_MS: usize = 400_000;

        for round in 0..20 {
            let server = paced_server(true);
            let resolver = MemoryResolver::new();
            resolver.add("anthem", UPLOAD_MS);
            let session = open(&server, &resolver);

            let uploader = session.clone();
            let worker = std::thread::spawn(move || uploader.cache(&event("anthem", &[])));
            std::thread::sleep(stagger(round));
            session.close().unwrap();

            match worker.join().unwrap() {
                Ok(()) => assert!(server.has_sample("anthem"), "round {}", round),
                Err(e) => assert!(
                    matches!(e, ErrorKind::Destroyed | ErrorKind::State),
                    "round {}: {:?}",
                    round,
                    e
                ),
            }
            wait_until("sound sources released", || {
                resolver.counters.dropped() == resolver.counters.opened()
            });
            server.shutdown();
        }
    }

    #[test]
    fn test_close_racing_play_reports_once() {
        for round in 0..30 {
            let server = paced_server(true);
            server.insert_sample("gong", spec(), pcm(LONG_MS));
            let resolver = MemoryResolver::new();
            let session = open(&server, &resolver);
            let recorder = Recorder::new();

            let player = session.clone();
            let callback = recorder.callback();
            let worker = std::thread::spawn(move || {
                player.play_with(7, &event("gong", &[]), Some(callback))
            });
            std::thread::sleep(stagger(round));
            session.close().unwrap();
            let returned = worker.join().unwrap();

            // Nothing can complete after close returns, so the count is final.
            let outcomes = recorder.outcomes();
            match returned {
                Ok(()) => assert_eq!(
                    outcomes,
                    vec![(7, Err(ErrorKind::Destroyed))],
                    "round {}",
                    round
                ),
                Err(e) => {
                    assert!(
                        matches!(e, ErrorKind::Destroyed | ErrorKind::State),
                        "round {}: {:?}",
                        round,
                        e
                    );
                    assert!(outcomes.is_empty(), "round {}: {:?}", round, outcomes);
                }
            }
            assert_eq!(session.outstanding(), 0);
            server.shutdown();
        }
    }
}
