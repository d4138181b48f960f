//! Tests for error translation, request records, the registry and the subscription gate

#[cfg(test)]
mod tests {
    use super::super::lifecycle::RequestParams;
    use super::super::translate::{errno_kind, translate, translate_code};
    use super::super::*;
    use crate::error::ErrorKind;
    use crate::proplist::{self, Proplist};
    use crate::server::{LocalServer, Mainloop, ServerConfig, ServerError};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    type Outcomes = Arc<Mutex<Vec<(u32, std::result::Result<(), ErrorKind>)>>>;

    fn recorder() -> (Outcomes, impl Fn() -> FinishCallback) {
        let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        let make = move || {
            let sink = Arc::clone(&sink);
            let callback: FinishCallback = Box::new(move |id, outcome| sink.lock().push((id, outcome)));
            callback
        };
        (outcomes, make)
    }

    fn record(kind: RequestKind, id: u32, completion: Option<FinishCallback>) -> OutstandingRequest {
        OutstandingRequest::new(kind, id, completion)
    }

    #[test]
    fn test_translate_is_total() {
        for error in ServerError::ALL {
            assert_eq!(translate_code(error.code()), Err(translate(error)));
        }
        assert_eq!(translate_code(0), Ok(()));
        assert_eq!(translate_code(4242), Err(ErrorKind::IO));
        assert_eq!(errno_kind(0), ErrorKind::IO);
    }

    #[test]
    fn test_translate_mapping() {
        assert_eq!(translate(ServerError::NoEntity), ErrorKind::NotFound);
        assert_eq!(translate(ServerError::ConnectionRefused), ErrorKind::NotAvailable);
        assert_eq!(translate(ServerError::Access), ErrorKind::Access);
        assert_eq!(translate(ServerError::AuthKey), ErrorKind::Access);
        assert_eq!(translate(ServerError::Killed), ErrorKind::Destroyed);
        assert_eq!(translate(ServerError::TooLarge), ErrorKind::TooBig);
        assert_eq!(translate(ServerError::BadState), ErrorKind::State);
        assert_eq!(translate(ServerError::ConnectionTerminated), ErrorKind::IO);
        assert_eq!(ErrorKind::from(ServerError::Invalid), ErrorKind::Invalid);
    }

    #[test]
    fn test_sample_trigger_transitions() {
        let mut r = record(RequestKind::TriggerSample, 1, None);
        assert_eq!(r.state(), RequestState::Created);
        r.advance(RequestState::Submitted).unwrap();
        r.resolve(Err(ErrorKind::NotFound));
        assert_eq!(r.state(), RequestState::Resolved(Resolution::NotFound));
        assert_eq!(r.pending_error, Some(ErrorKind::NotFound));

        r.advance(RequestState::Submitted).unwrap();
        r.resolve(Ok(17));
        assert_eq!(r.state(), RequestState::Resolved(Resolution::Success));
        assert_eq!(r.server_object_id, Some(17));
        assert_eq!(r.pending_error, None);
        r.advance(RequestState::Completed).unwrap();
        assert!(r.state().is_terminal());
    }

    #[test]
    fn test_stream_transitions() {
        let mut r = record(RequestKind::DirectStream, 1, None);
        r.advance(RequestState::StreamConnecting).unwrap();
        assert_eq!(r.advance(RequestState::Draining), Err(ErrorKind::State));
        r.advance(RequestState::StreamReady).unwrap();
        r.advance(RequestState::Writing).unwrap();
        r.advance(RequestState::Writing).unwrap();
        r.advance(RequestState::Draining).unwrap();
        assert_eq!(r.advance(RequestState::Writing), Err(ErrorKind::State));
        r.advance(RequestState::Completed).unwrap();
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let created = RequestState::Created;
        assert!(!created.can_advance_to(RequestState::Completed));
        assert!(!created.can_advance_to(RequestState::Writing));
        assert!(!RequestState::Submitted.can_advance_to(RequestState::StreamConnecting));
        assert!(!RequestState::Resolved(Resolution::Success).can_advance_to(RequestState::Submitted));

        for terminal in [
            RequestState::Completed,
            RequestState::Cancelled,
            RequestState::Destroyed,
            RequestState::Failed(ErrorKind::IO),
            RequestState::Resolved(Resolution::Error(ErrorKind::Access)),
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_advance_to(RequestState::Cancelled));
            assert!(!terminal.can_advance_to(RequestState::Destroyed));
        }
        assert!(RequestState::Writing.can_advance_to(RequestState::Cancelled));
        assert!(RequestState::Submitted.can_advance_to(RequestState::Destroyed));
    }

    #[test]
    fn test_complete_runs_callback_once_and_dispose_never() {
        let (outcomes, make) = recorder();
        record(RequestKind::TriggerSample, 5, Some(make())).complete(Err(ErrorKind::Canceled));
        record(RequestKind::TriggerSample, 6, Some(make())).dispose();
        record(RequestKind::TriggerSample, 7, None).complete(Ok(()));
        assert_eq!(*outcomes.lock(), vec![(5, Err(ErrorKind::Canceled))]);
    }

    #[test]
    fn test_registry_tracking() {
        let registry = OutstandingRegistry::new();
        let a = registry.create(record(RequestKind::TriggerSample, 1, None));
        let b = registry.create(record(RequestKind::DirectStream, 1, None));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.tracked_len(), 0);

        assert!(registry.track(a));
        assert_eq!(registry.tracked_len(), 1);
        assert!(registry.take_untracked(a).is_none());
        assert!(registry.remove_tracked(b).is_none());

        let taken = registry.take_untracked(b).unwrap();
        assert!(!taken.is_tracked());
        assert!(!registry.track(b));

        let removed = registry.remove_tracked(a).unwrap();
        assert!(!removed.is_tracked());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_remove_if_only_sees_tracked() {
        let registry = OutstandingRegistry::new();
        let mut keys = Vec::new();
        for id in [1, 2, 1, 1] {
            keys.push(registry.create(record(RequestKind::TriggerSample, id, None)));
        }
        for key in &keys[..3] {
            registry.track(*key);
        }
        let removed = registry.remove_if(|r| r.request_id == 1);
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|r| !r.is_tracked()));
        assert_eq!(registry.tracked_len(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_drain_all_runs_callbacks_without_registry_lock() {
        let registry = Arc::new(OutstandingRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for id in 0..4 {
            let observer = Arc::clone(&registry);
            let seen = Arc::clone(&seen);
            let callback: FinishCallback = Box::new(move |id, outcome| {
                // Re-entering the registry would deadlock if the lock were held.
                seen.lock().push((id, outcome, observer.len()));
            });
            let key = registry.create(record(RequestKind::TriggerSample, id, Some(callback)));
            registry.track(key);
        }
        let untracked = registry.create(record(RequestKind::CacheUpload, 9, None));

        assert_eq!(registry.drain_all(Err(ErrorKind::Destroyed)), 4);
        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|(_, outcome, _)| *outcome == Err(ErrorKind::Destroyed)));
        assert_eq!(registry.len(), 1);
        assert!(registry.take(untracked).is_some());
    }

    #[test]
    fn test_note_removed_marks_untracked_triggers() {
        let registry = OutstandingRegistry::new();
        let mut sample = record(RequestKind::TriggerSample, 1, None);
        sample.server_object_id = Some(3);
        let key = registry.create(sample);
        let mut stream = record(RequestKind::DirectStream, 1, None);
        stream.server_object_id = Some(4);
        registry.create(stream);

        assert!(!registry.note_removed(4));
        assert!(registry.note_removed(3));
        assert_eq!(registry.with(key, |r| r.early_finish), Some(true));
    }

    #[test]
    fn test_cache_control_and_volume_parsing() {
        assert_eq!("never".parse::<CacheControl>(), Ok(CacheControl::Never));
        assert_eq!("permanent".parse::<CacheControl>(), Ok(CacheControl::Permanent));
        assert_eq!("volatile".parse::<CacheControl>(), Ok(CacheControl::Volatile));
        assert_eq!("forever".parse::<CacheControl>(), Err(ErrorKind::Invalid));

        assert!(parse_volume("0").unwrap().is_norm());
        assert!((parse_volume(" -20.0 ").unwrap().linear() - 0.1).abs() < 1e-9);
        assert_eq!(parse_volume("loud"), Err(ErrorKind::Invalid));
        assert_eq!(parse_volume(""), Err(ErrorKind::Invalid));
    }

    #[test]
    fn test_parse_volume_rejects_unbounded_gain() {
        assert_eq!(parse_volume("inf"), Err(ErrorKind::Invalid));
        assert_eq!(parse_volume("+infinity"), Err(ErrorKind::Invalid));
        assert_eq!(parse_volume("NaN"), Err(ErrorKind::Invalid));
        assert_eq!(parse_volume("-inf").unwrap().linear(), 0.0);
    }

    #[test]
    fn test_request_params() {
        let event: Proplist = [
            (proplist::EVENT_ID, "bell"),
            (proplist::VOLUME, "-6"),
            (proplist::CACHE_CONTROL, "volatile"),
            (proplist::MEDIA_NAME, "Bell"),
        ]
        .into_iter()
        .collect();
        let params = RequestParams::from_event(&event).unwrap();
        assert_eq!(params.name, "bell");
        assert_eq!(params.cache_control, Some(CacheControl::Volatile));
        assert!(params.volume.is_some());
        assert_eq!(params.props.len(), 2);
        assert!(!params.props.contains(proplist::VOLUME));

        let missing: Proplist = [(proplist::MEDIA_NAME, "x")].into_iter().collect();
        assert_eq!(RequestParams::from_event(&missing).unwrap_err(), ErrorKind::Invalid);

        let bad: Proplist = [(proplist::EVENT_ID, "bell"), (proplist::VOLUME, "1e")]
            .into_iter()
            .collect();
        assert_eq!(RequestParams::from_event(&bad).unwrap_err(), ErrorKind::Invalid);

        let bad: Proplist = [(proplist::EVENT_ID, "bell"), (proplist::CACHE_CONTROL, "sometimes")]
            .into_iter()
            .collect();
        assert_eq!(RequestParams::from_event(&bad).unwrap_err(), ErrorKind::Invalid);
    }

    #[test]
    fn test_subscription_gate_submits_once() {
        let server = LocalServer::new(ServerConfig::default()).unwrap();
        let mainloop = Mainloop::new(server.attach());
        {
            let mut guard = mainloop.lock();
            guard.connect(&Proplist::new()).unwrap();
            mainloop.start().unwrap();
            while guard.state() != crate::server::ContextState::Ready {
                guard.wait();
            }
        }

        let gate = SubscriptionGate::new();
        assert!(!gate.is_enabled());
        for _ in 0..5 {
            let mut guard = mainloop.lock();
            gate.ensure(&mut guard).unwrap();
        }
        assert!(gate.is_enabled());

        let deadline = Instant::now() + Duration::from_secs(5);
        while server.stats().subscribe_requests == 0 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(server.stats().subscribe_requests, 1);
        mainloop.stop();
    }

    #[test]
    fn test_subscription_gate_fails_before_ready() {
        let server = LocalServer::new(ServerConfig::default()).unwrap();
        let mainloop = Mainloop::new(server.attach());
        let gate = SubscriptionGate::new();
        let mut guard = mainloop.lock();
        assert_eq!(gate.ensure(&mut guard), Err(ErrorKind::State));
        assert!(!gate.is_enabled());
    }
}
