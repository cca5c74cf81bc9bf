mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use helpers::*;
use quiver_dns_engine::{ChannelBuilder, QueryOutcome, TransportKind};

#[test]
fn udp_query_completes_on_matching_response() {
    let (channel, state, results) = test_channel(test_config(1));

    channel.send_at(a_query("example.com"), recorder(&results), t(0));
    assert_eq!(channel.active_queries(), 1);

    // One UDP socket was opened and carries exactly one query.
    let handle = {
        let state = state.lock().unwrap();
        assert_eq!(state.opens, vec![(server_addr(0), TransportKind::Udp)]);
        state.handle_for(server_addr(0), TransportKind::Udp)
    };
    let sent = {
        let state = state.lock().unwrap();
        let sent = state.sent_messages(server_addr(0));
        assert_eq!(sent.len(), 1);
        sent.into_iter().next().unwrap()
    };
    assert_eq!(sent.queries()[0].name().to_ascii(), "example.com.");

    {
        let mut state = state.lock().unwrap();
        let response = with_a_record(response_for(&sent));
        state.inject_udp(handle, &response);
    }
    channel.tick(&[handle], &[], t(15));

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    match &results[0] {
        QueryOutcome::Answer { response, timeouts } => {
            assert_eq!(*timeouts, 0);
            assert_eq!(response.answers().len(), 1);
        }
        other => panic!("expected answer, got {:?}", other),
    }
    assert_eq!(channel.active_queries(), 0);

    let info = channel.server_info();
    assert_eq!(info[0].consec_failures, 0);
    assert!(info[0].next_retry_time.is_none());
}

#[test]
fn success_notifies_server_state_observer() {
    let events: Arc<Mutex<Vec<(String, bool, &'static str)>>> = Arc::new(Mutex::new(Vec::new()));
    let events2 = Arc::clone(&events);

    let (transport, state) = mock_transport();
    let channel = ChannelBuilder::new(test_config(1))
        .transport(transport)
        .random(CountingRng(0))
        .on_server_state(move |addr, success, kind| {
            events2
                .lock()
                .unwrap()
                .push((addr.to_string(), success, kind.as_str()));
        })
        .build();

    let results = Arc::new(Mutex::new(Vec::new()));
    channel.send_at(a_query("example.com"), recorder(&results), t(0));

    let handle = state
        .lock()
        .unwrap()
        .handle_for(server_addr(0), TransportKind::Udp);
    let sent = state.lock().unwrap().sent_messages(server_addr(0))[0].clone();
    state
        .lock()
        .unwrap()
        .inject_udp(handle, &with_a_record(response_for(&sent)));
    channel.tick(&[handle], &[], t(5));

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![(server_addr(0).to_string(), true, "UDP")]
    );
}

#[test]
fn queue_empty_fires_once_per_drain() {
    let emptied = Arc::new(AtomicUsize::new(0));
    let emptied2 = Arc::clone(&emptied);

    let (transport, state) = mock_transport();
    let channel = ChannelBuilder::new(test_config(1))
        .transport(transport)
        .random(CountingRng(0))
        .on_queue_empty(move || {
            emptied2.fetch_add(1, Ordering::SeqCst);
        })
        .build();

    let results = Arc::new(Mutex::new(Vec::new()));
    channel.send_at(a_query("example.com"), recorder(&results), t(0));
    assert_eq!(emptied.load(Ordering::SeqCst), 0);

    let handle = state
        .lock()
        .unwrap()
        .handle_for(server_addr(0), TransportKind::Udp);
    let sent = state.lock().unwrap().sent_messages(server_addr(0))[0].clone();
    state
        .lock()
        .unwrap()
        .inject_udp(handle, &with_a_record(response_for(&sent)));
    channel.tick(&[handle], &[], t(5));

    assert_eq!(emptied.load(Ordering::SeqCst), 1);
}

#[test]
fn idle_connection_closes_unless_stay_open() {
    // Default: the idle UDP connection is reclaimed after completion.
    let (channel, state, results) = test_channel(test_config(1));
    channel.send_at(a_query("example.com"), recorder(&results), t(0));
    let handle = state
        .lock()
        .unwrap()
        .handle_for(server_addr(0), TransportKind::Udp);
    let sent = state.lock().unwrap().sent_messages(server_addr(0))[0].clone();
    state
        .lock()
        .unwrap()
        .inject_udp(handle, &with_a_record(response_for(&sent)));
    channel.tick(&[handle], &[], t(5));
    assert!(state.lock().unwrap().sock(handle).closed);

    // stay_open keeps it.
    let mut config = test_config(1);
    config.options.stay_open = true;
    let (channel, state, results) = test_channel(config);
    channel.send_at(a_query("example.com"), recorder(&results), t(0));
    let handle = state
        .lock()
        .unwrap()
        .handle_for(server_addr(0), TransportKind::Udp);
    let sent = state.lock().unwrap().sent_messages(server_addr(0))[0].clone();
    state
        .lock()
        .unwrap()
        .inject_udp(handle, &with_a_record(response_for(&sent)));
    channel.tick(&[handle], &[], t(5));
    assert!(!state.lock().unwrap().sock(handle).closed);
    assert_eq!(channel.server_info()[0].connections, 1);
}
