mod helpers;

use helpers::*;
use quiver_dns_engine::{ChannelBuilder, QueryOutcome, ResolveError, TransportKind};

#[test]
fn unanswered_query_walks_servers_and_doubles_deadlines() {
    let mut config = test_config(2);
    config.options.tries = 2;
    config.options.server_retry_chance = 0;

    let (transport, state) = mock_transport();
    let channel = ChannelBuilder::new(config)
        .transport(transport)
        .random(ZeroRng)
        .build();
    let results = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

    channel.send_at(a_query("example.com"), recorder(&results), t(0));
    assert_eq!(channel.next_timeout(), Some(t(2000)));

    // Attempt 2: next server, same base timeout (round 0 not yet done).
    channel.tick(&[], &[], t(2000));
    assert_eq!(channel.next_timeout(), Some(t(4000)));

    // Attempt 3: a full trip through the server list doubles the timeout.
    channel.tick(&[], &[], t(4000));
    assert_eq!(channel.next_timeout(), Some(t(8000)));

    // Attempt 4: still in round 1, same doubled timeout.
    channel.tick(&[], &[], t(8000));
    assert_eq!(channel.next_timeout(), Some(t(12000)));

    // Budget spent (2 servers x 2 tries): the query fails as timed out.
    channel.tick(&[], &[], t(12000));
    assert_eq!(channel.next_timeout(), None);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    match &results[0] {
        QueryOutcome::Failed {
            error,
            response,
            timeouts,
        } => {
            assert_eq!(*error, ResolveError::TimedOut);
            assert!(response.is_none());
            assert_eq!(*timeouts, 4);
        }
        other => panic!("expected timeout failure, got {:?}", other),
    }

    // Dispatches alternated across the ranked servers.
    let opens: Vec<_> = state.lock().unwrap().opens.clone();
    assert_eq!(
        opens,
        vec![
            (server_addr(0), TransportKind::Udp),
            (server_addr(1), TransportKind::Udp),
            (server_addr(0), TransportKind::Udp),
            (server_addr(1), TransportKind::Udp),
        ]
    );
    assert_eq!(state.lock().unwrap().sent_messages(server_addr(0)).len(), 2);
    assert_eq!(state.lock().unwrap().sent_messages(server_addr(1)).len(), 2);

    // Both servers carry the failures they earned.
    for snapshot in channel.server_info() {
        assert_eq!(snapshot.consec_failures, 2);
    }
}

#[test]
fn max_timeout_caps_the_doubling() {
    let mut config = test_config(1);
    config.options.tries = 3;
    config.options.server_retry_chance = 0;
    config.options.max_timeout_ms = 3000;

    let (transport, _state) = mock_transport();
    let channel = ChannelBuilder::new(config)
        .transport(transport)
        .random(ZeroRng)
        .build();
    let results = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

    channel.send_at(a_query("example.com"), recorder(&results), t(0));
    assert_eq!(channel.next_timeout(), Some(t(2000)));

    // Round 1 would double to 4000 but the cap holds it at 3000.
    channel.tick(&[], &[], t(2000));
    assert_eq!(channel.next_timeout(), Some(t(5000)));

    // Round 2 would be 8000; still capped.
    channel.tick(&[], &[], t(5000));
    assert_eq!(channel.next_timeout(), Some(t(8000)));
}

#[test]
fn late_response_after_timeout_is_ignored() {
    let mut config = test_config(1);
    config.options.tries = 1;
    config.options.server_retry_chance = 0;
    let (channel, state, results) = test_channel(config);

    channel.send_at(a_query("example.com"), recorder(&results), t(0));
    let udp = state
        .lock()
        .unwrap()
        .handle_for(server_addr(0), TransportKind::Udp);
    let sent = state.lock().unwrap().sent_messages(server_addr(0))[0].clone();

    // The only try expires; the query ends as timed out.
    channel.tick(&[], &[], t(2000));
    assert_eq!(results.lock().unwrap().len(), 1);

    // The answer arriving afterwards finds no query and is dropped. The
    // connection was already reclaimed, so nothing is readable either.
    {
        let mut state = state.lock().unwrap();
        if !state.sock(udp).closed {
            state.inject_udp(udp, &with_a_record(response_for(&sent)));
        }
    }
    channel.tick(&[udp], &[], t(2100));
    assert_eq!(results.lock().unwrap().len(), 1);
    assert_eq!(channel.active_queries(), 0);
}
