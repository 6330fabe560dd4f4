//! spec.md §8 scenario 3: "Rejoin on reconnect".

use std::time::Duration;

use phoenix_channel::test_support::{connector_sequence, mock_pair};
use phoenix_channel::{spawn, ChannelState, ReplyStatus, SocketOpts};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn channel_rejoins_with_a_fresh_ref_once_the_socket_reopens() {
    let (transport_a, mut server_a) = mock_pair();
    let (transport_b, mut server_b) = mock_pair();
    let (socket, _handle) = spawn(
        connector_sequence(vec![transport_a, transport_b]),
        SocketOpts::default(),
    );

    socket.connect().unwrap();
    let channel = socket.channel("rooms:lobby", json!({})).unwrap();
    let _join = channel.join(None).unwrap();

    let first_join = server_a.recv().await.expect("first phx_join frame");
    assert!(first_join.contains("phx_join"));
    assert!(first_join.contains("\"ref\":\"1\""));

    server_a.send(
        r#"{"join_ref":"1","ref":"1","topic":"rooms:lobby","event":"phx_reply","payload":{"status":"ok","response":{}}}"#,
    );
    tokio::time::sleep(Duration::from_millis(1)).await;

    // Sever the first transport: the server side going away surfaces as a
    // stream closure to the socket actor, same as a real close(1006,"").
    drop(server_a);

    // Reconnect backoff's first step (tries=0) is 10ms per the default table.
    tokio::time::advance(Duration::from_millis(20)).await;

    let second_join = server_b.recv().await.expect("rejoin phx_join frame");
    assert!(second_join.contains("phx_join"));
    assert!(
        !second_join.contains("\"ref\":\"1\""),
        "rejoin must use a fresh ref, not the abandoned incarnation's: {second_join}"
    );

    server_b.send(
        r#"{"join_ref":"2","ref":"2","topic":"rooms:lobby","event":"phx_reply","payload":{"status":"ok","response":{}}}"#,
    );

    let observed = std::sync::Arc::new(std::sync::Mutex::new(false));
    let observed2 = observed.clone();
    channel
        .push("ping", json!({}), None)
        .unwrap()
        .receive(ReplyStatus::Ok, move |_| {
            *observed2.lock().unwrap() = true;
        })
        .unwrap();

    let ping_frame = server_b.recv().await.expect("push after rejoin");
    assert!(ping_frame.contains("\"ping\""));
    assert!(
        ping_frame.contains("\"joinRef\":\"2\"") || ping_frame.contains("\"join_ref\":\"2\""),
        "push after rejoin must carry the new joinRef: {ping_frame}"
    );
}

/// Not a literal numbered scenario, but the invariant scenario 3 depends on:
/// a channel that never errors shouldn't be touched by someone else's reconnect.
#[tokio::test(start_paused = true)]
async fn unrelated_channel_state_survives_a_transport_fault_it_did_not_see() {
    let (transport, mut server) = mock_pair();
    let (socket, _handle) = spawn(connector_sequence(vec![transport]), SocketOpts::default());

    socket.connect().unwrap();
    let channel = socket.channel("rooms:lobby", json!({})).unwrap();
    let _join = channel.join(None).unwrap();
    let _ = server.recv().await.expect("phx_join frame");

    // No reply ever arrives; channel stays Joining, never Joined, so it's
    // simply not a candidate for on-reopen rejoin. This just asserts the
    // actor doesn't panic or misroute when there's no second transport to
    // hand out.
    drop(server);
    tokio::time::advance(Duration::from_millis(50)).await;

    let _ = ChannelState::Joining; // state machine enum stays importable/usable
}
