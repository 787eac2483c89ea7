mod support;

use rtcworker::WorkerState;
use serde_json::json;

#[tokio::test]
async fn announces_pid_before_serving() {
    let mut host = support::start();

    let running = host.next().await.unwrap();
    assert_eq!(running, json!({ "targetId": support::PID, "event": "running" }));

    let dump = host.request(json!({ "id": 1, "method": "dump" })).await;
    assert_eq!(
        dump,
        json!({
            "id": 1,
            "accepted": true,
            "data": { "pid": support::PID, "players": [], "handlers": [] }
        })
    );

    let (worker, _, rest) = host.disconnect().await;
    assert!(rest.is_empty());
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn get_mid_before_any_track_is_an_error() {
    let mut host = support::start();

    let created = host
        .request(json!({
            "id": "1",
            "method": "createHandler",
            "internal": { "handlerId": "h1" },
            "data": {}
        }))
        .await;
    assert_eq!(created, json!({ "id": "1", "accepted": true }));

    let mid = host
        .request(json!({
            "id": "2",
            "method": "handler.getMid",
            "internal": { "handlerId": "h1" },
            "data": { "localId": "x" }
        }))
        .await;
    assert_eq!(mid["id"], "2");
    assert_eq!(mid["error"], "Error");
    assert_eq!(mid["reason"], "localId \"x\" not found");

    // The worker keeps serving after the failure.
    let dump = host.request(json!({ "id": "3", "method": "dump" })).await;
    assert_eq!(dump["data"]["handlers"][0]["id"], "h1");
}

#[tokio::test]
async fn validation_failures_are_type_errors() {
    let mut host = support::start();

    let unknown = host
        .request(json!({ "id": 1, "method": "handler.teleport", "internal": { "handlerId": "h1" } }))
        .await;
    assert_eq!(unknown["error"], "TypeError");

    let missing = host
        .request(json!({ "id": 2, "method": "createHandler", "data": null }))
        .await;
    assert_eq!(
        missing,
        json!({ "id": 2, "error": "TypeError", "reason": "missing internal.handlerId" })
    );

    let duplicate = host
        .request(json!({ "id": 3, "method": "createHandler", "internal": { "handlerId": "h" } }))
        .await;
    assert_eq!(duplicate["accepted"], true);
    let duplicate = host
        .request(json!({ "id": 4, "method": "createHandler", "internal": { "handlerId": "h" } }))
        .await;
    assert_eq!(duplicate["error"], "Error");
    assert_eq!(duplicate["reason"], "handler with id \"h\" already exists");
}

#[tokio::test]
async fn mistyped_internal_still_gets_a_response() {
    let mut host = support::start();

    let numeric = host
        .request(json!({ "id": 1, "method": "handler.createOffer", "internal": { "handlerId": 5 } }))
        .await;
    assert_eq!(numeric["id"], 1);
    assert_eq!(numeric["error"], "TypeError");

    let text = host
        .request(json!({ "id": 2, "method": "createHandler", "internal": "h1" }))
        .await;
    assert_eq!(text["id"], 2);
    assert_eq!(text["error"], "TypeError");

    let dump = host.request(json!({ "id": 3, "method": "dump" })).await;
    assert_eq!(dump["id"], 3);
    assert_eq!(dump["data"]["handlers"], json!([]));
}

#[tokio::test]
async fn responses_follow_request_order() {
    let mut host = support::start();

    let mut batch = Vec::new();
    for id in 0..30u32 {
        let request = match id % 3 {
            0 => json!({ "id": id, "method": "createHandler", "internal": { "handlerId": format!("h{id}") } }),
            1 => json!({ "id": id, "method": "handler.getMid", "internal": { "handlerId": "missing" }, "data": { "localId": "a" } }),
            _ => json!({ "id": id, "method": "dump" }),
        };
        let payload = serde_json::to_vec(&request).unwrap();
        batch.extend_from_slice(&rtcworker::frame::encode(&payload));
    }
    // One write carrying every frame, delivered in odd-sized pieces.
    for chunk in batch.chunks(7) {
        host.send_raw(chunk).await;
    }

    for expected in 0..30u32 {
        let response = host.response().await;
        assert_eq!(response["id"], expected);
        assert_eq!(response.get("accepted").is_some(), expected % 3 != 1);
    }
}

#[tokio::test]
async fn undecodable_messages_are_dropped() {
    let mut host = support::start();

    host.send_raw(&rtcworker::frame::encode(b"not json")).await;
    host.send(json!({ "data": 1 })).await;
    host.send(json!({ "id": 9, "accepted": true })).await;
    host.send(json!({ "event": "handler.fly", "internal": { "handlerId": "h1" } }))
        .await;

    let dump = host.request(json!({ "id": 10, "method": "dump" })).await;
    assert_eq!(dump["id"], 10);
    assert_eq!(dump["accepted"], true);
}

#[tokio::test]
async fn malformed_frame_stops_the_worker() {
    let mut host = support::start();
    host.next().await.unwrap();

    host.send_raw(b"05:hello,").await;
    assert!(host.next().await.is_none());
}

#[tokio::test]
async fn repeated_handler_close_is_silent() {
    let mut host = support::start();
    host.request(json!({ "id": 1, "method": "createHandler", "internal": { "handlerId": "h1" } }))
        .await;

    let close = json!({ "event": "handler.close", "internal": { "handlerId": "h1" } });
    host.send(close.clone()).await;
    host.send(close).await;
    let closed = host
        .request(json!({ "id": 2, "method": "handler.close", "internal": { "handlerId": "h1" } }))
        .await;
    assert_eq!(closed, json!({ "id": 2, "accepted": true }));

    let dump = host.request(json!({ "id": 3, "method": "dump" })).await;
    assert_eq!(dump["data"]["handlers"], json!([]));

    let (_, engine, _) = host.disconnect().await;
    assert_eq!(engine.connection_close_calls(), 1);
}

#[tokio::test]
async fn disconnect_closes_every_entity_once() {
    let mut host = support::start();
    for id in ["h1", "h2", "h3"] {
        let response = host
            .request(json!({ "id": id, "method": "createHandler", "internal": { "handlerId": id } }))
            .await;
        assert_eq!(response["accepted"], true);
    }
    let player = host
        .request(json!({
            "id": "p",
            "method": "createPlayer",
            "internal": { "playerId": "p1" },
            "data": { "source": "file", "file": "/tmp/clip.webm" }
        }))
        .await;
    assert_eq!(player["accepted"], true);

    let (worker, engine, _) = host.disconnect().await;
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(engine.connections_created(), 3);
    assert_eq!(engine.connection_close_calls(), 3);
    assert_eq!(engine.tracks_stopped(), 2);

    // Nothing left to close a second time.
    worker.shutdown().await;
    assert_eq!(engine.connection_close_calls(), 3);
}

#[tokio::test]
async fn players_feed_handler_tracks() {
    let mut host = support::start();
    host.request(json!({
        "id": 1,
        "method": "createPlayer",
        "internal": { "playerId": "p1" },
        "data": { "source": "device", "file": "default", "format": "pulse" }
    }))
    .await;
    host.request(json!({ "id": 2, "method": "createHandler", "internal": { "handlerId": "h1" } }))
        .await;

    let added = host
        .request(json!({
            "id": 3,
            "method": "handler.addTrack",
            "internal": { "handlerId": "h1" },
            "data": { "localId": "mic", "kind": "audio", "playerId": "p1" }
        }))
        .await;
    assert_eq!(added, json!({ "id": 3, "accepted": true }));

    let offer = host
        .request(json!({ "id": 4, "method": "handler.createOffer", "internal": { "handlerId": "h1" } }))
        .await;
    assert_eq!(offer["data"]["type"], "offer");
    assert!(offer["data"]["sdp"].as_str().unwrap().contains("m=audio"));

    let mid = host
        .request(json!({
            "id": 5,
            "method": "handler.getMid",
            "internal": { "handlerId": "h1" },
            "data": { "localId": "mic" }
        }))
        .await;
    assert_eq!(mid, json!({ "id": 5, "accepted": true, "data": "0" }));

    host.send(json!({
        "event": "player.stopTrack",
        "internal": { "playerId": "p1" },
        "data": { "kind": "audio" }
    }))
    .await;
    let dump = host.request(json!({ "id": 6, "method": "dump" })).await;
    assert_eq!(dump["data"]["players"][0]["audioTrack"]["readyState"], "ended");
    assert_eq!(dump["data"]["players"][0]["videoTrack"]["readyState"], "live");
    assert_eq!(
        dump["data"]["handlers"][0]["sendTransceivers"],
        json!([{ "localId": "mic", "mid": "0" }])
    );
}

#[tokio::test]
async fn rtp_capabilities_is_an_sdp_string() {
    let mut host = support::start();
    let response = host
        .request(json!({ "id": 1, "method": "getRtpCapabilities" }))
        .await;
    let sdp = response["data"].as_str().unwrap();
    assert!(sdp.starts_with("v=0"));
    assert!(sdp.contains("m=video"));

    let (_, engine, _) = host.disconnect().await;
    assert_eq!(engine.connections_closed(), 1);
}
