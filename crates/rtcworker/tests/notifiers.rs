mod support;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;

fn create_data_channel(id: u32, handler: &str, data_channel: &str) -> Value {
    json!({
        "id": id,
        "method": "handler.createDataChannel",
        "internal": { "handlerId": handler, "dataChannelId": data_channel },
        "data": { "label": data_channel }
    })
}

async fn negotiate(host: &mut support::Host, offerer: &str, answerer: &str) {
    let offer = host
        .request(json!({ "id": "o1", "method": "handler.createOffer", "internal": { "handlerId": offerer } }))
        .await;
    host.request(json!({
        "id": "o2",
        "method": "handler.setLocalDescription",
        "internal": { "handlerId": offerer },
        "data": offer["data"]
    }))
    .await;
    host.request(json!({
        "id": "a1",
        "method": "handler.setRemoteDescription",
        "internal": { "handlerId": answerer },
        "data": offer["data"]
    }))
    .await;
    let answer = host
        .request(json!({ "id": "a2", "method": "handler.createAnswer", "internal": { "handlerId": answerer } }))
        .await;
    assert_eq!(answer["data"]["type"], "answer");
    host.request(json!({
        "id": "a3",
        "method": "handler.setLocalDescription",
        "internal": { "handlerId": answerer },
        "data": answer["data"]
    }))
    .await;
    let done = host
        .request(json!({
            "id": "o3",
            "method": "handler.setRemoteDescription",
            "internal": { "handlerId": offerer },
            "data": answer["data"]
        }))
        .await;
    assert_eq!(done["accepted"], true);
}

#[tokio::test(start_paused = true)]
async fn buffered_amount_is_sampled_every_interval() {
    let mut host = support::start_with(Duration::from_millis(500));
    host.request(json!({ "id": 1, "method": "createHandler", "internal": { "handlerId": "h1" } }))
        .await;
    let created = host.request(create_data_channel(2, "h1", "d1")).await;
    assert_eq!(created["data"]["readyState"], "connecting");

    let started = Instant::now();
    let first = host.notification(&json!("d1"), "bufferedamount").await;
    assert_eq!(first["data"], 0);
    host.notification(&json!("d1"), "bufferedamount").await;
    assert!(started.elapsed() >= Duration::from_millis(500));

    host.send(json!({ "event": "handler.close", "internal": { "handlerId": "h1" } }))
        .await;
    host.request(json!({ "id": 3, "method": "dump" })).await;
    host.clear_pending();

    tokio::time::sleep(Duration::from_secs(5)).await;
    let (_, _, rest) = host.disconnect().await;
    assert!(
        rest.iter().all(|message| message.get("targetId") != Some(&json!("d1"))),
        "closed handler kept reporting: {rest:?}"
    );
}

#[tokio::test]
async fn data_channel_events_reach_the_host() {
    let mut host = support::start();
    for (id, handler) in [(1, "h1"), (2, "h2")] {
        host.request(json!({ "id": id, "method": "createHandler", "internal": { "handlerId": handler } }))
            .await;
    }
    let created = host.request(create_data_channel(3, "h1", "chat")).await;
    assert_eq!(created["data"]["streamId"], 0);
    assert_eq!(created["data"]["ordered"], true);

    negotiate(&mut host, "h1", "h2").await;
    host.notification(&json!("chat"), "open").await;

    let internal = json!({ "handlerId": "h1", "dataChannelId": "chat" });
    host.send(json!({ "event": "datachannel.send", "internal": internal, "data": "hello" }))
        .await;
    let amount = host.notification(&json!("chat"), "bufferedamount").await;
    assert_eq!(amount["data"], 5);

    host.send(json!({ "event": "datachannel.sendBinary", "internal": internal, "data": "AAEC" }))
        .await;
    let amount = host.notification(&json!("chat"), "bufferedamount").await;
    assert_eq!(amount["data"], 8);

    host.engine.drain_data_channels();
    let text = host.notification(&json!("chat"), "message").await;
    assert_eq!(text["data"], "hello");
    let binary = host.notification(&json!("chat"), "binary").await;
    assert_eq!(binary["data"], "AAEC");
    host.notification(&json!("chat"), "bufferedamountlow").await;

    // A close the host asked for is not echoed back, and repeating it is harmless.
    host.send(json!({ "event": "datachannel.close", "internal": internal })).await;
    host.send(json!({ "event": "datachannel.close", "internal": internal })).await;
    let dump = host.request(json!({ "id": 9, "method": "dump" })).await;
    assert_eq!(dump["data"]["handlers"][0]["dataChannels"], json!([]));

    let (_, _, rest) = host.disconnect().await;
    assert!(
        rest.iter()
            .all(|message| message["targetId"] != "chat" || message["event"] == "bufferedamount"),
        "closed data channel still reported: {rest:?}"
    );
}

#[tokio::test]
async fn connection_state_changes_are_forwarded() {
    let mut host = support::start();
    for (id, handler) in [(1, "h1"), (2, "h2")] {
        host.request(json!({ "id": id, "method": "createHandler", "internal": { "handlerId": handler } }))
            .await;
    }
    negotiate(&mut host, "h1", "h2").await;

    let seen = host
        .until(|message| message["targetId"] == "h1" && message["data"] == "connected")
        .await;
    let states = |target: &str, event: &str| -> Vec<Value> {
        seen.iter()
            .filter(|message| message["targetId"] == target && message["event"] == event)
            .map(|message| message["data"].clone())
            .collect()
    };

    assert_eq!(
        states("h1", "signalingstatechange"),
        [json!("have-local-offer"), json!("stable")]
    );
    assert_eq!(
        states("h1", "icegatheringstatechange"),
        [json!("gathering"), json!("complete")]
    );
    assert_eq!(
        states("h1", "iceconnectionstatechange"),
        [json!("checking"), json!("connected")]
    );
    assert_eq!(
        states("h2", "signalingstatechange"),
        [json!("have-remote-offer"), json!("stable")]
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_writers_keep_frames_whole() {
    let mut host = support::start_with(Duration::from_millis(1));
    host.request(json!({ "id": 0, "method": "createHandler", "internal": { "handlerId": "h1" } }))
        .await;
    for n in 0..4u32 {
        host.request(create_data_channel(100 + n, "h1", &format!("d{n}")))
            .await;
    }

    for id in 1..=50u32 {
        host.send(json!({ "id": id, "method": "dump" })).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let mut responses = Vec::new();
    let mut samples = 0usize;
    while responses.len() < 50 {
        let message = host.next().await.unwrap();
        if message.get("id").is_some() {
            responses.push(message["id"].clone());
        } else if message["event"] == "bufferedamount" {
            samples += 1;
        }
    }
    assert_eq!(responses, (1..=50u32).map(Value::from).collect::<Vec<_>>());
    assert!(samples > 0);
}
