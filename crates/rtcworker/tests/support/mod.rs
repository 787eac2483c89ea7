#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rtcworker::engine::LoopbackEngine;
use rtcworker::frame::NetstringCodec;
use rtcworker::transport::Endpoints;
use rtcworker::{Worker, WorkerSettings};
use serde_json::Value;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

pub const PID: u32 = 777;

/// The host end of a running worker.
pub struct Host {
    pub engine: Arc<LoopbackEngine>,
    reader: FramedRead<ReadHalf<DuplexStream>, NetstringCodec>,
    writer: Option<WriteHalf<DuplexStream>>,
    pending: VecDeque<Value>,
    run: JoinHandle<(Worker, rtcworker::Result<()>)>,
}

pub fn start() -> Host {
    start_with(Duration::from_secs(1))
}

pub fn start_with(buffered_amount_interval: Duration) -> Host {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    let (worker_reader, worker_writer) = tokio::io::split(local);
    let (host_reader, host_writer) = tokio::io::split(remote);

    let engine = Arc::new(LoopbackEngine::manual());
    let settings = WorkerSettings {
        pid: PID,
        buffered_amount_interval,
        ..WorkerSettings::default()
    };
    let worker = Worker::new(
        Endpoints::from_io(worker_reader, worker_writer),
        engine.clone(),
        settings,
    );
    let run = tokio::spawn(async move {
        let result = worker.run().await;
        (worker, result)
    });

    Host {
        engine,
        reader: FramedRead::new(host_reader, NetstringCodec::new()),
        writer: Some(host_writer),
        pending: VecDeque::new(),
        run,
    }
}

impl Host {
    pub async fn send(&mut self, message: Value) {
        let payload = serde_json::to_vec(&message).unwrap();
        self.send_raw(&rtcworker::frame::encode(&payload)).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let writer = self.writer.as_mut().expect("host already disconnected");
        writer.write_all(bytes).await.unwrap();
    }

    /// Next message from the worker, or `None` once it has closed the channel.
    pub async fn next(&mut self) -> Option<Value> {
        if let Some(message) = self.pending.pop_front() {
            return Some(message);
        }
        let frame = self.reader.next().await?.expect("worker sent a malformed frame");
        Some(serde_json::from_slice(&frame).expect("worker sent invalid JSON"))
    }

    /// Next response. Notifications received meanwhile stay queued.
    pub async fn response(&mut self) -> Value {
        let mut skipped = Vec::new();
        let response = loop {
            let message = self.next().await.expect("worker closed before responding");
            if message.get("id").is_some() {
                break message;
            }
            skipped.push(message);
        };
        for message in skipped.into_iter().rev() {
            self.pending.push_front(message);
        }
        response
    }

    pub async fn request(&mut self, message: Value) -> Value {
        self.send(message).await;
        self.response().await
    }

    /// Every message up to and including the first one matching `found`.
    pub async fn until(&mut self, found: impl Fn(&Value) -> bool) -> Vec<Value> {
        let mut seen = Vec::new();
        loop {
            let message = self
                .next()
                .await
                .expect("worker closed before the expected message");
            let done = found(&message);
            seen.push(message);
            if done {
                return seen;
            }
        }
    }

    /// Skip everything up to the notification `event` for `target`.
    pub async fn notification(&mut self, target: &Value, event: &str) -> Value {
        let mut seen = self
            .until(|message| message.get("targetId") == Some(target) && message["event"] == event)
            .await;
        seen.pop().unwrap_or_default()
    }

    /// Forget queued notifications.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Close the host's write side and collect everything the worker still sends.
    pub async fn disconnect(mut self) -> (Worker, Arc<LoopbackEngine>, Vec<Value>) {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await.unwrap();
        }
        let mut rest = Vec::new();
        while let Some(message) = self.next().await {
            rest.push(message);
        }
        let (worker, result) = self.run.await.unwrap();
        result.expect("worker should stop cleanly");
        (worker, self.engine, rest)
    }
}
