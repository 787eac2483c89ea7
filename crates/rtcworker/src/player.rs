use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::engine::{MediaEngine, MediaKind, MediaSource, MediaTrack, SourceDescriptor};
use crate::error::{Result, WorkerError};

/// An opened media source and the tracks it produces.
pub struct Player {
    id: String,
    source: MediaSource,
    closed: AtomicBool,
}

impl Player {
    pub async fn open(id: String, engine: &dyn MediaEngine, source: &SourceDescriptor) -> Result<Self> {
        let media = engine.open_source(source).await?;
        debug!(player_id = %id, file = %source.file, "player opened");
        Ok(Self {
            id,
            source: media,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The track of `kind`, if the source produces one.
    pub fn track(&self, kind: MediaKind) -> Result<Arc<dyn MediaTrack>> {
        let track = match kind {
            MediaKind::Audio => self.source.audio.clone(),
            MediaKind::Video => self.source.video.clone(),
        };
        track.ok_or_else(|| {
            WorkerError::Failed(format!(
                "player \"{}\" has no {} track",
                self.id,
                json!(kind).as_str().unwrap_or_default()
            ))
        })
    }

    pub fn stop_track(&self, kind: MediaKind) -> Result<()> {
        self.track(kind)?.stop();
        Ok(())
    }

    /// Stop every track. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for track in self.source.audio.iter().chain(self.source.video.iter()) {
            track.stop();
        }
        debug!(player_id = %self.id, "player closed");
    }

    pub fn dump(&self) -> Value {
        let mut dump = json!({ "id": self.id });
        if let Some(track) = &self.source.audio {
            dump["audioTrack"] = track_dump(track.as_ref());
        }
        if let Some(track) = &self.source.video {
            dump["videoTrack"] = track_dump(track.as_ref());
        }
        dump
    }
}

fn track_dump(track: &dyn MediaTrack) -> Value {
    json!({
        "id": track.id(),
        "kind": track.kind(),
        "readyState": track.ready_state(),
    })
}
