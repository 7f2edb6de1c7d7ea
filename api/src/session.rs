use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use frame_relay_common::cache::LatestFrameCache;
use frame_relay_common::config::{AbsentPolicy, RepeatPolicy, StreamConfig};
use frame_relay_common::frame::encode_part;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Body chunks flowing from a session to the HTTP response.
pub type ChunkSender = mpsc::Sender<Result<Bytes, Infallible>>;

/// How every session samples the cache.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub interval: Duration,
    pub boundary: String,
    pub on_absent: AbsentPolicy,
    pub on_repeat: RepeatPolicy,
}

impl SessionPolicy {
    pub fn from_config(stream: &StreamConfig) -> Self {
        Self {
            interval: stream.frame_interval(),
            boundary: stream.boundary.clone(),
            on_absent: stream.on_absent,
            on_repeat: stream.on_repeat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Streaming,
    /// The client went away (write failed or the body was dropped).
    Disconnected,
    /// The server asked the session to stop.
    Cancelled,
}

/// One client's view of a source.
///
/// Each session keeps its own `last_sequence_served` and its own clock, so a
/// slow client only ever delays itself. The cache is sampled only once the
/// client has room for a part, so intermediate frames are dropped and a
/// stalled client resumes with the newest one.
pub struct StreamSession {
    id: u64,
    source: String,
    cache: Arc<LatestFrameCache>,
    policy: Arc<SessionPolicy>,
    /// Pre-encoded multipart part for the "no frame" image.
    placeholder: Bytes,
    cancel: CancellationToken,
    state: SessionState,
    last_sequence_served: Option<u64>,
    parts_sent: u64,
}

impl StreamSession {
    pub fn new(
        id: u64,
        source: impl Into<String>,
        cache: Arc<LatestFrameCache>,
        policy: Arc<SessionPolicy>,
        placeholder: Bytes,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            source: source.into(),
            cache,
            policy,
            placeholder,
            cancel,
            state: SessionState::Connected,
            last_sequence_served: None,
            parts_sent: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Stream until the client disconnects or the session is cancelled.
    /// Returns the terminal state.
    pub async fn run(mut self, tx: ChunkSender) -> SessionState {
        self.state = SessionState::Streaming;
        debug!(session = self.id, source = %self.source, "session streaming");

        let mut ticker = tokio::time::interval(self.policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.finish(SessionState::Cancelled),
                _ = tx.closed() => return self.finish(SessionState::Disconnected),
                _ = ticker.tick() => {}
            }

            // Wait for room before sampling, so a slow client is handed the
            // newest frame at the moment it can take one.
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.finish(SessionState::Cancelled),
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return self.finish(SessionState::Disconnected),
                },
            };

            let Some(part) = self.next_part() else {
                continue;
            };
            permit.send(Ok(part));
            self.parts_sent += 1;
        }
    }

    /// The part to write on this tick, if any.
    fn next_part(&mut self) -> Option<Bytes> {
        let Some(frame) = self.cache.read() else {
            return match self.policy.on_absent {
                AbsentPolicy::Placeholder => {
                    // The client now shows the placeholder, so the next real
                    // frame must be written even if its sequence was seen.
                    self.last_sequence_served = None;
                    Some(self.placeholder.clone())
                }
                AbsentPolicy::Skip => None,
            };
        };

        let seq = frame.sequence();
        if self.last_sequence_served == Some(seq) && self.policy.on_repeat == RepeatPolicy::Skip {
            return None;
        }
        self.last_sequence_served = Some(seq);
        Some(encode_part(&self.policy.boundary, frame.payload()))
    }

    fn finish(&mut self, state: SessionState) -> SessionState {
        self.state = state;
        info!(
            session = self.id,
            source = %self.source,
            state = ?state,
            parts_sent = self.parts_sent,
            last_seq = self.last_sequence_served,
            "session ended"
        );
        state
    }
}
