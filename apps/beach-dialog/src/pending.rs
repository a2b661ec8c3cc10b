use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::engine::{MediaKind, TrackRef};
use crate::error::DialogError;

type Waiter = oneshot::Sender<Result<TrackRef, DialogError>>;

/// Outcome of asking for a remote track.
pub enum PendingTrack {
    Ready(TrackRef),
    Waiting(oneshot::Receiver<Result<TrackRef, DialogError>>),
}

impl PendingTrack {
    pub async fn wait(self) -> Result<TrackRef, DialogError> {
        match self {
            PendingTrack::Ready(track) => Ok(track),
            PendingTrack::Waiting(rx) => rx.await.unwrap_or(Err(DialogError::SessionClosed)),
        }
    }
}

/// Callers waiting for "the `kind` track of peer X" before it exists.
///
/// Several requests for the same (peer, kind) queue up in arrival order and
/// are all resolved, each once, by the first matching track.
#[derive(Default)]
pub struct PendingMediaRequests {
    peers: Mutex<HashMap<String, HashMap<MediaKind, Vec<Waiter>>>>,
}

impl PendingMediaRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest unless `lookup` already finds the track. `lookup`
    /// runs under the registry lock, so a track activated concurrently is
    /// either seen here or resolves the new waiter.
    pub fn register<F>(&self, peer_id: &str, kind: MediaKind, lookup: F) -> PendingTrack
    where
        F: FnOnce() -> Option<TrackRef>,
    {
        let mut peers = self.peers.lock();
        if let Some(track) = lookup() {
            return PendingTrack::Ready(track);
        }
        let (tx, rx) = oneshot::channel();
        let waiters = peers
            .entry(peer_id.to_string())
            .or_default()
            .entry(kind)
            .or_default();
        waiters.retain(|waiter| !waiter.is_closed());
        waiters.push(tx);
        tracing::debug!(
            target: "dialog::consumer",
            peer_id,
            kind = %kind,
            queued = waiters.len(),
            "media request pending"
        );
        PendingTrack::Waiting(rx)
    }

    /// Hands `track` to every waiter for (peer, kind) and drops the entry.
    /// Returns how many live waiters received it.
    pub fn resolve(&self, peer_id: &str, kind: MediaKind, track: &TrackRef) -> usize {
        let waiters = {
            let mut peers = self.peers.lock();
            let Some(kinds) = peers.get_mut(peer_id) else {
                return 0;
            };
            let waiters = kinds.remove(&kind).unwrap_or_default();
            if kinds.is_empty() {
                peers.remove(peer_id);
            }
            waiters
        };
        waiters
            .into_iter()
            .filter_map(|waiter| waiter.send(Ok(track.clone())).ok())
            .count()
    }

    /// Fails every outstanding request.
    pub fn fail_all<F>(&self, error: F)
    where
        F: Fn() -> DialogError,
    {
        let peers: Vec<_> = self.peers.lock().drain().collect();
        for (_, kinds) in peers {
            for (_, waiters) in kinds {
                for waiter in waiters {
                    let _ = waiter.send(Err(error()));
                }
            }
        }
    }

    pub fn outstanding(&self, peer_id: &str, kind: MediaKind) -> usize {
        self.peers
            .lock()
            .get(peer_id)
            .and_then(|kinds| kinds.get(&kind))
            .map_or(0, |waiters| waiters.iter().filter(|w| !w.is_closed()).count())
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.lock().contains_key(peer_id)
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}
