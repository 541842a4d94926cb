//! Session pairing state and the registry tracking in-flight sessions.

use std::mem;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::util::PeekReader;

/// Reader over the decoded-body side of the upload POST.
pub(crate) type UploadReader = BufReader<PeekReader<OwnedReadHalf>>;
/// Raw response socket of the download GET, positioned after the head.
pub(crate) type DownloadWriter = OwnedWriteHalf;

/// Marker error for a second attach attempt on the same half.
#[derive(Debug)]
pub(crate) struct DuplicateHalf;

/// Both stream ends of a completed pair, handed to the bridge.
pub(crate) struct BridgeEnds {
    pub(crate) up: UploadReader,
    pub(crate) down: DownloadWriter,
}

enum Slot<T> {
    Vacant,
    /// The half passed its duplicate check and is about to attach.
    Claimed,
    Attached(T),
}

impl<T> Slot<T> {
    fn is_vacant(&self) -> bool {
        matches!(self, Slot::Vacant)
    }

    fn is_attached(&self) -> bool {
        matches!(self, Slot::Attached(_))
    }

    fn take(&mut self) -> Option<T> {
        match mem::replace(self, Slot::Claimed) {
            Slot::Attached(value) => Some(value),
            other => {
                *self = other;
                None
            }
        }
    }
}

struct Halves {
    up: Slot<UploadReader>,
    down: Slot<DownloadWriter>,
    activated_at: Option<Instant>,
    bridged: bool,
}

/// One pairing of an upload POST and a download GET.
///
/// The half slots live behind a short critical section that is never held
/// across a suspension point; readiness is evaluated under the same lock that
/// installs each half, so the pair completes in exactly one attach call.
pub(crate) struct Session {
    id: String,
    halves: Mutex<Halves>,
    done: CancellationToken,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            halves: Mutex::new(Halves {
                up: Slot::Vacant,
                down: Slot::Vacant,
                activated_at: None,
                bridged: false,
            }),
            done: CancellationToken::new(),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// The one-shot termination signal both handlers and pumps observe.
    pub(crate) fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Fires the termination signal; safe to call any number of times.
    pub(crate) fn terminate(&self) {
        self.done.cancel();
    }

    /// Reserves the upload half, recording activation on the first claim.
    pub(crate) fn claim_up(&self) -> Result<(), DuplicateHalf> {
        let mut halves = self.halves.lock().unwrap();
        if !halves.up.is_vacant() {
            return Err(DuplicateHalf);
        }
        halves.up = Slot::Claimed;
        halves.activated_at.get_or_insert_with(Instant::now);
        Ok(())
    }

    /// Reserves the download half, recording activation on the first claim.
    pub(crate) fn claim_down(&self) -> Result<(), DuplicateHalf> {
        let mut halves = self.halves.lock().unwrap();
        if !halves.down.is_vacant() {
            return Err(DuplicateHalf);
        }
        halves.down = Slot::Claimed;
        halves.activated_at.get_or_insert_with(Instant::now);
        Ok(())
    }

    /// Installs the upload reader. Returns both ends when this attach
    /// completes the pair; the caller must start the bridge exactly then.
    pub(crate) fn attach_up(&self, reader: UploadReader) -> Option<BridgeEnds> {
        let mut halves = self.halves.lock().unwrap();
        halves.up = Slot::Attached(reader);
        Self::complete_pair(&mut halves)
    }

    /// Installs the download writer; see [`Session::attach_up`].
    pub(crate) fn attach_down(&self, writer: DownloadWriter) -> Option<BridgeEnds> {
        let mut halves = self.halves.lock().unwrap();
        halves.down = Slot::Attached(writer);
        Self::complete_pair(&mut halves)
    }

    /// Gives the download writer back when the pair never bridged, so the
    /// handler can still terminate the chunked response body.
    pub(crate) fn reclaim_down(&self) -> Option<DownloadWriter> {
        let mut halves = self.halves.lock().unwrap();
        if halves.bridged {
            return None;
        }
        halves.down.take()
    }

    fn complete_pair(halves: &mut Halves) -> Option<BridgeEnds> {
        if halves.bridged || !halves.up.is_attached() || !halves.down.is_attached() {
            return None;
        }
        // The pair moves out; the slots stay claimed so any later attach
        // attempt keeps failing its duplicate check.
        halves.bridged = true;
        match (halves.up.take(), halves.down.take()) {
            (Some(up), Some(down)) => Some(BridgeEnds { up, down }),
            _ => None,
        }
    }

    /// Whether the sweeper should reap this session.
    fn expired(&self, timeout: Duration) -> bool {
        let halves = self.halves.lock().unwrap();
        if halves.bridged {
            return false;
        }
        match halves.activated_at {
            Some(activated_at) => activated_at.elapsed() > timeout,
            None => false,
        }
    }
}

/// Concurrent map of in-flight sessions.
pub(crate) struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Finds the session for `id` or creates it. Linearizable: concurrent
    /// calls with the same id observe the same instance.
    pub(crate) fn find_or_create(&self, id: &str) -> Arc<Session> {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Session::new(id.to_string())))
            .clone()
    }

    /// Removes this exact session. Duplicate removal is harmless, and a
    /// fresh session that reused the id is left alone.
    pub(crate) fn remove(&self, session: &Arc<Session>) {
        self.sessions
            .remove_if(session.id(), |_, extant| Arc::ptr_eq(extant, session));
    }

    /// Reaps sessions that sat less than fully paired longer than `timeout`.
    pub(crate) fn sweep(&self, timeout: Duration) {
        let expired: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().expired(timeout))
            .map(|entry| entry.value().clone())
            .collect();
        for session in expired {
            warn!(session_id = %session.id(), "session timeout");
            session.terminate();
            self.remove(&session);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}
