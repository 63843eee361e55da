//! Stable small-integer ids for (thread, native-frame) pairs.
//!
//! The table is append-only and deduplicated by linear scan, so repeated
//! `stackTrace` requests over an unchanged stack hand out identical ids.
//! Entries are never removed before teardown; staleness is detected at
//! resolve time by checking the recorded index against the thread's current
//! depth.

use sable_host::{HostRuntime, ThreadId};

#[derive(Default)]
pub struct FrameIdentityMap {
    entries: Vec<(ThreadId, usize)>,
}

impl FrameIdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_frame_id(&mut self, thread: ThreadId, frame: usize) -> i64 {
        if let Some(pos) = self.entries.iter().position(|&e| e == (thread, frame)) {
            return pos as i64 + 1;
        }
        self.entries.push((thread, frame));
        self.entries.len() as i64
    }

    pub fn resolve<H: HostRuntime>(&self, host: &H, id: i64) -> Option<(ThreadId, usize)> {
        let index = usize::try_from(id.checked_sub(1)?).ok()?;
        let &(thread, frame) = self.entries.get(index)?;
        if frame < host.call_depth(thread) {
            Some((thread, frame))
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
