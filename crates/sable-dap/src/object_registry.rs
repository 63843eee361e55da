//! Handle registry bridging the stateless wire protocol to the live heap.
//!
//! Every `variablesReference` handed to the client maps to an entry here.
//! Object entries observe their referent weakly and are re-validated against
//! the host on every lookup; scope entries are (thread, frame) pairs that go
//! stale on their own when the frame is popped. Ids are never reused while
//! the registry lives.

use sable_host::{HostRuntime, ObjectId, ThreadId};

/// First id handed out. Keeps clear distance from the small integers DAP
/// clients commonly special-case, while staying in `i32` range (many clients
/// parse `variablesReference` as `i32`).
const FIRST_REF_ID: i64 = 1000;

#[derive(Clone, Debug, PartialEq)]
pub enum Referent {
    /// Weak (optionally promoted) reference to a heap object.
    Object { object: ObjectId, strong: bool },
    /// The locals of one paused call frame.
    Scope { thread: ThreadId, frame: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Resolved {
    Object(ObjectId),
    Scope { thread: ThreadId, frame: usize },
    Invalid,
}

#[derive(Clone, Debug)]
struct RefEntry {
    id: i64,
    referent: Referent,
}

pub struct ObjectRefRegistry {
    next_id: i64,
    entries: Vec<RefEntry>,
    max_weak: usize,
}

impl ObjectRefRegistry {
    pub fn new(max_weak: usize) -> Self {
        Self {
            next_id: FIRST_REF_ID,
            entries: Vec::new(),
            max_weak,
        }
    }

    fn alloc(&mut self, referent: Referent) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(RefEntry { id, referent });
        id
    }

    /// Register `object` and return its id, deduplicating by identity.
    ///
    /// `strong` takes an owning hold on the referent; it is meant only for
    /// ephemeral computed values with no other owner. Asking for a strong
    /// ref to an already-tracked weak object promotes the existing entry.
    pub fn to_ref<H: HostRuntime>(&mut self, host: &mut H, object: ObjectId, strong: bool) -> i64 {
        if let Some(entry) = self.entries.iter_mut().find(
            |e| matches!(e.referent, Referent::Object { object: o, .. } if o == object),
        ) {
            if strong {
                if let Referent::Object { strong: held, .. } = &mut entry.referent {
                    if !*held && host.retain_object(object).is_ok() {
                        *held = true;
                    }
                }
            }
            return entry.id;
        }

        let strong = strong && host.retain_object(object).is_ok();
        let id = self.alloc(Referent::Object { object, strong });
        if self.entries.len() > self.max_weak {
            self.prune_dead(host);
        }
        id
    }

    pub fn to_scope_ref(&mut self, thread: ThreadId, frame: usize) -> i64 {
        if let Some(entry) = self.entries.iter().find(|e| {
            e.referent == Referent::Scope { thread, frame }
        }) {
            return entry.id;
        }
        self.alloc(Referent::Scope { thread, frame })
    }

    /// Look `id` up, re-validating weak liveness. Dead entries are pruned on
    /// access and report [`Resolved::Invalid`]; so do unknown ids.
    pub fn resolve<H: HostRuntime>(&mut self, host: &mut H, id: i64) -> Resolved {
        let Some(pos) = self.entries.iter().position(|e| e.id == id) else {
            return Resolved::Invalid;
        };
        match self.entries[pos].referent.clone() {
            Referent::Object { object, strong } => {
                if host.is_object_live(object) {
                    Resolved::Object(object)
                } else {
                    // A dead strong entry means the host collected behind our
                    // hold; drop the bookkeeping either way.
                    if strong {
                        let _ = host.release_object(object);
                    }
                    self.entries.remove(pos);
                    Resolved::Invalid
                }
            }
            Referent::Scope { thread, frame } => {
                if frame < host.call_depth(thread) {
                    Resolved::Scope { thread, frame }
                } else {
                    Resolved::Invalid
                }
            }
        }
    }

    /// Episode teardown on resume: drop every non-scope entry that is not
    /// strongly retained. Scope entries stay and invalidate themselves when
    /// their frame disappears.
    pub fn release_unretained(&mut self) {
        self.entries.retain(|e| {
            !matches!(e.referent, Referent::Object { strong: false, .. })
        });
    }

    /// Full teardown: release strong holds and forget everything.
    pub fn clear<H: HostRuntime>(&mut self, host: &mut H) {
        for entry in self.entries.drain(..) {
            if let Referent::Object {
                object,
                strong: true,
            } = entry.referent
            {
                let _ = host.release_object(object);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune_dead<H: HostRuntime>(&mut self, host: &H) {
        self.entries.retain(|e| match e.referent {
            Referent::Object { object, strong } => strong || host.is_object_live(object),
            Referent::Scope { .. } => true,
        });
    }
}
