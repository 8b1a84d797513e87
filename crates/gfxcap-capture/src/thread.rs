//! Per-thread capture state and the process-wide thread-id registry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use gfxcap_format::{ApiCallId, ThreadId};

use crate::encoder::ParameterEncoder;

/// Maps OS thread identities to dense small ids starting at 1. Ids are
/// stable for the process lifetime; the map is never pruned.
struct ThreadIdRegistry {
    next: u64,
    ids: HashMap<std::thread::ThreadId, ThreadId>,
}

static REGISTRY: OnceLock<Mutex<ThreadIdRegistry>> = OnceLock::new();

fn registry() -> &'static Mutex<ThreadIdRegistry> {
    REGISTRY.get_or_init(|| {
        Mutex::new(ThreadIdRegistry {
            next: 0,
            ids: HashMap::new(),
        })
    })
}

fn assign_thread_id() -> ThreadId {
    let mut registry = registry().lock().unwrap();
    let os_id = std::thread::current().id();
    if let Some(id) = registry.ids.get(&os_id) {
        return *id;
    }
    registry.next += 1;
    let id = registry.next;
    registry.ids.insert(os_id, id);
    id
}

/// State owned by one thread: its stable id, the id of the call currently
/// being encoded, the primary parameter buffer (inside the encoder) and the
/// scratch buffer for compression. The compressed buffer's contents are only
/// meaningful for the duration of a single write.
pub(crate) struct ThreadData {
    pub thread_id: ThreadId,
    pub call_id: ApiCallId,
    pub encoder: ParameterEncoder,
    pub compressed: Vec<u8>,
}

impl ThreadData {
    fn new() -> Self {
        Self {
            thread_id: assign_thread_id(),
            call_id: ApiCallId::UNKNOWN,
            encoder: ParameterEncoder::new(),
            compressed: Vec::new(),
        }
    }
}

thread_local! {
    static THREAD_DATA: RefCell<ThreadData> = RefCell::new(ThreadData::new());
}

pub(crate) fn with_thread_data<R>(f: impl FnOnce(&mut ThreadData) -> R) -> R {
    THREAD_DATA.with(|data| f(&mut data.borrow_mut()))
}

/// The calling thread's stable capture id, assigned on first touch.
pub fn current_thread_id() -> ThreadId {
    with_thread_data(|data| data.thread_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_per_thread() {
        let first = current_thread_id();
        let second = current_thread_id();
        assert_eq!(first, second);
    }

    #[test]
    fn spawned_threads_get_distinct_ids() {
        let mine = current_thread_id();
        let theirs = std::thread::spawn(current_thread_id).join().unwrap();
        let theirs_again = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(mine, theirs);
        assert_ne!(mine, theirs_again);
        assert_ne!(theirs, theirs_again);
        assert!(mine >= 1 && theirs >= 1);
    }
}
