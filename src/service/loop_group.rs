use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;

use crate::service::command::Command;

/// Sending side of one event loop.
pub(crate) struct LoopHandle {
    pub(crate) idx: usize,
    pub(crate) tx: mpsc::Sender<Command>,
}

/// Fixed, immutable array of loops with a monotonically increasing dispatch
/// counter. Selection is per-accept, so a TCP connection stays on one loop
/// for its whole lifetime.
pub(crate) struct LoopGroup {
    loops: Vec<LoopHandle>,
    counter: AtomicUsize,
}

impl LoopGroup {
    pub(crate) fn new() -> Self {
        LoopGroup {
            loops: Vec::new(),
            counter: AtomicUsize::new(0),
        }
    }

    pub(crate) fn register(&mut self, handle: LoopHandle) {
        self.loops.push(handle);
    }

    pub(crate) fn len(&self) -> usize {
        self.loops.len()
    }

    pub(crate) fn next(&self) -> &LoopHandle {
        let i = self.counter.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        &self.loops[i]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &LoopHandle> {
        self.loops.iter()
    }
}
