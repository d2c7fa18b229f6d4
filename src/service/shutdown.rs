// Copyright 2025 the eventide authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::service::error::ServerError;

/// One-shot shutdown condition carrying an optional cause. The first signal
/// wins; later calls are no-ops. Any number of tasks may wait.
pub(crate) struct ShutdownCond {
    once: AtomicBool,
    done: AtomicBool,
    cause: Mutex<Option<ServerError>>,
    notify: Notify,
}

impl ShutdownCond {
    pub(crate) fn new() -> Self {
        ShutdownCond {
            once: AtomicBool::new(false),
            done: AtomicBool::new(false),
            cause: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub(crate) fn signal(&self, cause: Option<ServerError>) {
        if self.once.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut slot) = self.cause.lock() {
            *slot = cause;
        }
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.done.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn take_cause(&self) -> Option<ServerError> {
        self.cause.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn first_cause_wins() {
        let cond = ShutdownCond::new();
        cond.signal(Some(ServerError::Accept("boom".to_string())));
        cond.signal(Some(ServerError::Closing));
        cond.wait().await;
        assert!(matches!(cond.take_cause(), Some(ServerError::Accept(_))));
    }

    #[tokio::test]
    async fn releases_waiters_registered_before_and_after() {
        let cond = Arc::new(ShutdownCond::new());
        let early = {
            let cond = Arc::clone(&cond);
            tokio::spawn(async move { cond.wait().await })
        };
        tokio::task::yield_now().await;
        cond.signal(None);
        early.await.unwrap();
        // a waiter arriving after the signal returns immediately
        cond.wait().await;
        assert!(cond.take_cause().is_none());
    }
}
