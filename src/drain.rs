// Copyright Istio Authors
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

use std::time::Duration;
use tracing::{debug, warn};

pub use internal::DrainMode;
pub use internal::Signal as DrainTrigger;
pub use internal::Watch as DrainWatcher;

/// New constructs a new pair for draining
/// * DrainTrigger can be used to start a draining sequence and wait for it to complete.
/// * DrainWatcher should be held by every long running component (capture loop, pod watches,
///   analyzer workers). This can be cloned, and a drain will not complete until all outstanding
///   DrainWatchers are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
    let (tx, rx) = internal::channel();
    (tx, rx)
}

/// Signals a drain and waits up to `deadline` for every watcher to be released.
/// Returns false if some component was still holding on when the deadline passed.
pub async fn drain_within(trigger: DrainTrigger, mode: DrainMode, deadline: Duration) -> bool {
    debug!("drain started, waiting {:?} for components to finish", deadline);
    match tokio::time::timeout(deadline, trigger.start_drain_and_wait(mode)).await {
        Ok(()) => {
            debug!("drain complete");
            true
        }
        Err(_) => {
            warn!("drain duration expired with components still running");
            false
        }
    }
}

mod internal {
    use tokio::sync::{mpsc, watch};

    /// Creates a drain channel.
    ///
    /// The `Signal` is used to start a drain, and the `Watch` will be notified
    /// when a drain is signaled.
    pub fn channel() -> (Signal, Watch) {
        let (signal_tx, signal_rx) = watch::channel(None);
        let (drained_tx, drained_rx) = mpsc::channel(1);

        let signal = Signal {
            drained_rx,
            signal_tx,
        };
        let watch = Watch {
            _drained_tx: drained_tx,
            signal_rx,
        };
        (signal, watch)
    }

    enum Never {}

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum DrainMode {
        Immediate,
        Graceful,
    }

    /// Send a drain command to all watchers.
    pub struct Signal {
        drained_rx: mpsc::Receiver<Never>,
        signal_tx: watch::Sender<Option<DrainMode>>,
    }

    /// Watch for a drain command.
    ///
    /// All `Watch` instances must be dropped for a `Signal::start_drain_and_wait` call to
    /// complete.
    #[derive(Clone)]
    pub struct Watch {
        _drained_tx: mpsc::Sender<Never>,
        signal_rx: watch::Receiver<Option<DrainMode>>,
    }

    impl Signal {
        /// Asynchronously signals all watchers to begin draining gracefully and waits for all
        /// handles to be dropped.
        pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
            // Update the state of the signal watch so that all watchers are observe
            // the change.
            let _ = self.signal_tx.send(Some(mode));

            // Wait for all watchers to release their drain handle.
            match self.drained_rx.recv().await {
                None => {}
                Some(n) => match n {},
            }
        }
    }

    impl Watch {
        /// Completes once a drain has been signaled, without giving up this handle. Components
        /// use this in a `select!` and release the handle by returning.
        pub async fn signaled(&self) -> DrainMode {
            let mut rx = self.signal_rx.clone();
            match rx.wait_for(Option::is_some).await {
                Ok(mode) => (*mode).unwrap_or(DrainMode::Immediate),
                Err(_) => DrainMode::Immediate,
            }
        }
    }

    impl std::fmt::Debug for Signal {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Signal").finish_non_exhaustive()
        }
    }

    impl std::fmt::Debug for Watch {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Watch").finish_non_exhaustive()
        }
    }
}
