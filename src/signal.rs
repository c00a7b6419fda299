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

use tokio::sync::mpsc;

use crate::drain::DrainWatcher;

/// Shutdown completes once the process receives SIGINT or SIGTERM, or once any
/// [ShutdownTrigger] fires (for example when an offline capture reaches end of file).
pub struct Shutdown {
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Shutdown {
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Returns a handle that can request a shutdown from anywhere, including blocking threads.
    pub fn trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Waits for a signal or a trigger.
    pub async fn wait(mut self) {
        imp::shutdown(&mut self.shutdown_rx).await
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
    shutdown_tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
    /// Requests a shutdown. Requests after the first are no-ops.
    pub fn shutdown_now(&self) {
        let _ = self.shutdown_tx.try_send(());
    }
}

/// Switches verbose logging on or off each time the process receives SIGUSR1, until `drain` is
/// signaled. Without SIGUSR1 it only waits for the drain.
pub async fn toggle_verbose_logging(drain: DrainWatcher) {
    imp::toggle_verbose_logging(&drain).await
}

#[cfg(unix)]
mod imp {
    use tokio::signal::unix::{SignalKind, signal};
    use tokio::sync::mpsc::Receiver;
    use tracing::{info, warn};

    use crate::drain::DrainWatcher;
    use crate::telemetry;

    pub(super) async fn shutdown(receiver: &mut Receiver<()>) {
        tokio::select! {
            () = watch_signal(SignalKind::interrupt(), "SIGINT") => {}
            () = watch_signal(SignalKind::terminate(), "SIGTERM") => {}
            _ = receiver.recv() => {
                info!("received explicit shutdown signal")
            }
        };
    }

    async fn watch_signal(kind: SignalKind, name: &'static str) {
        signal(kind)
            .expect("Failed to register signal handler")
            .recv()
            .await;
        info!("received signal {}, starting shutdown", name,);
    }

    pub(super) async fn toggle_verbose_logging(drain: &DrainWatcher) {
        let mut usr1 =
            signal(SignalKind::user_defined1()).expect("Failed to register signal handler");
        loop {
            tokio::select! {
                biased;
                _ = drain.signaled() => return,
                received = usr1.recv() => {
                    if received.is_none() {
                        return;
                    }
                    match telemetry::toggle_verbose() {
                        Ok(verbose) => info!(verbose, "received SIGUSR1, toggled verbose logging"),
                        Err(e) => warn!("failed to toggle verbose logging: {e}"),
                    }
                }
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use tokio::sync::mpsc::Receiver;
    use tracing::info;

    use crate::drain::DrainWatcher;

    pub(super) async fn toggle_verbose_logging(drain: &DrainWatcher) {
        drain.signaled().await;
    }

    pub(super) async fn shutdown(receiver: &mut Receiver<()>) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, starting shutdown")
            }
            _ = receiver.recv() => {
                info!("received explicit shutdown signal")
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn trigger_completes_wait() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.trigger();
        let blocking = trigger.clone();
        tokio::task::spawn_blocking(move || {
            blocking.shutdown_now();
            blocking.shutdown_now();
        })
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(5), shutdown.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn verbose_toggle_releases_drain() {
        let (trigger, drain) = crate::drain::new();
        let task = tokio::spawn(toggle_verbose_logging(drain));
        tokio::time::timeout(
            Duration::from_secs(5),
            trigger.start_drain_and_wait(crate::drain::DrainMode::Graceful),
        )
        .await
        .unwrap();
        task.await.unwrap();
    }
}
