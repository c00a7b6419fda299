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

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span};

use crate::analyzer::Analyzer;
use crate::config::QueueFullPolicy;
use crate::drain::DrainWatcher;
use crate::metrics::IncrementRecorder;
use crate::metrics::pipeline::{Metrics, QueueDrop};
use crate::packet::CaptureRecord;

/// The workers have stopped and no longer accept records.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("analyzer queue is closed")]
pub struct QueueClosed;

/// Dispatcher is the capture side of the bounded queue in front of the analyzer workers.
/// Dropping it closes the queue; workers finish what is queued and exit.
pub struct Dispatcher {
    tx: mpsc::Sender<CaptureRecord>,
    policy: QueueFullPolicy,
    metrics: Arc<Metrics>,
}

/// The worker side of the queue.
pub struct Queue {
    rx: mpsc::Receiver<CaptureRecord>,
}

pub fn channel(
    capacity: usize,
    policy: QueueFullPolicy,
    metrics: Arc<Metrics>,
) -> (Dispatcher, Queue) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        Dispatcher {
            tx,
            policy,
            metrics,
        },
        Queue { rx },
    )
}

impl Dispatcher {
    /// Queues a record. Must be called from a blocking thread, since the `Block` policy parks the
    /// caller until a worker makes room.
    pub fn submit(&self, record: CaptureRecord) -> Result<(), QueueClosed> {
        match self.policy {
            QueueFullPolicy::Block => self.tx.blocking_send(record).map_err(|_| QueueClosed),
            QueueFullPolicy::DropNewest => match self.tx.try_send(record) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(record)) => {
                    debug!(%record, "analyzer queue full, dropping record");
                    self.metrics.increment(&QueueDrop);
                    Ok(())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueClosed),
            },
        }
    }

    pub fn policy(&self) -> QueueFullPolicy {
        self.policy
    }
}

impl Queue {
    /// Starts `workers` analyzer tasks. Each holds `drain` until the queue is closed and empty.
    pub fn spawn_workers(
        self,
        analyzer: Analyzer,
        workers: usize,
        drain: DrainWatcher,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(self.rx));
        (0..workers)
            .map(|id| {
                tokio::spawn(
                    worker(rx.clone(), analyzer.clone(), drain.clone())
                        .instrument(info_span!("analyzer", id)),
                )
            })
            .collect()
    }
}

async fn worker(
    rx: Arc<Mutex<mpsc::Receiver<CaptureRecord>>>,
    analyzer: Analyzer,
    _drain: DrainWatcher,
) {
    let mut analyzed = 0u64;
    loop {
        let next = rx.lock().await.recv().await;
        let Some(record) = next else {
            break;
        };
        analyzer.analyze(record);
        analyzed += 1;
    }
    debug!(analyzed, "analyzer worker finished");
}
