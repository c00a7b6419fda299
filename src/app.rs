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

use anyhow::Context;
use prometheus_client::registry::Registry;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, warn};

use crate::analyzer::{Analyzer, LineReporter, Reporter};
use crate::capture::{self, PacketSource};
use crate::drain::DrainMode;
use crate::packet::Pipeline;
use crate::state::IdentityStore;
use crate::{config, dispatch, drain, metrics, signal, watch};

pub async fn build(config: config::Config) -> anyhow::Result<Bound> {
    let reporter = Arc::new(LineReporter::stdout(config.output_format));
    build_with_reporter(config, reporter).await
}

pub async fn build_with_reporter(
    config: config::Config,
    reporter: Arc<dyn Reporter>,
) -> anyhow::Result<Bound> {
    let mut registry = Registry::default();
    let sub_registry = metrics::sub_registry(&mut registry);
    metrics::meta::Metrics::new(sub_registry);
    let pipeline_metrics = Arc::new(metrics::pipeline::Metrics::new(sub_registry));
    let watch_metrics = Arc::new(watch::metrics::Metrics::new(sub_registry));

    let shutdown = signal::Shutdown::new();
    // Setup a drain channel. drain_tx is used to trigger a drain, which will complete
    // once all drain_rx handlers are dropped.
    // The capture loop, the pod watches, the analyzer workers and the log level toggle each hold
    // a drain_rx clone.
    let (drain_tx, drain_rx) = drain::new();

    // Open the capture first, so a bad interface fails before any cluster is contacted.
    let source = PacketSource::open(&config.capture).context("open capture")?;

    let store = IdentityStore::new();
    store
        .load_vm_dataset(&config.vm_dataset)
        .context("load vm dataset")?;
    let watchers = watch::bootstrap(
        &config.kube_config_dir,
        &store,
        watch_metrics,
        config.resync_period,
    )
    .await
    .context("start pod watches")?;
    let counts = store.counts();
    info!(
        vms = counts.vms,
        pods = counts.pod_addresses,
        watches = watchers.len(),
        "identity tables ready"
    );

    for watcher in watchers {
        tokio::spawn(watcher.run(drain_rx.clone()).in_current_span());
    }
    tokio::spawn(signal::toggle_verbose_logging(drain_rx.clone()));

    let analyzer = Analyzer::new(store.clone(), reporter, pipeline_metrics.clone());
    let (dispatcher, queue) = dispatch::channel(
        config.queue_capacity,
        config.queue_full_policy,
        pipeline_metrics.clone(),
    );
    let workers = queue.spawn_workers(analyzer, config.workers, drain_rx.clone());
    let capture = source.spawn(
        Pipeline::default(),
        dispatcher,
        pipeline_metrics,
        drain_rx,
        shutdown.trigger(),
    );

    Ok(Bound {
        shutdown,
        store,
        config,
        registry,
        drain_tx,
        capture,
        workers,
    })
}

pub struct Bound {
    pub shutdown: signal::Shutdown,
    pub store: IdentityStore,

    config: config::Config,
    registry: Registry,
    drain_tx: drain::DrainTrigger,
    capture: JoinHandle<Option<capture::Summary>>,
    workers: Vec<JoinHandle<()>>,
}

impl Bound {
    /// Renders the current metrics in the prometheus text format.
    pub fn metrics(&self) -> String {
        metrics::encode(&self.registry).unwrap_or_default()
    }

    /// Waits for a shutdown signal (or the end of an offline capture), then drains every
    /// component. Returns the capture summary when the capture loop finished cleanly.
    pub async fn wait_termination(self) -> anyhow::Result<Option<capture::Summary>> {
        let Bound {
            shutdown,
            config,
            registry,
            drain_tx,
            capture,
            workers,
            ..
        } = self;
        shutdown.wait().await;

        // Start a drain; this will wait for all drain_rx handles to be dropped before completing,
        // allowing queued records to be analyzed.
        // If they take too long, terminate anyways.
        let grace = config.termination_grace_period;
        if drain::drain_within(drain_tx, DrainMode::Graceful, grace).await {
            info!("shutdown completed gracefully");
        } else {
            warn!("graceful shutdown did not complete in {:?}, terminating now", grace);
            for worker in &workers {
                worker.abort();
            }
        }

        let summary = if capture.is_finished() {
            capture.await.unwrap_or_default()
        } else {
            capture.abort();
            None
        };
        match metrics::encode(&registry) {
            Ok(text) => info!("final metrics:\n{}", text.trim_end()),
            Err(e) => warn!("failed to encode metrics: {e}"),
        }
        Ok(summary)
    }
}
