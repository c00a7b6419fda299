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

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::drain::DrainWatcher;
use crate::metrics::{IncrementRecorder, Recorder};
use crate::state::IdentityStore;
use crate::strng::{self, Strng};
use crate::watch::metrics::{Degraded, Metrics, TerminationReason, WatchEvent, WatchTermination};
use crate::watch::{Error, PodEvent, PodSnapshot, PodUpdater};

pub const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
pub const MAX_BACKOFF: Duration = Duration::from_secs(15);
/// Consecutive failed streams after which a source is reported as degraded.
pub const DEGRADED_AFTER: u32 = 5;

pub type EventStream = BoxStream<'static, Result<watcher::Event<Pod>, watcher::Error>>;

/// Opens a fresh pod watch. Every stream starts with a full relist.
pub trait PodEventSource: Send + Sync + 'static {
    fn watch(&self) -> EventStream;
}

impl PodEventSource for Api<Pod> {
    fn watch(&self) -> EventStream {
        watcher(self.clone(), watcher::Config::default()).boxed()
    }
}

/// Lists the kubeconfig files directly inside `dir`, sorted by name. Hidden entries are skipped.
pub fn kubeconfigs(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let config_dir = |source| Error::ConfigDir {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(config_dir)? {
        let path = entry.map_err(config_dir)?.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_none_or(|n| n.starts_with('.'));
        if hidden || !path.is_file() {
            continue;
        }
        paths.push(path);
    }
    paths.sort();
    Ok(paths)
}

/// The name a kubeconfig file is known by in logs and metrics.
pub fn source_name(path: &Path) -> Strng {
    strng::new(
        path.file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_else(|| path.to_string_lossy()),
    )
}

/// Builds a client from a kubeconfig file, using its current context.
pub async fn connect(path: &Path) -> Result<Client, Error> {
    let kubeconfig_error = |source| Error::Kubeconfig {
        path: path.to_path_buf(),
        source,
    };
    let kubeconfig = Kubeconfig::read_from(path).map_err(kubeconfig_error)?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(kubeconfig_error)?;
    Client::try_from(config).map_err(|source| Error::Client {
        path: path.to_path_buf(),
        source,
    })
}

/// Lists every pod in every namespace once.
pub async fn list_pods(client: &Client, path: &Path) -> Result<Vec<PodSnapshot>, Error> {
    let api: Api<Pod> = Api::all(client.clone());
    let pods = api
        .list(&ListParams::default())
        .await
        .map_err(|source| Error::List {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(pods.items.iter().map(PodSnapshot::from).collect())
}

/// Connects to every cluster configured in `dir` and seeds `store` from a pod listing of each.
/// Returns one watcher per cluster, ready to be run.
pub async fn bootstrap(
    dir: &Path,
    store: &IdentityStore,
    metrics: Arc<Metrics>,
    resync_period: Duration,
) -> Result<Vec<PodWatcher>, Error> {
    let paths = kubeconfigs(dir)?;
    if paths.is_empty() {
        info!(dir = %dir.display(), "no kubeconfig found, pod table stays empty");
    }
    let mut watchers = Vec::with_capacity(paths.len());
    for path in paths {
        let source = source_name(&path);
        let client = connect(&path).await?;
        let mut updater = PodUpdater::new(store.clone(), source.clone());
        let loaded = updater.seed(list_pods(&client, &path).await?);
        info!(%source, pods = loaded, "pod info loaded");
        watchers.push(PodWatcher::new(
            Api::all(client),
            updater,
            metrics.clone(),
            resync_period,
        ));
    }
    Ok(watchers)
}

enum Termination {
    Shutdown,
    Resync,
    Complete,
}

/// PodWatcher keeps one source's pods in the identity tables for the life of the process.
pub struct PodWatcher<S = Api<Pod>> {
    events: S,
    updater: PodUpdater,
    metrics: Arc<Metrics>,
    resync_period: Duration,
    connection_id: u64,
    failures: u32,
    received: bool,
}

impl<S: PodEventSource> PodWatcher<S> {
    pub fn new(
        events: S,
        updater: PodUpdater,
        metrics: Arc<Metrics>,
        resync_period: Duration,
    ) -> Self {
        Self {
            events,
            updater,
            metrics,
            resync_period,
            connection_id: 0,
            failures: 0,
            received: false,
        }
    }

    pub fn source(&self) -> &Strng {
        self.updater.source()
    }

    /// Watches until `drain` is signaled. Stream failures are retried forever.
    pub async fn run(mut self, drain: DrainWatcher) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            self.connection_id += 1;
            let id = self.connection_id;
            let source = self.source().clone();
            match self
                .run_loop(backoff, &drain)
                .instrument(info_span!("watch", %source, id))
                .await
            {
                Some(next) => backoff = next,
                None => break,
            }
        }
        info!(source = %self.source(), "pod watch stopped");
    }

    async fn run_loop(&mut self, backoff: Duration, drain: &DrainWatcher) -> Option<Duration> {
        let res = self.run_internal(drain).await;
        // Only a stream that delivered pod state counts as healthy.
        let backoff = if self.received {
            INITIAL_BACKOFF
        } else {
            backoff
        };
        match res {
            Ok(Termination::Shutdown) => return None,
            Ok(Termination::Resync) => {
                debug!("resync period elapsed, re-establishing watch");
                self.terminated(TerminationReason::Resync);
                return Some(backoff);
            }
            Ok(Termination::Complete) => {
                warn!("watch stream complete, retrying in {:?}", backoff);
                self.terminated(TerminationReason::Complete);
                self.failed();
            }
            Err(e) => {
                warn!("watch error: {}, retrying in {:?}", e, backoff);
                self.terminated(TerminationReason::Error);
                self.failed();
            }
        }
        tokio::select! {
            biased;
            _ = drain.signaled() => None,
            _ = tokio::time::sleep(backoff) => Some(std::cmp::min(MAX_BACKOFF, backoff * 2)),
        }
    }

    async fn run_internal(&mut self, drain: &DrainWatcher) -> Result<Termination, Error> {
        self.received = false;
        let mut stream = self.events.watch();
        let resync = tokio::time::sleep(self.resync_period);
        tokio::pin!(resync);
        debug!("watch started");
        loop {
            tokio::select! {
                biased;
                _ = drain.signaled() => return Ok(Termination::Shutdown),
                _ = &mut resync => return Ok(Termination::Resync),
                event = stream.next() => {
                    let Some(event) = event else {
                        return Ok(Termination::Complete);
                    };
                    let event = PodEvent::from(event?);
                    // Every new stream opens with a relist marker before it has listed anything.
                    if !self.received && event != PodEvent::RelistStarted {
                        self.received = true;
                        self.recovered();
                    }
                    self.metrics.increment(&WatchEvent {
                        source: self.updater.source(),
                        event: &event,
                    });
                    self.updater.handle(event);
                }
            }
        }
    }

    fn failed(&mut self) {
        self.failures += 1;
        if self.failures < DEGRADED_AFTER {
            return;
        }
        if self.failures == DEGRADED_AFTER {
            warn!(failures = self.failures, "pod watch degraded");
        }
        self.metrics.record(
            &Degraded {
                source: self.updater.source(),
                degraded: true,
            },
            (),
        );
    }

    fn recovered(&mut self) {
        if self.failures >= DEGRADED_AFTER {
            info!(failures = self.failures, "pod watch recovered");
        }
        self.failures = 0;
        self.metrics.record(
            &Degraded {
                source: self.updater.source(),
                degraded: false,
            },
            (),
        );
    }

    fn terminated(&self, reason: TerminationReason) {
        self.metrics.increment(&WatchTermination {
            source: self.updater.source(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::net::IpAddr;
    use std::sync::Mutex;

    use futures::stream;

    use super::*;
    use crate::drain::{self, DrainMode};
    use crate::test_helpers::{pod, temp_dir};
    use crate::watch::metrics::{SourceLabels, Termination as TerminationLabels};

    type Script = Vec<Result<watcher::Event<Pod>, watcher::Error>>;

    /// Hands out one scripted stream per watch. Streams stay open after their script runs out,
    /// unless pushed with `push_closing`.
    #[derive(Clone, Default)]
    struct Scripted(Arc<Mutex<VecDeque<(Script, bool)>>>);

    impl Scripted {
        fn push(&self, script: Script) {
            self.0.lock().unwrap().push_back((script, false));
        }

        fn push_closing(&self, script: Script) {
            self.0.lock().unwrap().push_back((script, true));
        }
    }

    impl PodEventSource for Scripted {
        fn watch(&self) -> EventStream {
            match self.0.lock().unwrap().pop_front() {
                Some((items, true)) => stream::iter(items).boxed(),
                Some((items, false)) => stream::iter(items).chain(stream::pending()).boxed(),
                None => stream::pending().boxed(),
            }
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn watcher_for(
        source: &Scripted,
        store: &IdentityStore,
        resync: Duration,
    ) -> (PodWatcher<Scripted>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::default());
        let updater = PodUpdater::new(store.clone(), strng::new("cluster-a"));
        (
            PodWatcher::new(source.clone(), updater, metrics.clone(), resync),
            metrics,
        )
    }

    fn terminations(metrics: &Metrics, reason: TerminationReason) -> u64 {
        metrics
            .terminations
            .get_or_create(&TerminationLabels {
                source: "cluster-a".to_string(),
                reason,
            })
            .get()
    }

    fn degraded(metrics: &Metrics) -> i64 {
        metrics
            .degraded
            .get_or_create(&SourceLabels {
                source: "cluster-a".to_string(),
            })
            .get()
    }

    #[tokio::test(start_paused = true)]
    async fn applies_events_until_drained() {
        let source = Scripted::default();
        source.push(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(pod("p1", Some("10.0.0.1")))),
            Ok(watcher::Event::InitDone),
            Ok(watcher::Event::Apply(pod("p2", Some("10.0.0.2")))),
            Ok(watcher::Event::Delete(pod("p1", Some("10.0.0.1")))),
        ]);
        let store = IdentityStore::new();
        let (watcher, _metrics) = watcher_for(&source, &store, Duration::from_secs(1800));

        let (trigger, drain) = drain::new();
        let task = tokio::spawn(watcher.run(drain));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(store.lookup(&ip("10.0.0.1")), None);
        assert_eq!(store.lookup(&ip("10.0.0.2")).unwrap().app, "p2");

        trigger.start_drain_and_wait(DrainMode::Graceful).await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_relists_and_prunes() {
        let source = Scripted::default();
        source.push(vec![
            Ok(watcher::Event::Apply(pod("p1", Some("10.0.0.1")))),
            Err(watcher::Error::NoResourceVersion),
        ]);
        source.push(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(pod("p2", Some("10.0.0.2")))),
            Ok(watcher::Event::InitDone),
        ]);
        let store = IdentityStore::new();
        let (watcher, metrics) = watcher_for(&source, &store, Duration::from_secs(1800));

        let (trigger, drain) = drain::new();
        let task = tokio::spawn(watcher.run(drain));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(store.lookup(&ip("10.0.0.1")), None);
        assert_eq!(store.lookup(&ip("10.0.0.2")).unwrap().app, "p2");
        assert_eq!(terminations(&metrics, TerminationReason::Error), 1);
        assert_eq!(degraded(&metrics), 0);

        trigger.start_drain_and_wait(DrainMode::Graceful).await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_until_next_event() {
        let source = Scripted::default();
        for _ in 0..DEGRADED_AFTER {
            source.push(vec![Err(watcher::Error::NoResourceVersion)]);
        }
        let store = IdentityStore::new();
        let (watcher, metrics) = watcher_for(&source, &store, Duration::from_secs(10));

        let (trigger, drain) = drain::new();
        let task = tokio::spawn(watcher.run(drain));

        // 10+20+40+80+160ms of backoff, then an idle stream.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(terminations(&metrics, TerminationReason::Error), 5);
        assert_eq!(degraded(&metrics), 1);

        // The next resync picks up a healthy stream.
        source.push(vec![Ok(watcher::Event::Apply(pod("p1", Some("10.0.0.1"))))]);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.lookup(&ip("10.0.0.1")).unwrap().app, "p1");
        assert_eq!(degraded(&metrics), 0);
        assert!(terminations(&metrics, TerminationReason::Resync) >= 1);

        trigger.start_drain_and_wait(DrainMode::Graceful).await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_api_backs_off_and_degrades() {
        // A fresh watch announces its relist before the initial list fails.
        let source = Scripted::default();
        for _ in 0..100 {
            source.push(vec![
                Ok(watcher::Event::Init),
                Err(watcher::Error::NoResourceVersion),
            ]);
        }
        let store = IdentityStore::new();
        let (watcher, metrics) = watcher_for(&source, &store, Duration::from_secs(1800));

        let (trigger, drain) = drain::new();
        let task = tokio::spawn(watcher.run(drain));
        // 10ms doubling: the tenth retry is not due before 10.23s.
        tokio::time::sleep(Duration::from_secs(10)).await;

        let attempts = terminations(&metrics, TerminationReason::Error);
        assert!(attempts >= u64::from(DEGRADED_AFTER), "{attempts} attempts");
        assert!(attempts <= 10, "{attempts} attempts");
        assert_eq!(degraded(&metrics), 1);

        trigger.start_drain_and_wait(DrainMode::Graceful).await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn closed_streams_count_as_failures() {
        let source = Scripted::default();
        for _ in 0..20 {
            source.push_closing(vec![Ok(watcher::Event::Init)]);
        }
        let store = IdentityStore::new();
        let (watcher, metrics) = watcher_for(&source, &store, Duration::from_secs(1800));

        let (trigger, drain) = drain::new();
        let task = tokio::spawn(watcher.run(drain));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let closed = terminations(&metrics, TerminationReason::Complete);
        assert!(closed >= u64::from(DEGRADED_AFTER), "{closed} closed streams");
        assert!(closed <= 10, "{closed} closed streams");
        assert_eq!(degraded(&metrics), 1);

        trigger.start_drain_and_wait(DrainMode::Graceful).await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_interrupts_backoff() {
        let source = Scripted::default();
        for _ in 0..20 {
            source.push(vec![Err(watcher::Error::NoResourceVersion)]);
        }
        let store = IdentityStore::new();
        let (watcher, _metrics) = watcher_for(&source, &store, Duration::from_secs(1800));

        let (trigger, drain) = drain::new();
        let task = tokio::spawn(watcher.run(drain));
        // Long enough to reach the backoff cap.
        tokio::time::sleep(Duration::from_secs(30)).await;

        let start = tokio::time::Instant::now();
        trigger.start_drain_and_wait(DrainMode::Graceful).await;
        task.await.unwrap();
        assert!(start.elapsed() < MAX_BACKOFF);
    }

    #[test]
    fn kubeconfig_discovery() {
        let dir = temp_dir("kubeconfigs");
        std::fs::write(dir.join("cluster-b"), "").unwrap();
        std::fs::write(dir.join("cluster-a"), "").unwrap();
        std::fs::write(dir.join(".hidden"), "").unwrap();
        std::fs::create_dir(dir.join("nested")).unwrap();
        std::fs::write(dir.join("nested").join("cluster-c"), "").unwrap();

        let found: Vec<Strng> = kubeconfigs(&dir)
            .unwrap()
            .iter()
            .map(|p| source_name(p))
            .collect();
        assert_eq!(found, vec![strng::new("cluster-a"), strng::new("cluster-b")]);
    }

    #[test]
    fn missing_config_dir() {
        let err = kubeconfigs(Path::new("/nonexistent/dnsattr/kube")).unwrap_err();
        assert!(matches!(err, Error::ConfigDir { .. }), "{err}");
    }

    #[tokio::test]
    async fn invalid_kubeconfig() {
        let dir = temp_dir("bad-kubeconfig");
        let path = dir.join("broken");
        std::fs::write(&path, "{ this is not yaml").unwrap();
        let Err(err) = connect(&path).await else {
            panic!("a broken kubeconfig must not produce a client");
        };
        assert!(matches!(err, Error::Kubeconfig { .. }), "{err}");
    }
}
