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

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::runtime::watcher;
use tracing::{Level, debug, info, instrument, warn};

use crate::state::IdentityStore;
use crate::strng::{self, Strng};

pub use client::*;

mod client;
pub mod metrics;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read kubeconfig directory {}: {source}", .path.display())]
    ConfigDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load kubeconfig {}: {source}", .path.display())]
    Kubeconfig {
        path: PathBuf,
        #[source]
        source: kube::config::KubeconfigError,
    },
    #[error("failed to build client from {}: {source}", .path.display())]
    Client {
        path: PathBuf,
        #[source]
        source: kube::Error,
    },
    #[error("failed to list pods via {}: {source}", .path.display())]
    List {
        path: PathBuf,
        #[source]
        source: kube::Error,
    },
    #[error("watch stream error: {0}")]
    Watch(#[from] watcher::Error),
}

/// The parts of a pod the identity tables care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSnapshot {
    pub name: Strng,
    pub ip: Option<IpAddr>,
}

impl From<&Pod> for PodSnapshot {
    fn from(pod: &Pod) -> Self {
        let name = strng::new(pod.name_any());
        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .filter(|ip| !ip.is_empty())
            .and_then(|ip| match ip.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!(pod = %name, ip, "ignoring unparsable pod ip");
                    None
                }
            });
        PodSnapshot { name, ip }
    }
}

/// PodEvent is a watch event reduced to what the updater acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodEvent {
    Applied(PodSnapshot),
    Deleted(Strng),
    /// A full relist begins; every pod will be re-delivered as `Relisted`.
    RelistStarted,
    Relisted(PodSnapshot),
    /// The relist is complete. Pods not re-delivered since `RelistStarted` are gone.
    RelistDone,
}

impl From<watcher::Event<Pod>> for PodEvent {
    fn from(event: watcher::Event<Pod>) -> Self {
        match event {
            watcher::Event::Apply(pod) => PodEvent::Applied((&pod).into()),
            watcher::Event::Delete(pod) => PodEvent::Deleted(strng::new(pod.name_any())),
            watcher::Event::Init => PodEvent::RelistStarted,
            watcher::Event::InitApply(pod) => PodEvent::Relisted((&pod).into()),
            watcher::Event::InitDone => PodEvent::RelistDone,
        }
    }
}

/// Applies pod events from one source to the identity tables.
///
/// The updater remembers which pods its source has told it about, so that a relist can remove
/// pods that disappeared while the watch was down. Pods known through other sources are never
/// touched by a relist.
#[derive(Debug)]
pub struct PodUpdater {
    store: IdentityStore,
    source: Strng,
    known: HashSet<Strng>,
    relist: Option<HashSet<Strng>>,
}

impl PodUpdater {
    pub fn new(store: IdentityStore, source: Strng) -> Self {
        Self {
            store,
            source,
            known: HashSet::new(),
            relist: None,
        }
    }

    pub fn source(&self) -> &Strng {
        &self.source
    }

    /// Seeds the tables from the startup listing. Only pods with an address are recorded.
    /// Returns the number of pods recorded.
    pub fn seed(&mut self, pods: impl IntoIterator<Item = PodSnapshot>) -> usize {
        let mut loaded = 0;
        for pod in pods {
            if let Some(ip) = pod.ip {
                self.store.pod_ip_changed(pod.name.clone(), ip);
                self.known.insert(pod.name);
                loaded += 1;
            }
        }
        loaded
    }

    #[instrument(level = Level::TRACE, name = "pod_event", skip_all, fields(source = %self.source))]
    pub fn handle(&mut self, event: PodEvent) {
        match event {
            PodEvent::Applied(pod) => self.apply(pod),
            PodEvent::Deleted(name) => {
                self.store.pod_removed(&name);
                self.known.remove(&name);
            }
            PodEvent::RelistStarted => {
                debug!("relist started");
                self.relist = Some(HashSet::new());
            }
            PodEvent::Relisted(pod) => {
                self.relist
                    .get_or_insert_with(HashSet::new)
                    .insert(pod.name.clone());
                self.apply(pod);
            }
            PodEvent::RelistDone => self.finish_relist(),
        }
    }

    pub fn known(&self) -> usize {
        self.known.len()
    }

    fn apply(&mut self, pod: PodSnapshot) {
        match pod.ip {
            Some(ip) => self.store.pod_ip_changed(pod.name.clone(), ip),
            None => self.store.pod_added(pod.name.clone()),
        }
        self.known.insert(pod.name);
    }

    fn finish_relist(&mut self) {
        let Some(seen) = self.relist.take() else {
            debug!("relist done without a start, ignoring");
            return;
        };
        let vanished: Vec<Strng> = self.known.difference(&seen).cloned().collect();
        for name in &vanished {
            self.store.pod_removed(name);
        }
        self.known = seen;
        info!(
            pods = self.known.len(),
            removed = vanished.len(),
            "relist complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::pod;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn snap(name: &str, ip: Option<&str>) -> PodSnapshot {
        PodSnapshot {
            name: strng::new(name),
            ip: ip.map(|s| s.parse().unwrap()),
        }
    }

    #[test]
    fn translate_watch_events() {
        assert_eq!(
            PodEvent::from(watcher::Event::Apply(pod("a", Some("10.0.0.1")))),
            PodEvent::Applied(snap("a", Some("10.0.0.1")))
        );
        assert_eq!(
            PodEvent::from(watcher::Event::Apply(pod("a", None))),
            PodEvent::Applied(snap("a", None))
        );
        assert_eq!(
            PodEvent::from(watcher::Event::Apply(pod("a", Some("")))),
            PodEvent::Applied(snap("a", None))
        );
        assert_eq!(
            PodEvent::from(watcher::Event::Apply(pod("a", Some("not-an-ip")))),
            PodEvent::Applied(snap("a", None))
        );
        assert_eq!(
            PodEvent::from(watcher::Event::Delete(pod("a", Some("10.0.0.1")))),
            PodEvent::Deleted(strng::new("a"))
        );
        assert_eq!(
            PodEvent::from(watcher::Event::<Pod>::Init),
            PodEvent::RelistStarted
        );
        assert_eq!(
            PodEvent::from(watcher::Event::InitApply(pod("b", None))),
            PodEvent::Relisted(snap("b", None))
        );
        assert_eq!(
            PodEvent::from(watcher::Event::<Pod>::InitDone),
            PodEvent::RelistDone
        );
    }

    #[test]
    fn apply_and_delete() {
        let store = IdentityStore::new();
        let mut updater = PodUpdater::new(store.clone(), strng::new("cluster-a"));

        updater.handle(PodEvent::Applied(snap("p1", None)));
        assert_eq!(store.pod_ip("p1"), Some(None));

        updater.handle(PodEvent::Applied(snap("p1", Some("10.0.0.5"))));
        assert_eq!(store.lookup(&ip("10.0.0.5")).unwrap().app, "p1");

        updater.handle(PodEvent::Deleted(strng::new("p1")));
        assert_eq!(store.lookup(&ip("10.0.0.5")), None);
        assert_eq!(store.pod_ip("p1"), None);
        assert_eq!(updater.known(), 0);
    }

    #[test]
    fn seed_skips_pods_without_address() {
        let store = IdentityStore::new();
        let mut updater = PodUpdater::new(store.clone(), strng::new("cluster-a"));
        let loaded = updater.seed([
            snap("p1", Some("10.0.0.1")),
            snap("p2", None),
            snap("p3", Some("10.0.0.3")),
        ]);
        assert_eq!(loaded, 2);
        assert_eq!(store.pod_ip("p2"), None);
        assert_eq!(store.counts().pod_names, 2);
    }

    #[test]
    fn relist_removes_vanished_pods() {
        let store = IdentityStore::new();
        let mut updater = PodUpdater::new(store.clone(), strng::new("cluster-a"));
        updater.seed([snap("p1", Some("10.0.0.1")), snap("p2", Some("10.0.0.2"))]);

        updater.handle(PodEvent::RelistStarted);
        updater.handle(PodEvent::Relisted(snap("p2", Some("10.0.0.22"))));
        updater.handle(PodEvent::Relisted(snap("p3", None)));
        updater.handle(PodEvent::RelistDone);

        assert_eq!(store.pod_ip("p1"), None);
        assert_eq!(store.lookup(&ip("10.0.0.1")), None);
        assert_eq!(store.lookup(&ip("10.0.0.2")), None);
        assert_eq!(store.lookup(&ip("10.0.0.22")).unwrap().app, "p2");
        assert_eq!(store.pod_ip("p3"), Some(None));
        assert_eq!(updater.known(), 2);
    }

    #[test]
    fn relist_leaves_other_sources_alone() {
        let store = IdentityStore::new();
        let mut a = PodUpdater::new(store.clone(), strng::new("cluster-a"));
        let mut b = PodUpdater::new(store.clone(), strng::new("cluster-b"));
        a.seed([snap("pa", Some("10.0.0.1"))]);
        b.seed([snap("pb", Some("10.1.0.1"))]);

        a.handle(PodEvent::RelistStarted);
        a.handle(PodEvent::RelistDone);

        assert_eq!(store.lookup(&ip("10.0.0.1")), None);
        assert_eq!(store.lookup(&ip("10.1.0.1")).unwrap().app, "pb");
    }

    #[test]
    fn relist_done_without_start_is_ignored() {
        let store = IdentityStore::new();
        let mut updater = PodUpdater::new(store.clone(), strng::new("cluster-a"));
        updater.seed([snap("p1", Some("10.0.0.1"))]);
        updater.handle(PodEvent::RelistDone);
        assert_eq!(store.lookup(&ip("10.0.0.1")).unwrap().app, "p1");
    }
}
