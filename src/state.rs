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

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{Level, debug, info, instrument, trace};

use crate::state::pod::PodStore;
use crate::state::vm::{VmInfo, VmStore};
use crate::strng::Strng;

pub mod pod;
pub mod vm;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to open vm dataset {}: {source}", .path.display())]
    DatasetOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read vm dataset {}: {source}", .path.display())]
    DatasetRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Which table answered a lookup.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Vm,
    Pod,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Table::Vm => "vm",
            Table::Pod => "pod",
        })
    }
}

/// The application owning an address, and where that answer came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub app: Strng,
    pub table: Table,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Counts {
    pub vms: usize,
    pub pod_addresses: usize,
    pub pod_names: usize,
}

/// The two identity tables. They are kept apart on purpose: VM entries are curated by hand and
/// must never be shadowed by pod churn, so lookups consult them first.
#[derive(Default, Debug)]
pub struct IdentityState {
    pub vms: VmStore,
    pub pods: PodStore,
}

impl IdentityState {
    /// Find the owner of an address, VM table first.
    pub fn find_address(&self, ip: &IpAddr) -> Option<Owner> {
        if let Some(vm) = self.vms.find_address(ip) {
            return Some(Owner {
                app: vm.app.clone(),
                table: Table::Vm,
            });
        }
        self.pods.find_address(ip).map(|name| Owner {
            app: name.clone(),
            table: Table::Pod,
        })
    }
}

/// IdentityStore is the shared handle to the identity tables.
///
/// Every operation takes the lock exactly once, so a pod mutation that touches both directions of
/// the pod table is observed by readers either entirely or not at all.
#[derive(Debug, Clone, Default)]
pub struct IdentityStore {
    state: Arc<RwLock<IdentityState>>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, IdentityState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, IdentityState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, ip: &IpAddr) -> Option<Owner> {
        self.read().find_address(ip)
    }

    pub fn set_vm(&self, ip: IpAddr, app: Strng, owner: Strng) {
        self.write().vms.insert(ip, VmInfo { app, owner });
    }

    /// Loads the static VM dataset. Malformed lines are skipped; the file failing to open or read
    /// is an error. Returns the number of entries loaded.
    pub fn load_vm_dataset(&self, path: &Path) -> Result<usize, Error> {
        info!("vm info file {}", path.display());
        let file = File::open(path).map_err(|source| Error::DatasetOpen {
            path: path.to_path_buf(),
            source,
        })?;
        // Parse outside the lock; the table is only locked for the bulk insert.
        let entries =
            vm::read_dataset(BufReader::new(file)).map_err(|source| Error::DatasetRead {
                path: path.to_path_buf(),
                source,
            })?;
        let loaded = entries.len();
        let mut state = self.write();
        for (ip, info) in entries {
            state.vms.insert(ip, info);
        }
        info!(entries = loaded, "build vm info from file {} complete", path.display());
        Ok(loaded)
    }

    /// Records a pod that has no address yet.
    #[instrument(level = Level::TRACE, name = "pod_added", skip_all, fields(pod = %name))]
    pub fn pod_added(&self, name: Strng) {
        if let Some(prev) = self.write().pods.insert_pending(name) {
            debug!(ip = %prev, "pod lost its address");
        }
    }

    /// Points `name` at `ip` in both directions. Unknown pods are created.
    #[instrument(level = Level::TRACE, name = "pod_ip_changed", skip_all, fields(pod = %name, %ip))]
    pub fn pod_ip_changed(&self, name: Strng, ip: IpAddr) {
        match self.write().pods.set_ip(name, ip) {
            Some(prev) if prev != ip => debug!(prev = %prev, "pod address changed"),
            Some(_) => trace!("pod address unchanged"),
            None => trace!("pod address assigned"),
        }
    }

    /// Forgets a pod. Removing a pod that was never seen is a no-op.
    #[instrument(level = Level::TRACE, name = "pod_removed", skip_all, fields(pod = %name))]
    pub fn pod_removed(&self, name: &str) {
        match self.write().pods.remove(name) {
            Some(Some(ip)) => trace!(%ip, "removed pod"),
            Some(None) => trace!("removed pod without address"),
            None => trace!("tried to remove pod but it was not found"),
        }
    }

    /// Returns the address recorded for a pod: `None` if the pod is unknown, `Some(None)` if it is
    /// known without an address.
    pub fn pod_ip(&self, name: &str) -> Option<Option<IpAddr>> {
        self.read().pods.find_name(name)
    }

    pub fn counts(&self) -> Counts {
        let state = self.read();
        Counts {
            vms: state.vms.len(),
            pod_addresses: state.pods.len_addresses(),
            pod_names: state.pods.len_names(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::Ipv4Addr;
    use std::thread;

    use super::*;
    use crate::strng;
    use crate::test_helpers::helpers::initialize_telemetry;
    use crate::test_helpers::temp_file;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn vm_table_takes_precedence() {
        initialize_telemetry();
        let store = IdentityStore::new();
        store.set_vm(ip("10.0.0.1"), strng::new("app-vm"), strng::new("owner"));
        store.pod_ip_changed(strng::new("pod-a"), ip("10.0.0.1"));

        let owner = store.lookup(&ip("10.0.0.1")).unwrap();
        assert_eq!(owner.app, "app-vm");
        assert_eq!(owner.table, Table::Vm);

        // The pod entry is still there, only shadowed.
        assert_eq!(store.pod_ip("pod-a"), Some(Some(ip("10.0.0.1"))));
    }

    #[test]
    fn pod_table_answers_when_vm_table_misses() {
        let store = IdentityStore::new();
        store.pod_ip_changed(strng::new("pod-a"), ip("10.0.0.2"));
        let owner = store.lookup(&ip("10.0.0.2")).unwrap();
        assert_eq!(owner.app, "pod-a");
        assert_eq!(owner.table, Table::Pod);
        assert_eq!(store.lookup(&ip("10.0.0.3")), None);
    }

    #[test]
    fn pod_remove_clears_both_directions() {
        let store = IdentityStore::new();
        store.pod_ip_changed(strng::new("p1"), ip("10.0.0.5"));
        store.pod_removed("p1");
        assert_eq!(store.lookup(&ip("10.0.0.5")), None);
        assert_eq!(store.pod_ip("p1"), None);
        assert_eq!(
            store.counts(),
            Counts {
                vms: 0,
                pod_addresses: 0,
                pod_names: 0
            }
        );
    }

    #[test]
    fn pod_remove_unknown_is_noop() {
        let store = IdentityStore::new();
        store.pod_removed("never-seen");
        store.pod_added(strng::new("pending"));
        store.pod_removed("pending");
        assert_eq!(store.counts(), Counts::default());
    }

    #[test]
    fn pod_lifecycle() {
        let store = IdentityStore::new();
        store.pod_added(strng::new("p1"));
        assert_eq!(store.pod_ip("p1"), Some(None));

        store.pod_ip_changed(strng::new("p1"), ip("10.0.0.5"));
        store.pod_ip_changed(strng::new("p1"), ip("10.0.0.6"));
        assert_eq!(store.lookup(&ip("10.0.0.5")), None);
        assert_eq!(store.lookup(&ip("10.0.0.6")).unwrap().app, "p1");
        assert_eq!(store.counts().pod_addresses, 1);
    }

    #[test]
    fn load_dataset() {
        initialize_telemetry();
        let path = temp_file(
            "load_dataset",
            "10.1.1.1 x app-foo owner-a\nbroken line\n10.1.1.2 y app-bar owner-b",
        );
        let store = IdentityStore::new();
        assert_eq!(store.load_vm_dataset(&path).unwrap(), 2);
        assert_eq!(store.lookup(&ip("10.1.1.1")).unwrap().app, "app-foo");
        assert_eq!(store.lookup(&ip("10.1.1.2")).unwrap().app, "app-bar");
        assert_eq!(
            store.read().vms.find_address(&ip("10.1.1.2")).unwrap().owner,
            "owner-b"
        );
    }

    #[test]
    fn load_dataset_missing_file() {
        let store = IdentityStore::new();
        let err = store
            .load_vm_dataset(Path::new("/nonexistent/dnsattr/data.txt"))
            .unwrap_err();
        assert!(matches!(err, Error::DatasetOpen { .. }), "{err}");
    }

    #[test]
    fn load_dataset_not_utf8() {
        let path = temp_file("load_dataset_not_utf8", "");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0xff, 0xfe, b'\n'])
            .unwrap();
        let store = IdentityStore::new();
        let err = store.load_vm_dataset(&path).unwrap_err();
        assert!(matches!(err, Error::DatasetRead { .. }), "{err}");
    }

    #[test]
    fn concurrent_mutation_never_tears() {
        const WRITERS: usize = 4;
        const ROUNDS: usize = 500;
        let store = IdentityStore::new();

        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let store = store.clone();
                thread::spawn(move || {
                    let name = strng::format!("pod-{w}");
                    for i in 0..ROUNDS {
                        let addr =
                            IpAddr::V4(Ipv4Addr::new(10, w as u8, (i / 256) as u8, i as u8));
                        store.pod_ip_changed(name.clone(), addr);
                        if i % 3 == 0 {
                            store.pod_removed(&name);
                        }
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..WRITERS)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let state = store.read();
                        state.pods.assert_consistent();
                    }
                })
            })
            .collect();

        for t in writers.into_iter().chain(readers) {
            t.join().unwrap();
        }
        store.read().pods.assert_consistent();
    }
}
