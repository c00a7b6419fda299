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

use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, PodStatus};
use kube::api::ObjectMeta;

use crate::analyzer::{Attribution, Reporter};
use crate::config::{self, CaptureSource, OutputFormat, QueueFullPolicy};

pub mod helpers;
pub mod packet;

static TEMP_FILES: AtomicUsize = AtomicUsize::new(0);

/// Writes `contents` to a fresh file under the temp dir and returns its path.
pub fn temp_file(name: &str, contents: &str) -> PathBuf {
    let path = temp_path(name);
    fs::write(&path, contents).unwrap();
    path
}

/// A path under the temp dir that no other test uses.
pub fn temp_path(name: &str) -> PathBuf {
    let n = TEMP_FILES.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("dnsattr-{}-{n}-{name}", std::process::id()))
}

/// A fresh empty directory under the temp dir.
pub fn temp_dir(name: &str) -> PathBuf {
    let path = temp_path(name);
    fs::create_dir_all(&path).unwrap();
    path
}

/// Writes frames to a classic pcap file with the given link type (1 = ethernet).
pub fn write_pcap(path: &Path, link_type: u32, frames: &[Vec<u8>]) {
    let mut out = Vec::new();
    out.extend_from_slice(&0xa1b2c3d4u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&65535u32.to_le_bytes());
    out.extend_from_slice(&link_type.to_le_bytes());
    for (i, frame) in frames.iter().enumerate() {
        out.extend_from_slice(&(1_700_000_000u32 + i as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(frame);
    }
    fs::File::create(path).unwrap().write_all(&out).unwrap();
}

/// A pod in the default namespace, with `ip` as its status address.
pub fn pod(name: &str, ip: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        status: Some(PodStatus {
            pod_ip: ip.map(str::to_string),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A configuration reading `capture_file`, with an empty kubeconfig directory.
pub fn test_config(capture_file: PathBuf, vm_dataset: PathBuf) -> config::Config {
    config::Config {
        capture: CaptureSource::Offline(capture_file),
        kube_config_dir: temp_dir("kube"),
        vm_dataset,
        workers: 2,
        queue_capacity: 64,
        queue_full_policy: QueueFullPolicy::Block,
        resync_period: Duration::from_secs(60),
        termination_grace_period: Duration::from_secs(5),
        output_format: OutputFormat::Plain,
    }
}

/// MemoryReporter keeps every attribution it is handed.
#[derive(Debug, Clone, Default)]
pub struct MemoryReporter {
    seen: Arc<Mutex<Vec<Attribution>>>,
}

impl MemoryReporter {
    pub fn attributions(&self) -> Vec<Attribution> {
        self.seen.lock().unwrap().clone()
    }

    /// Attributions sorted by source address, for tests where worker order does not matter.
    pub fn sorted(&self) -> Vec<Attribution> {
        let mut all = self.attributions();
        all.sort_by_key(|a| (a.source_ip(), a.to_string()));
        all
    }

    pub fn find(&self, ip: IpAddr) -> Option<Attribution> {
        self.attributions().into_iter().find(|a| a.source_ip() == ip)
    }
}

impl Reporter for MemoryReporter {
    fn report(&self, attribution: &Attribution) {
        self.seen.lock().unwrap().push(attribution.clone());
    }
}
