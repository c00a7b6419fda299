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

use prometheus_client::encoding::text;
use prometheus_client::registry::Registry;

pub mod meta;
pub mod pipeline;

/// Prefix shared by every metric this binary exports.
pub const PREFIX: &str = "dnsattr";

/// Returns the sub registry all components register into.
pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
    registry.sub_registry_with_prefix(PREFIX)
}

/// Renders the registry in the prometheus text format.
pub fn encode(registry: &Registry) -> Result<String, fmt::Error> {
    let mut buf = String::new();
    text::encode(&mut buf, registry)?;
    Ok(buf)
}

pub trait Recorder<E, T> {
    /// Record the given event
    fn record(&self, event: &E, meta: T);
}

pub trait IncrementRecorder<E>: Recorder<E, u64> {
    /// Record the given event by incrementing the counter by count
    fn increment(&self, event: &E);
}

impl<E, R> IncrementRecorder<E> for R
where
    R: Recorder<E, u64>,
{
    fn increment(&self, event: &E) {
        self.record(event, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::StageKind;

    #[test]
    fn encodes_registered_metrics() {
        let mut registry = Registry::default();
        let m = pipeline::Metrics::new(sub_registry(&mut registry));
        m.increment(&pipeline::PacketSeen);
        m.increment(&StageKind::Dns);
        m.record(&StageKind::Udp, 3);

        let out = encode(&registry).unwrap();
        assert!(out.contains("dnsattr_packets_total 1"), "{out}");
        assert!(out.contains("dnsattr_pipeline_rejections_total{stage=\"Udp\"} 3"), "{out}");
        assert!(out.contains("# EOF"), "{out}");
    }
}
