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

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

use crate::metrics::Recorder;
use crate::packet::StageKind;
use crate::state::Table;

/// Metrics for the path a packet takes from capture to report.
pub struct Metrics {
    pub packets: Counter,
    pub rejections: Family<Rejection, Counter>,
    pub attributions: Family<AttributionLabels, Counter>,
    pub queue_drops: Counter,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct Rejection {
    pub stage: StageKind,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct AttributionLabels {
    pub result: AttributionResult,
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum AttributionResult {
    Vm,
    Pod,
    Unresolved,
}

impl From<Option<Table>> for AttributionResult {
    fn from(table: Option<Table>) -> Self {
        match table {
            Some(Table::Vm) => AttributionResult::Vm,
            Some(Table::Pod) => AttributionResult::Pod,
            None => AttributionResult::Unresolved,
        }
    }
}

/// A packet was read from the capture source.
pub struct PacketSeen;

/// A record was dropped because the analyzer queue was full.
pub struct QueueDrop;

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let packets = Counter::default();
        registry.register(
            "packets",
            "The total number of packets read from the capture source",
            packets.clone(),
        );
        let rejections = Family::default();
        registry.register(
            "pipeline_rejections",
            "The total number of packets the pipeline did not extract a record from, by stage",
            rejections.clone(),
        );
        let attributions = Family::default();
        registry.register(
            "attributions",
            "The total number of capture records analyzed, by result",
            attributions.clone(),
        );
        let queue_drops = Counter::default();
        registry.register(
            "queue_drops",
            "The total number of capture records dropped because the analyzer queue was full",
            queue_drops.clone(),
        );

        Self {
            packets,
            rejections,
            attributions,
            queue_drops,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new(&mut Registry::default())
    }
}

impl Recorder<PacketSeen, u64> for Metrics {
    fn record(&self, _: &PacketSeen, count: u64) {
        self.packets.inc_by(count);
    }
}

impl Recorder<StageKind, u64> for Metrics {
    fn record(&self, stage: &StageKind, count: u64) {
        self.rejections
            .get_or_create(&Rejection { stage: *stage })
            .inc_by(count);
    }
}

impl Recorder<AttributionResult, u64> for Metrics {
    fn record(&self, result: &AttributionResult, count: u64) {
        self.attributions
            .get_or_create(&AttributionLabels { result: *result })
            .inc_by(count);
    }
}

impl Recorder<QueueDrop, u64> for Metrics {
    fn record(&self, _: &QueueDrop, count: u64) {
        self.queue_drops.inc_by(count);
    }
}
