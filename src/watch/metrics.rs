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
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::metrics::Recorder;
use crate::watch::PodEvent;

pub struct Metrics {
    pub events: Family<EventLabels, Counter>,
    pub terminations: Family<Termination, Counter>,
    pub degraded: Family<SourceLabels, Gauge>,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct EventLabels {
    pub source: String,
    pub event: EventType,
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum EventType {
    Apply,
    Delete,
    Relist,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct Termination {
    pub source: String,
    pub reason: TerminationReason,
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum TerminationReason {
    /// The stream failed.
    Error,
    /// The resync period elapsed and the watch was re-established.
    Resync,
    /// The server ended the stream.
    Complete,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct SourceLabels {
    pub source: String,
}

/// A pod event received from `source`.
pub struct WatchEvent<'a> {
    pub source: &'a str,
    pub event: &'a PodEvent,
}

pub struct WatchTermination<'a> {
    pub source: &'a str,
    pub reason: TerminationReason,
}

pub struct Degraded<'a> {
    pub source: &'a str,
    pub degraded: bool,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let events = Family::default();
        registry.register(
            "watch_events",
            "The total number of pod events received, by source and type",
            events.clone(),
        );
        let terminations = Family::default();
        registry.register(
            "watch_terminations",
            "The total number of pod watch streams that ended, by source and reason",
            terminations.clone(),
        );
        let degraded = Family::default();
        registry.register(
            "watch_degraded",
            "Whether a pod watch source has failed repeatedly without recovering",
            degraded.clone(),
        );

        Self {
            events,
            terminations,
            degraded,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new(&mut Registry::default())
    }
}

impl Recorder<WatchEvent<'_>, u64> for Metrics {
    fn record(&self, ev: &WatchEvent<'_>, count: u64) {
        let event = match ev.event {
            PodEvent::Applied(_) => EventType::Apply,
            PodEvent::Deleted(_) => EventType::Delete,
            PodEvent::RelistStarted | PodEvent::Relisted(_) | PodEvent::RelistDone => {
                EventType::Relist
            }
        };
        self.events
            .get_or_create(&EventLabels {
                source: ev.source.to_string(),
                event,
            })
            .inc_by(count);
    }
}

impl Recorder<WatchTermination<'_>, u64> for Metrics {
    fn record(&self, t: &WatchTermination<'_>, count: u64) {
        self.terminations
            .get_or_create(&Termination {
                source: t.source.to_string(),
                reason: t.reason,
            })
            .inc_by(count);
    }
}

impl Recorder<Degraded<'_>, ()> for Metrics {
    fn record(&self, d: &Degraded<'_>, _: ()) {
        self.degraded
            .get_or_create(&SourceLabels {
                source: d.source.to_string(),
            })
            .set(i64::from(d.degraded));
    }
}
