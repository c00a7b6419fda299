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

use std::net::IpAddr;

use hickory_proto::rr::{Name, RData, Record};
use tracing::trace;

use crate::packet::{CaptureRecord, Layers};

/// A Stage inspects one protocol layer. It fills in the parts of the record it owns and returns
/// whether the packet still qualifies.
pub type Stage = fn(&Layers<'_>, &mut CaptureRecord) -> bool;

/// Requires a UDP transport layer. The destination port is the querying client's port, since
/// the packets of interest are responses travelling back to it.
pub fn udp(layers: &Layers<'_>, record: &mut CaptureRecord) -> bool {
    let Some(udp) = layers.udp() else {
        return false;
    };
    record.source_port = udp.destination_port();
    true
}

/// Requires a DNS message with exactly one question and at least one answer carrying data.
/// When several answers qualify the last one wins.
pub fn dns(layers: &Layers<'_>, record: &mut CaptureRecord) -> bool {
    let Some(msg) = layers.dns() else {
        return false;
    };
    if msg.queries().len() != 1 {
        trace!(questions = msg.queries().len(), "skipping dns message");
        return false;
    }
    let Some(answer) = msg.answers().iter().rfind(|r| has_data(r)) else {
        trace!(answers = msg.answers().len(), "dns message has no usable answer");
        return false;
    };
    record.query_name = display_name(answer.name());
    record.answer_ip = address(answer.data());
    true
}

/// Requires an IPv4 network layer. The destination address identifies the client.
pub fn ipv4(layers: &Layers<'_>, record: &mut CaptureRecord) -> bool {
    let Some(ipv4) = layers.ipv4() else {
        return false;
    };
    record.source_ip = IpAddr::V4(ipv4.header().destination_addr());
    true
}

// Zero length RDATA is decoded as an update placeholder.
fn has_data(record: &Record) -> bool {
    !matches!(record.data(), RData::Update0(_))
}

fn address(data: &RData) -> Option<IpAddr> {
    match data {
        RData::A(a) => Some(IpAddr::V4(a.0)),
        RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    }
}

fn display_name(name: &Name) -> String {
    let name = name.to_ascii();
    match name.strip_suffix('.') {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => name,
    }
}
