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

use std::cell::OnceCell;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use etherparse::{Ipv4Slice, NetSlice, SlicedPacket, TransportSlice, UdpSlice};
use hickory_proto::op::Message;
use prometheus_client::encoding::EncodeLabelValue;

pub use stage::Stage;

pub mod stage;

/// Well known DNS port; UDP payloads to or from it are decoded as DNS.
pub const DNS_PORT: u16 = 53;

/// Link layer framing of captured packets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize)]
pub enum LinkType {
    Ethernet,
    /// Linux "cooked" capture, used when capturing on the `any` device.
    LinuxSll,
    /// No link layer; the capture starts at the IP header.
    RawIp,
}

/// Layers is the decoded view of one captured packet. Network and transport layers are sliced
/// up front; the DNS message is decoded the first time a stage asks for it.
pub struct Layers<'a> {
    sliced: SlicedPacket<'a>,
    dns: OnceCell<Option<Message>>,
}

impl<'a> Layers<'a> {
    /// Slices a raw packet. Returns `None` if the link or network headers are malformed.
    pub fn decode(link: LinkType, data: &'a [u8]) -> Option<Self> {
        let sliced = match link {
            LinkType::Ethernet => SlicedPacket::from_ethernet(data).ok()?,
            LinkType::LinuxSll => SlicedPacket::from_linux_sll(data).ok()?,
            LinkType::RawIp => SlicedPacket::from_ip(data).ok()?,
        };
        Some(Layers {
            sliced,
            dns: OnceCell::new(),
        })
    }

    pub fn udp(&self) -> Option<&UdpSlice<'a>> {
        match &self.sliced.transport {
            Some(TransportSlice::Udp(udp)) => Some(udp),
            _ => None,
        }
    }

    pub fn ipv4(&self) -> Option<&Ipv4Slice<'a>> {
        match &self.sliced.net {
            Some(NetSlice::Ipv4(ipv4)) => Some(ipv4),
            _ => None,
        }
    }

    /// The DNS message carried over UDP port 53, if the payload decodes as one.
    pub fn dns(&self) -> Option<&Message> {
        self.dns
            .get_or_init(|| {
                let udp = self.udp()?;
                if udp.source_port() != DNS_PORT && udp.destination_port() != DNS_PORT {
                    return None;
                }
                Message::from_vec(udp.payload()).ok()
            })
            .as_ref()
    }
}

/// CaptureRecord is what the pipeline extracts from one DNS response.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CaptureRecord {
    /// Destination of the captured response, i.e. the client that asked.
    pub source_ip: IpAddr,
    /// Destination port of the captured response, i.e. the client's port.
    pub source_port: u16,
    /// Owner name of the answer record that was kept.
    pub query_name: String,
    /// Address carried by that answer; absent for non-address records such as CNAME.
    pub answer_ip: Option<IpAddr>,
}

impl Default for CaptureRecord {
    fn default() -> Self {
        CaptureRecord {
            source_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            source_port: 0,
            query_name: String::new(),
            answer_ip: None,
        }
    }
}

impl fmt::Display for CaptureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {} -> {}",
            self.source_ip,
            self.source_port,
            self.query_name,
            DisplayAnswer(self.answer_ip)
        )
    }
}

/// Renders an optional answer address, `-` when absent.
pub struct DisplayAnswer(pub Option<IpAddr>);

impl fmt::Display for DisplayAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ip) => write!(f, "{ip}"),
            None => f.write_str("-"),
        }
    }
}

/// Where a packet left the pipeline.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum StageKind {
    /// The link or network headers could not be decoded.
    Decode,
    Udp,
    Dns,
    Ipv4,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Matched(CaptureRecord),
    Rejected(StageKind),
}

/// Pipeline runs extraction stages in order and stops at the first one that does not match.
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<(StageKind, Stage)>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::dns_responses()
    }
}

impl Pipeline {
    /// The DNS response pipeline: UDP, then DNS, then IPv4. The cheap transport and protocol
    /// checks run before the address is extracted.
    pub fn dns_responses() -> Self {
        Pipeline {
            stages: vec![
                (StageKind::Udp, stage::udp as Stage),
                (StageKind::Dns, stage::dns as Stage),
                (StageKind::Ipv4, stage::ipv4 as Stage),
            ],
        }
    }

    pub fn run(&self, link: LinkType, data: &[u8]) -> Outcome {
        let Some(layers) = Layers::decode(link, data) else {
            return Outcome::Rejected(StageKind::Decode);
        };
        self.run_layers(&layers)
    }

    pub fn run_layers(&self, layers: &Layers<'_>) -> Outcome {
        let mut record = CaptureRecord::default();
        for (kind, stage) in &self.stages {
            if !stage(layers, &mut record) {
                return Outcome::Rejected(*kind);
            }
        }
        Outcome::Matched(record)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|(kind, _)| kind))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::*;
    use crate::test_helpers::packet::*;

    #[test]
    fn matches_dns_response() {
        let payload = dns_response("svc.internal", &[a("svc.internal", [10, 2, 2, 2])]);
        let frame = udp_ipv4_frame([10, 9, 9, 9], [10, 1, 1, 1], 53, 40000, &payload);
        let Outcome::Matched(record) = Pipeline::default().run(LinkType::Ethernet, &frame) else {
            panic!("expected a match");
        };
        assert_eq!(
            record,
            CaptureRecord {
                source_ip: "10.1.1.1".parse().unwrap(),
                source_port: 40000,
                query_name: "svc.internal".to_string(),
                answer_ip: Some("10.2.2.2".parse().unwrap()),
            }
        );
    }

    #[test]
    fn raw_ip_link() {
        let payload = dns_response("svc.internal", &[a("svc.internal", [10, 2, 2, 2])]);
        let frame = udp_ipv4_frame([10, 9, 9, 9], [10, 1, 1, 1], 53, 40000, &payload);
        // strip the ethernet header
        let outcome = Pipeline::default().run(LinkType::RawIp, &frame[14..]);
        assert!(matches!(outcome, Outcome::Matched(_)), "{outcome:?}");
    }

    #[test]
    fn rejects_tcp() {
        let payload = dns_response("svc.internal", &[a("svc.internal", [10, 2, 2, 2])]);
        let frame = tcp_ipv4_frame([10, 9, 9, 9], [10, 1, 1, 1], 53, 40000, &payload);
        assert_eq!(
            Pipeline::default().run(LinkType::Ethernet, &frame),
            Outcome::Rejected(StageKind::Udp)
        );
    }

    #[test]
    fn rejects_non_dns_udp() {
        let frame = udp_ipv4_frame([10, 9, 9, 9], [10, 1, 1, 1], 123, 40000, b"not dns at all");
        assert_eq!(
            Pipeline::default().run(LinkType::Ethernet, &frame),
            Outcome::Rejected(StageKind::Dns)
        );
    }

    #[test]
    fn rejects_garbage_on_dns_port() {
        let frame = udp_ipv4_frame([10, 9, 9, 9], [10, 1, 1, 1], 53, 40000, &[0xff; 7]);
        assert_eq!(
            Pipeline::default().run(LinkType::Ethernet, &frame),
            Outcome::Rejected(StageKind::Dns)
        );
    }

    #[test]
    fn rejects_ipv6() {
        let payload = dns_response("svc.internal", &[a("svc.internal", [10, 2, 2, 2])]);
        let frame = udp_ipv6_frame(
            Ipv6Addr::LOCALHOST.octets(),
            "fd00::1".parse::<Ipv6Addr>().unwrap().octets(),
            53,
            40000,
            &payload,
        );
        assert_eq!(
            Pipeline::default().run(LinkType::Ethernet, &frame),
            Outcome::Rejected(StageKind::Ipv4)
        );
    }

    #[test]
    fn truncated_packets_do_not_panic() {
        let payload = dns_response("svc.internal", &[a("svc.internal", [10, 2, 2, 2])]);
        let frame = udp_ipv4_frame([10, 9, 9, 9], [10, 1, 1, 1], 53, 40000, &payload);
        for len in 0..frame.len() {
            let outcome = Pipeline::default().run(LinkType::Ethernet, &frame[..len]);
            assert!(matches!(outcome, Outcome::Rejected(_)), "len {len}: {outcome:?}");
        }
        assert_eq!(
            Pipeline::default().run(LinkType::LinuxSll, &[]),
            Outcome::Rejected(StageKind::Decode)
        );
    }

    #[test]
    fn dns_is_decoded_once() {
        let payload = dns_response("svc.internal", &[a("svc.internal", [10, 2, 2, 2])]);
        let frame = udp_ipv4_frame([10, 9, 9, 9], [10, 1, 1, 1], 53, 40000, &payload);
        let layers = Layers::decode(LinkType::Ethernet, &frame).unwrap();
        let first = layers.dns().unwrap() as *const Message;
        let second = layers.dns().unwrap() as *const Message;
        assert_eq!(first, second);
    }
}
