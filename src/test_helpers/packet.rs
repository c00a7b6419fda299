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

//! Builders for the frames and DNS messages the pipeline tests feed in.

use std::net::{Ipv4Addr, Ipv6Addr};

use etherparse::PacketBuilder;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::{A, AAAA, CNAME};
use hickory_proto::rr::{Name, RData, Record, RecordType};

const TTL: u32 = 30;
const SRC_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
const DST_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];

fn name(n: &str) -> Name {
    Name::from_ascii(n).unwrap()
}

pub fn a(owner: &str, ip: [u8; 4]) -> Record {
    Record::from_rdata(name(owner), TTL, RData::A(A::from(Ipv4Addr::from(ip))))
}

pub fn aaaa(owner: &str, ip: &str) -> Record {
    let ip: Ipv6Addr = ip.parse().unwrap();
    Record::from_rdata(name(owner), TTL, RData::AAAA(AAAA::from(ip)))
}

pub fn cname(owner: &str, target: &str) -> Record {
    Record::from_rdata(name(owner), TTL, RData::CNAME(CNAME(name(target))))
}

/// An answer with zero length RDATA.
pub fn empty(owner: &str) -> Record {
    Record::update0(name(owner), TTL, RecordType::A)
}

/// A response to a single A question.
pub fn dns_response(question: &str, answers: &[Record]) -> Vec<u8> {
    dns_with_questions(&[question], answers)
}

pub fn dns_with_questions(questions: &[&str], answers: &[Record]) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(4242)
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .set_recursion_available(true);
    for q in questions {
        msg.add_query(Query::query(name(q), RecordType::A));
    }
    msg.add_answers(answers.iter().cloned());
    msg.to_vec().unwrap()
}

pub fn udp_ipv4_frame(
    src: [u8; 4],
    dst: [u8; 4],
    sport: u16,
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv4(src, dst, 64)
        .udp(sport, dport);
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, payload).unwrap();
    out
}

pub fn tcp_ipv4_frame(
    src: [u8; 4],
    dst: [u8; 4],
    sport: u16,
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv4(src, dst, 64)
        .tcp(sport, dport, 1, 65535);
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, payload).unwrap();
    out
}

pub fn udp_ipv6_frame(
    src: [u8; 16],
    dst: [u8; 16],
    sport: u16,
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv6(src, dst, 64)
        .udp(sport, dport);
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, payload).unwrap();
    out
}

/// A DNS response from `server` to `client`'s ephemeral port, answering `query` with `answer`.
pub fn answer_frame(client: [u8; 4], server: [u8; 4], query: &str, answer: [u8; 4]) -> Vec<u8> {
    let payload = dns_response(query, &[a(query, answer)]);
    udp_ipv4_frame(server, client, 53, 40000, &payload)
}
