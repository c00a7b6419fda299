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

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};

use dnsattr::packet::{LinkType, Outcome, Pipeline};
use dnsattr::state::IdentityStore;
use dnsattr::strng;
use dnsattr::test_helpers::packet::*;

pub fn pipeline(c: &mut Criterion) {
    let mut c = c.benchmark_group("pipeline");
    c.measurement_time(Duration::from_secs(5));
    c.throughput(Throughput::Elements(1));

    let pipeline = Pipeline::default();
    let response = answer_frame([10, 1, 1, 1], [10, 9, 9, 9], "svc.internal", [10, 2, 2, 2]);
    let payload = dns_response(
        "svc.internal",
        &[
            cname("svc.internal", "lb.internal"),
            a("lb.internal", [10, 2, 2, 2]),
            a("lb.internal", [10, 2, 2, 3]),
        ],
    );
    let chained = udp_ipv4_frame([10, 9, 9, 9], [10, 1, 1, 1], 53, 40000, &payload);
    let tcp = tcp_ipv4_frame([10, 9, 9, 9], [10, 1, 1, 1], 443, 40000, b"not dns");

    c.bench_function("single-answer", |b| {
        b.iter(|| {
            assert!(matches!(
                pipeline.run(LinkType::Ethernet, &response),
                Outcome::Matched(_)
            ))
        })
    });
    c.bench_function("cname-chain", |b| {
        b.iter(|| {
            assert!(matches!(
                pipeline.run(LinkType::Ethernet, &chained),
                Outcome::Matched(_)
            ))
        })
    });
    c.bench_function("reject-tcp", |b| {
        b.iter(|| {
            assert!(matches!(
                pipeline.run(LinkType::Ethernet, &tcp),
                Outcome::Rejected(_)
            ))
        })
    });
}

pub fn identity(c: &mut Criterion) {
    let mut c = c.benchmark_group("identity");
    c.measurement_time(Duration::from_secs(5));
    const POD_COUNT: usize = 1000;

    let store = IdentityStore::new();
    for i in 0..POD_COUNT {
        store.pod_ip_changed(strng::format!("pod-{i}"), pod_ip(i));
    }
    c.bench_function("lookup", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % POD_COUNT;
            store.lookup(&pod_ip(i))
        })
    });
    c.bench_function("churn", |b| {
        b.iter(|| {
            let store = IdentityStore::new();
            for i in 0..POD_COUNT {
                store.pod_added(strng::format!("pod-{i}"));
                store.pod_ip_changed(strng::format!("pod-{i}"), pod_ip(i));
            }
            for i in 0..POD_COUNT {
                store.pod_removed(&format!("pod-{i}"));
            }
        })
    });
}

fn pod_ip(i: usize) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, (i / 255) as u8, (i % 255) as u8))
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = pipeline, identity
}

criterion_main!(benches);
