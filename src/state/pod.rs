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

use std::collections::HashMap;
use std::net::IpAddr;

use crate::strng::Strng;

/// A PodStore maps pod addresses to pod names and back.
///
/// Both directions are kept in agreement: for every `ip -> name` entry, `name -> Some(ip)` holds,
/// and the reverse. Pods that are known but have no address yet map to `None`.
#[derive(Default, Debug)]
pub struct PodStore {
    /// by_addr maps a pod address to the pod currently holding it
    by_addr: HashMap<IpAddr, Strng>,
    /// by_name maps a pod name to its address, if it has one
    by_name: HashMap<Strng, Option<IpAddr>>,
}

impl PodStore {
    /// Records `name` without an address. Returns the address it held before, if any.
    pub fn insert_pending(&mut self, name: Strng) -> Option<IpAddr> {
        let prev = self.by_name.insert(name.clone(), None).flatten();
        if let Some(prev) = prev {
            self.release_addr(&prev, &name);
        }
        prev
    }

    /// Assigns `ip` to `name`, creating the pod if needed. Returns the previous address.
    ///
    /// Any stale reverse entry for the previous address is dropped, and if another pod still
    /// claimed `ip` it loses the address.
    pub fn set_ip(&mut self, name: Strng, ip: IpAddr) -> Option<IpAddr> {
        let prev = self.by_name.insert(name.clone(), Some(ip)).flatten();
        if let Some(prev) = prev
            && prev != ip
        {
            self.release_addr(&prev, &name);
        }
        if let Some(holder) = self.by_addr.insert(ip, name.clone())
            && holder != name
            && let Some(entry) = self.by_name.get_mut(&holder)
        {
            *entry = None;
        }
        prev
    }

    /// Removes a pod. Returns `None` if it was unknown, otherwise the address it held.
    pub fn remove(&mut self, name: &str) -> Option<Option<IpAddr>> {
        let prev = self.by_name.remove(name)?;
        if let Some(ip) = prev {
            self.release_addr(&ip, name);
        }
        Some(prev)
    }

    pub fn find_address(&self, ip: &IpAddr) -> Option<&Strng> {
        self.by_addr.get(ip)
    }

    pub fn find_name(&self, name: &str) -> Option<Option<IpAddr>> {
        self.by_name.get(name).copied()
    }

    pub fn len_addresses(&self) -> usize {
        self.by_addr.len()
    }

    pub fn len_names(&self) -> usize {
        self.by_name.len()
    }

    // Only drop the reverse entry if it still belongs to this pod; the address may have been
    // reassigned already.
    fn release_addr(&mut self, ip: &IpAddr, name: &str) {
        if self.by_addr.get(ip).is_some_and(|holder| holder.as_str() == name) {
            self.by_addr.remove(ip);
        }
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn assert_consistent(&self) {
        for (ip, name) in &self.by_addr {
            assert_eq!(
                self.by_name.get(name),
                Some(&Some(*ip)),
                "{ip} -> {name} has no matching reverse entry"
            );
        }
        for (name, ip) in &self.by_name {
            if let Some(ip) = ip {
                assert_eq!(
                    self.by_addr.get(ip),
                    Some(name),
                    "{name} -> {ip} has no matching reverse entry"
                );
            }
        }
    }
}
