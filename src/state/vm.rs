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
use std::io::BufRead;
use std::net::{AddrParseError, IpAddr};

use thiserror::Error;
use tracing::warn;

use crate::strng;
use crate::strng::Strng;

const IP_FIELD: usize = 0;
const APP_FIELD: usize = 2;
const OWNER_FIELD: usize = 3;
const MIN_FIELDS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub app: Strng,
    /// Carried in the dataset but not used for attribution.
    pub owner: Strng,
}

/// A VmStore holds the static VM inventory, keyed by address.
#[derive(Default, Debug)]
pub struct VmStore {
    by_addr: HashMap<IpAddr, VmInfo>,
}

impl VmStore {
    pub fn insert(&mut self, ip: IpAddr, info: VmInfo) -> Option<VmInfo> {
        self.by_addr.insert(ip, info)
    }

    pub fn find_address(&self, ip: &IpAddr) -> Option<&VmInfo> {
        self.by_addr.get(ip)
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LineError {
    #[error("expected at least {MIN_FIELDS} space separated fields, got {0}")]
    TooFewFields(usize),
    #[error("invalid address {0:?}: {1}")]
    Address(String, #[source] AddrParseError),
}

/// Parses one dataset line: `<ip> <ignored> <app> <owner> ...`, single space separated.
pub fn parse_line(line: &str) -> Result<(IpAddr, VmInfo), LineError> {
    let fields: Vec<&str> = line.split(' ').collect();
    if fields.len() < MIN_FIELDS {
        return Err(LineError::TooFewFields(fields.len()));
    }
    let raw_ip = fields[IP_FIELD];
    let ip = raw_ip
        .parse()
        .map_err(|e| LineError::Address(raw_ip.to_string(), e))?;
    Ok((
        ip,
        VmInfo {
            app: strng::new(fields[APP_FIELD]),
            owner: strng::new(fields[OWNER_FIELD]),
        },
    ))
}

/// Reads every line of the dataset until EOF, including a final line without a newline.
/// Blank lines are ignored and malformed lines are skipped with a warning; only I/O errors fail.
pub fn read_dataset<R: BufRead>(reader: R) -> std::io::Result<Vec<(IpAddr, VmInfo)>> {
    let mut entries = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(line = idx + 1, "skipping malformed vm record: {e}"),
        }
    }
    Ok(entries)
}
