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
use std::io::{self, Write};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace};

use crate::config::OutputFormat;
use crate::metrics::IncrementRecorder;
use crate::metrics::pipeline::{AttributionResult, Metrics};
use crate::packet::{CaptureRecord, DisplayAnswer};
use crate::state::{IdentityStore, Table};
use crate::strng::Strng;

/// The outcome of resolving one capture record against the identity tables.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum Attribution {
    Resolved {
        app: Strng,
        /// The table that knew the address.
        source: Table,
        source_ip: IpAddr,
        source_port: u16,
        query: String,
        answer_ip: Option<IpAddr>,
    },
    Unresolved {
        source_ip: IpAddr,
        source_port: u16,
        query: String,
        answer_ip: Option<IpAddr>,
    },
}

impl Attribution {
    pub fn source_ip(&self) -> IpAddr {
        match self {
            Attribution::Resolved { source_ip, .. } | Attribution::Unresolved { source_ip, .. } => {
                *source_ip
            }
        }
    }

    pub fn app(&self) -> Option<&Strng> {
        match self {
            Attribution::Resolved { app, .. } => Some(app),
            Attribution::Unresolved { .. } => None,
        }
    }
}

impl fmt::Display for Attribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribution::Resolved {
                app,
                source_ip,
                query,
                answer_ip,
                ..
            } => write!(
                f,
                "Capture: app {app} ip {source_ip} query {query} answered by {}",
                DisplayAnswer(*answer_ip)
            ),
            Attribution::Unresolved { source_ip, .. } => write!(f, "unKnown src ip {source_ip}"),
        }
    }
}

/// Reporter receives every attribution the analyzer produces.
pub trait Reporter: Send + Sync + 'static {
    fn report(&self, attribution: &Attribution);
}

/// Writes one line per attribution, as text or as a JSON object.
pub struct LineReporter<W> {
    format: OutputFormat,
    out: Mutex<W>,
}

impl LineReporter<io::Stdout> {
    pub fn stdout(format: OutputFormat) -> Self {
        Self::new(format, io::stdout())
    }
}

impl<W: Write> LineReporter<W> {
    pub fn new(format: OutputFormat, out: W) -> Self {
        Self {
            format,
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_line(&self, attribution: &Attribution) -> io::Result<()> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        match self.format {
            OutputFormat::Plain => writeln!(out, "{attribution}")?,
            OutputFormat::Json => {
                serde_json::to_writer(&mut *out, attribution)?;
                writeln!(out)?;
            }
        }
        out.flush()
    }
}

impl<W: Write + Send + 'static> Reporter for LineReporter<W> {
    fn report(&self, attribution: &Attribution) {
        if let Err(e) = self.write_line(attribution) {
            debug!("failed to write attribution: {e}");
        }
    }
}

/// Analyzer resolves capture records to the workload that issued the query.
#[derive(Clone)]
pub struct Analyzer {
    store: IdentityStore,
    reporter: Arc<dyn Reporter>,
    metrics: Arc<Metrics>,
}

impl Analyzer {
    pub fn new(store: IdentityStore, reporter: Arc<dyn Reporter>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            reporter,
            metrics,
        }
    }

    pub fn analyze(&self, record: CaptureRecord) -> Attribution {
        let owner = self.store.lookup(&record.source_ip);
        self.metrics
            .increment(&AttributionResult::from(owner.as_ref().map(|o| o.table)));
        let attribution = match owner {
            Some(owner) => {
                trace!(app = %owner.app, table = %owner.table, %record, "resolved");
                Attribution::Resolved {
                    app: owner.app,
                    source: owner.table,
                    source_ip: record.source_ip,
                    source_port: record.source_port,
                    query: record.query_name,
                    answer_ip: record.answer_ip,
                }
            }
            None => {
                debug!(%record, "unknown source ip");
                Attribution::Unresolved {
                    source_ip: record.source_ip,
                    source_port: record.source_port,
                    query: record.query_name,
                    answer_ip: record.answer_ip,
                }
            }
        };
        self.reporter.report(&attribution);
        attribution
    }
}

impl fmt::Debug for Analyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Analyzer").finish_non_exhaustive()
    }
}
