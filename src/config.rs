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
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

const DNSATTR_WORKERS: &str = "DNSATTR_WORKERS";
const DNSATTR_QUEUE_CAPACITY: &str = "DNSATTR_QUEUE_CAPACITY";
const QUEUE_FULL_POLICY: &str = "QUEUE_FULL_POLICY";
const RESYNC_PERIOD: &str = "RESYNC_PERIOD";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";
const OUTPUT_FORMAT: &str = "OUTPUT_FORMAT";

const DEFAULT_CONFIG_DIR: &str = "/opt/dns-an/config";
const DEFAULT_VM_DATASET: &str = "/opt/dns-an/data.txt";
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_QUEUE_CAPACITY: usize = 4096;
const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(30 * 60);
const DEFAULT_DRAIN_DURATION: Duration = Duration::from_secs(5);

/// Command line flags.
#[derive(Parser, Debug, Clone, Default, PartialEq, Eq)]
#[command(name = "dnsattr", version, about = "Attribute DNS traffic to the workloads issuing it")]
pub struct Args {
    /// Interface to capture on. Empty selects the first available device.
    #[arg(short = 'i', long = "interface", default_value = "")]
    pub interface: String,

    /// Read packets from a capture file instead of a live interface.
    #[arg(short = 'r', long = "read")]
    pub read: Option<PathBuf>,

    /// Directory holding one kubeconfig file per cluster.
    #[arg(short = 'd', long = "config-dir", default_value = DEFAULT_CONFIG_DIR)]
    pub config_dir: PathBuf,

    /// VM dataset file.
    #[arg(short = 'f', long = "vm-file", default_value = DEFAULT_VM_DATASET)]
    pub vm_file: PathBuf,

    /// Print the capture devices and exit.
    #[arg(long = "list-interfaces")]
    pub list_interfaces: bool,
}

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CaptureSource {
    /// Capture from a device. `None` picks the first available one.
    Live { interface: Option<String> },
    /// Replay a capture file, then shut down.
    Offline(PathBuf),
}

/// What the capture loop does when the analyzer queue is full.
#[derive(serde::Serialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum QueueFullPolicy {
    /// Drop the record that did not fit, and count it.
    DropNewest,
    /// Wait for room.
    Block,
}

impl FromStr for QueueFullPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop-newest" => Ok(QueueFullPolicy::DropNewest),
            "block" => Ok(QueueFullPolicy::Block),
            _ => Err(()),
        }
    }
}

impl fmt::Display for QueueFullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueueFullPolicy::DropNewest => "drop-newest",
            QueueFullPolicy::Block => "block",
        })
    }
}

#[derive(serde::Serialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Plain,
    Json,
}

impl FromStr for OutputFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "" => Ok(OutputFormat::Plain),
            "json" => Ok(OutputFormat::Json),
            _ => Err(()),
        }
    }
}

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub capture: CaptureSource,
    /// Kubeconfig files in this directory each get their own pod watch.
    pub kube_config_dir: PathBuf,
    pub vm_dataset: PathBuf,

    /// Number of analyzer workers.
    pub workers: usize,
    pub queue_capacity: usize,
    pub queue_full_policy: QueueFullPolicy,

    /// How often each pod watch is torn down and re-established.
    pub resync_period: Duration,
    pub termination_grace_period: Duration,

    pub output_format: OutputFormat,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// GoDuration wraps a Duration to accept golang style durations such as `30m` or `1h30m`.
struct GoDuration(Duration);

impl FromStr for GoDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s)
            .map(GoDuration)
            .map_err(|e| e.to_string())
    }
}

fn parse<T: FromStr>(env: &str) -> Result<Option<T>, Error> {
    match std::env::var(env) {
        Ok(val) => val
            .parse()
            .map(|v| Some(v))
            .map_err(|_| Error::EnvVar(env.to_string(), val)),
        Err(_) => Ok(None),
    }
}

fn parse_default<T: FromStr>(env: &str, default: T) -> Result<T, Error> {
    parse(env).map(|v| v.unwrap_or(default))
}

fn non_zero(name: &'static str, v: usize) -> Result<usize, Error> {
    if v == 0 {
        return Err(Error::Zero(name));
    }
    Ok(v)
}

pub fn parse_config(args: Args) -> Result<Config, Error> {
    construct_config(args)
}

pub fn construct_config(args: Args) -> Result<Config, Error> {
    let capture = match args.read {
        Some(path) => CaptureSource::Offline(path),
        None => CaptureSource::Live {
            interface: empty_to_none(Some(args.interface)),
        },
    };
    // Reading a file must not lose records, so it always waits for the workers.
    let queue_full_policy = match capture {
        CaptureSource::Offline(_) => QueueFullPolicy::Block,
        CaptureSource::Live { .. } => {
            parse_default(QUEUE_FULL_POLICY, QueueFullPolicy::DropNewest)?
        }
    };

    Ok(Config {
        capture,
        kube_config_dir: args.config_dir,
        vm_dataset: args.vm_file,
        workers: non_zero(
            DNSATTR_WORKERS,
            parse_default(DNSATTR_WORKERS, DEFAULT_WORKERS)?,
        )?,
        queue_capacity: non_zero(
            DNSATTR_QUEUE_CAPACITY,
            parse_default(DNSATTR_QUEUE_CAPACITY, DEFAULT_QUEUE_CAPACITY)?,
        )?,
        queue_full_policy,
        resync_period: parse(RESYNC_PERIOD)?
            .map(|gd: GoDuration| gd.0)
            .unwrap_or(DEFAULT_RESYNC_PERIOD),
        termination_grace_period: parse(TERMINATION_GRACE_PERIOD)?
            .map(|gd: GoDuration| gd.0)
            .unwrap_or(DEFAULT_DRAIN_DURATION),
        output_format: parse_default(OUTPUT_FORMAT, OutputFormat::Plain)?,
    })
}

pub fn empty_to_none<A: AsRef<str>>(inp: Option<A>) -> Option<A> {
    if let Some(inner) = &inp
        && inner.as_ref().is_empty()
    {
        return None;
    }
    inp
}
