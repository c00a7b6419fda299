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

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use pcap::{Active, Capture, Device, Linktype, Offline};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CaptureSource;
use crate::dispatch::Dispatcher;
use crate::drain::DrainWatcher;
use crate::metrics::IncrementRecorder;
use crate::metrics::pipeline::{Metrics, PacketSeen};
use crate::packet::{LinkType, Outcome, Pipeline, StageKind};
use crate::signal::ShutdownTrigger;

/// Read timeout for live captures, so the stop flag is checked even when the wire is quiet.
const READ_TIMEOUT_MS: i32 = 100;
const SNAPLEN: i32 = 65535;
/// Consecutive read errors after which a live capture gives up.
pub const MAX_READ_ERRORS: u32 = 8;
const READ_RETRY_INITIAL: Duration = Duration::from_millis(10);
const READ_RETRY_MAX: Duration = Duration::from_millis(500);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid interface {0}")]
    InvalidInterface(String),
    #[error("no capture device available")]
    NoDevice,
    #[error("capture error: {0}")]
    Pcap(#[from] pcap::Error),
}

impl Error {
    /// Whether the requested interface, or a default one, could not be found.
    pub fn is_interface_error(&self) -> bool {
        matches!(self, Error::InvalidInterface(_) | Error::NoDevice)
    }
}

/// How a capture loop ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CaptureEnd {
    /// Stopped on request.
    Stopped,
    /// An offline capture was read to the end.
    EndOfFile,
    /// The analyzer queue went away.
    QueueClosed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Summary {
    pub packets: u64,
    pub records: u64,
    pub end: CaptureEnd,
}

/// Frames for the capture loop, one at a time.
pub trait FrameReader {
    fn next_frame(&mut self) -> Result<&[u8], pcap::Error>;
}

enum Handle {
    Live(Capture<Active>),
    Offline(Capture<Offline>),
}

impl Handle {
    fn next_packet(&mut self) -> Result<pcap::Packet<'_>, pcap::Error> {
        match self {
            Handle::Live(cap) => cap.next_packet(),
            Handle::Offline(cap) => cap.next_packet(),
        }
    }

    fn datalink(&self) -> Linktype {
        match self {
            Handle::Live(cap) => cap.get_datalink(),
            Handle::Offline(cap) => cap.get_datalink(),
        }
    }
}

impl FrameReader for Handle {
    fn next_frame(&mut self) -> Result<&[u8], pcap::Error> {
        self.next_packet().map(|packet| packet.data)
    }
}

/// Maps a pcap link type to the framings the pipeline decodes.
pub fn link_type(linktype: Linktype) -> Option<LinkType> {
    match linktype.0 {
        1 => Some(LinkType::Ethernet),
        113 => Some(LinkType::LinuxSll),
        // DLT_RAW has platform dependent values; 101, 228 and 229 are the portable ones.
        12 | 14 | 101 | 228 | 229 => Some(LinkType::RawIp),
        _ => None,
    }
}

pub fn list_interfaces() -> Result<Vec<Device>, Error> {
    Ok(Device::list()?)
}

/// PacketSource is an opened capture: a live device or a capture file.
pub struct PacketSource {
    handle: Handle,
    link: Option<LinkType>,
    name: String,
}

impl PacketSource {
    pub fn open(source: &CaptureSource) -> Result<Self, Error> {
        match source {
            CaptureSource::Live { interface } => Self::open_live(interface.as_deref()),
            CaptureSource::Offline(path) => Self::open_offline(path),
        }
    }

    /// Opens `interface`, or the first available device when none is given.
    pub fn open_live(interface: Option<&str>) -> Result<Self, Error> {
        let device = match interface {
            Some(name) => Device::list()?
                .into_iter()
                .find(|d| d.name == name)
                .ok_or_else(|| Error::InvalidInterface(name.to_string()))?,
            None => Device::lookup()?.ok_or(Error::NoDevice)?,
        };
        let name = device.name.clone();
        info!(interface = %name, "opening live capture");
        let mut cap = Capture::from_device(device)?
            .immediate_mode(true)
            .snaplen(SNAPLEN)
            .timeout(READ_TIMEOUT_MS)
            .open()?;
        cap.filter("udp port 53", true)?;
        Ok(Self::new(Handle::Live(cap), name))
    }

    pub fn open_offline(path: &Path) -> Result<Self, Error> {
        info!(file = %path.display(), "opening capture file");
        let cap = Capture::from_file(path)?;
        Ok(Self::new(Handle::Offline(cap), path.display().to_string()))
    }

    fn new(handle: Handle, name: String) -> Self {
        let datalink = handle.datalink();
        let link = link_type(datalink);
        if link.is_none() {
            warn!(
                source = %name,
                linktype = datalink.0,
                "unsupported link type, no packet will match"
            );
        }
        PacketSource { handle, link, name }
    }

    pub fn link(&self) -> Option<LinkType> {
        self.link
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_live(&self) -> bool {
        matches!(self.handle, Handle::Live(_))
    }

    /// Reads packets until `stop` is set, the file ends, or the queue closes. Blocks the thread.
    pub fn run(
        self,
        pipeline: &Pipeline,
        dispatcher: &Dispatcher,
        metrics: &Metrics,
        stop: &AtomicBool,
    ) -> Result<Summary, Error> {
        let live = self.is_live();
        let PacketSource {
            mut handle, link, ..
        } = self;
        read_loop(&mut handle, live, link, pipeline, dispatcher, metrics, stop)
    }

    /// Runs the capture loop on a blocking thread. The loop stops when `drain` is signaled; an
    /// offline capture that reaches its end, or a capture that fails, requests a shutdown.
    pub fn spawn(
        self,
        pipeline: Pipeline,
        dispatcher: Dispatcher,
        metrics: Arc<Metrics>,
        drain: DrainWatcher,
        shutdown: ShutdownTrigger,
    ) -> JoinHandle<Option<Summary>> {
        let stop = Arc::new(AtomicBool::new(false));
        let name = self.name.clone();
        let mut blocking = tokio::task::spawn_blocking({
            let stop = stop.clone();
            move || self.run(&pipeline, &dispatcher, &metrics, &stop)
        });
        tokio::spawn(async move {
            let res = tokio::select! {
                res = &mut blocking => res,
                _ = drain.signaled() => {
                    debug!(source = %name, "stopping capture");
                    stop.store(true, Ordering::Relaxed);
                    blocking.await
                }
            };
            let summary = match res {
                Ok(Ok(summary)) => {
                    info!(
                        source = %name,
                        packets = summary.packets,
                        records = summary.records,
                        "capture finished ({:?})",
                        summary.end
                    );
                    if summary.end != CaptureEnd::Stopped {
                        shutdown.shutdown_now();
                    }
                    Some(summary)
                }
                Ok(Err(e)) => {
                    error!(source = %name, "capture failed: {e}");
                    shutdown.shutdown_now();
                    None
                }
                Err(e) => {
                    error!(source = %name, "capture task failed: {e}");
                    shutdown.shutdown_now();
                    None
                }
            };
            drop(drain);
            summary
        })
    }
}

/// The capture loop. A live reader retries read errors with a growing pause and fails after
/// [MAX_READ_ERRORS] in a row; any read error ends an offline reader.
pub fn read_loop<R: FrameReader>(
    reader: &mut R,
    live: bool,
    link: Option<LinkType>,
    pipeline: &Pipeline,
    dispatcher: &Dispatcher,
    metrics: &Metrics,
    stop: &AtomicBool,
) -> Result<Summary, Error> {
    let mut summary = Summary {
        packets: 0,
        records: 0,
        end: CaptureEnd::Stopped,
    };
    let mut errors = 0;
    let mut retry = READ_RETRY_INITIAL;
    loop {
        if stop.load(Ordering::Relaxed) {
            summary.end = CaptureEnd::Stopped;
            return Ok(summary);
        }
        let data = match reader.next_frame() {
            Ok(data) => data,
            Err(pcap::Error::TimeoutExpired) => {
                errors = 0;
                retry = READ_RETRY_INITIAL;
                continue;
            }
            Err(pcap::Error::NoMorePackets) => {
                summary.end = CaptureEnd::EndOfFile;
                return Ok(summary);
            }
            Err(e) if live => {
                errors += 1;
                if errors >= MAX_READ_ERRORS {
                    return Err(e.into());
                }
                warn!(errors, "error reading packet: {e}, retrying in {:?}", retry);
                std::thread::sleep(retry);
                retry = std::cmp::min(READ_RETRY_MAX, retry * 2);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        errors = 0;
        retry = READ_RETRY_INITIAL;
        summary.packets += 1;
        metrics.increment(&PacketSeen);
        let outcome = match link {
            Some(link) => pipeline.run(link, data),
            None => Outcome::Rejected(StageKind::Decode),
        };
        match outcome {
            Outcome::Matched(record) => {
                summary.records += 1;
                if dispatcher.submit(record).is_err() {
                    summary.end = CaptureEnd::QueueClosed;
                    return Ok(summary);
                }
            }
            Outcome::Rejected(stage) => metrics.increment(&stage),
        }
    }
}
