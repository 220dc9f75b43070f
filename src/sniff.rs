// src/sniff.rs
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender, TrySendError};
use pcap::{Activated, Capture, Device, Linktype, Packet, PacketHeader};

use crate::config::SensorConfig;
use crate::error::{Result, SensorError};
use crate::events::{EventBus, SensorEvent};
use crate::models::domain::{DeviceInfo, PacketRecord, RawFrame};
use crate::parser::dissect;

/// How long `start`/`load_from_file` wait for the backend to open a source.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const NO_IP: &str = "No IP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
    Replaying,
    /// A file replay delivered its last frame.
    Complete,
}

enum Source {
    Live { device: String, filter: String },
    File(PathBuf),
}

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// State shared between the session and its delivery thread.
struct Shared {
    frames: Mutex<Vec<RawFrame>>,
    frame_count: AtomicU64,
    sinks: Mutex<Vec<Sender<PacketRecord>>>,
    state: Mutex<CaptureState>,
    events: EventBus,
}

impl Shared {
    fn deliver(&self, data: &[u8], linktype: Linktype, timestamp: DateTime<Utc>, orig_len: u32) -> PacketRecord {
        let number = self.frame_count.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.frames).push(RawFrame {
            data: data.to_vec(),
            linktype,
            timestamp,
            orig_len,
        });

        let record = dissect(data, linktype, number, timestamp);
        lock(&self.sinks).retain(|tx| !matches!(tx.try_send(record.clone()), Err(TrySendError::Disconnected(_))));
        record
    }

    fn set_state(&self, state: CaptureState) {
        *lock(&self.state) = state;
    }

    fn report(&self, message: String) {
        tracing::error!("{}", message);
        self.events.publish(SensorEvent::capture_error(message));
    }
}

/// Owns one capture source at a time (a live device or a capture file),
/// dissects every frame it delivers and keeps the raw frames for export.
pub struct CaptureSession {
    shared: Arc<Shared>,
    worker: Option<Worker>,
    snaplen: i32,
    read_timeout_ms: i32,
}

impl CaptureSession {
    pub fn new(config: &SensorConfig, events: EventBus) -> Self {
        CaptureSession {
            shared: Arc::new(Shared {
                frames: Mutex::new(Vec::new()),
                frame_count: AtomicU64::new(0),
                sinks: Mutex::new(Vec::new()),
                state: Mutex::new(CaptureState::Idle),
                events,
            }),
            worker: None,
            snaplen: config.snaplen,
            read_timeout_ms: config.read_timeout_ms,
        }
    }

    /// Forward every dissected packet to `sink`. Delivery never blocks: a
    /// full sink misses the packet, a disconnected one is dropped.
    pub fn add_packet_sink(&self, sink: Sender<PacketRecord>) {
        lock(&self.shared.sinks).push(sink);
    }

    pub fn state(&self) -> CaptureState {
        *lock(&self.shared.state)
    }

    /// Capture live from `device` in promiscuous mode, optionally behind a BPF filter.
    ///
    /// Any running source is stopped first. Failures are published as
    /// [`SensorEvent::CaptureError`] and leave the session idle.
    pub fn start(&mut self, device: &str, filter: &str) -> Result<()> {
        self.stop();
        self.reset();
        let source = Source::Live {
            device: device.to_string(),
            filter: filter.trim().to_string(),
        };
        self.launch(source, CaptureState::Capturing).map_err(|e| {
            self.shared.report(format!("Error starting capture: {}", e));
            e
        })?;
        tracing::info!(device, filter, "capture started");
        Ok(())
    }

    /// Replay a capture file in the background. Completion is announced with
    /// [`SensorEvent::ReplayComplete`].
    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.stop();
        self.reset();
        let path = path.as_ref().to_path_buf();
        self.launch(Source::File(path.clone()), CaptureState::Replaying).map_err(|e| {
            self.shared.report(format!("Error opening capture file: {}", e));
            e
        })?;
        tracing::info!(path = %path.display(), "replaying capture file");
        Ok(())
    }

    /// Stop delivery and release the source. Safe to call at any time.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::SeqCst);
            if worker.handle.join().is_err() {
                tracing::error!("capture thread panicked");
            }
            tracing::info!(frames = self.retained_frames(), "capture stopped");
        }
        self.shared.set_state(CaptureState::Idle);
    }

    /// Deliver one frame as if the backend had captured it.
    pub fn ingest_frame(
        &self,
        data: &[u8],
        linktype: Linktype,
        timestamp: DateTime<Utc>,
        orig_len: u32,
    ) -> PacketRecord {
        self.shared.deliver(data, linktype, timestamp, orig_len)
    }

    pub fn retained_frames(&self) -> usize {
        lock(&self.shared.frames).len()
    }

    /// Point-in-time copy of the retained frames, in capture order.
    pub fn snapshot(&self) -> Vec<RawFrame> {
        lock(&self.shared.frames).clone()
    }

    /// Write retained frames to a pcap file. Returns how many were written;
    /// nothing is created when no frames were captured.
    ///
    /// A pcap file has a single link type, taken from the first retained
    /// frame. Frames injected with any other link type are left out.
    pub fn export_to_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let frames = self.snapshot();
        if frames.is_empty() {
            return Ok(0);
        }
        let written = write_savefile(path.as_ref(), &frames).map_err(|e| {
            self.shared.report(format!("Error saving capture file: {}", e));
            e
        })?;
        if written < frames.len() {
            tracing::warn!(
                skipped = frames.len() - written,
                "frames with a different link type were not exported"
            );
        }
        tracing::info!(frames = written, path = %path.as_ref().display(), "capture exported");
        Ok(written)
    }

    fn reset(&self) {
        self.shared.frame_count.store(0, Ordering::Relaxed);
        lock(&self.shared.frames).clear();
    }

    fn launch(&mut self, source: Source, state: CaptureState) -> Result<()> {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let shared = self.shared.clone();
        let flag = running.clone();
        let (snaplen, timeout) = (self.snaplen, self.read_timeout_ms);

        // set before the thread exists so a short replay cannot be overwritten
        self.shared.set_state(state);

        // the capture handle is opened on the delivery thread and never leaves it
        let spawned = thread::Builder::new()
            .name("capture".into())
            .spawn(move || match source {
                Source::Live { device, filter } => match open_live(&device, &filter, snaplen, timeout) {
                    Ok(cap) => {
                        let _ = ready_tx.send(Ok(()));
                        pump(cap, &shared, &flag, false);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                },
                Source::File(path) => match Capture::from_file(&path) {
                    Ok(cap) => {
                        let _ = ready_tx.send(Ok(()));
                        pump(cap, &shared, &flag, true);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                    }
                },
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.set_state(CaptureState::Idle);
                return Err(e.into());
            }
        };

        let opened = ready_rx
            .recv_timeout(OPEN_TIMEOUT)
            .unwrap_or_else(|_| Err(SensorError::Capture(pcap::Error::TimeoutExpired)));

        match opened {
            Ok(()) => {
                self.worker = Some(Worker { running, handle });
                Ok(())
            }
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                // a backend still stuck in open is left to finish on its own
                if handle.is_finished() {
                    let _ = handle.join();
                }
                self.shared.set_state(CaptureState::Idle);
                Err(e)
            }
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_live(device: &str, filter: &str, snaplen: i32, timeout_ms: i32) -> Result<Capture<pcap::Active>> {
    let mut cap = Capture::from_device(device)?
        .promisc(true)
        .snaplen(snaplen)
        .timeout(timeout_ms)
        .open()?;

    if !filter.is_empty() {
        cap.filter(filter, true)?;
    }
    Ok(cap)
}

/// Delivery loop. Read timeouts only give the stop flag a chance to be seen.
fn pump<T: Activated + ?Sized>(mut cap: Capture<T>, shared: &Shared, running: &AtomicBool, replay: bool) {
    let linktype = cap.get_datalink();

    while running.load(Ordering::SeqCst) {
        match cap.next() {
            Ok(packet) => {
                let ts = packet.header.ts;
                let timestamp = DateTime::from_timestamp(ts.tv_sec as i64, (ts.tv_usec as u32).saturating_mul(1000))
                    .unwrap_or_else(Utc::now);
                shared.deliver(packet.data, linktype, timestamp, packet.header.len);
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => {
                let what = if replay { "Error reading capture file" } else { "Capture error" };
                shared.report(format!("{}: {}", what, e));
                shared.set_state(CaptureState::Idle);
                return;
            }
        }
    }

    if replay && running.load(Ordering::SeqCst) {
        shared.set_state(CaptureState::Complete);
        tracing::info!(frames = lock(&shared.frames).len(), "replay complete");
        shared.events.publish(SensorEvent::replay_complete());
    }
}

fn write_savefile(path: &Path, frames: &[RawFrame]) -> Result<usize> {
    let linktype = frames[0].linktype;
    let dead = Capture::dead(linktype)?;
    let mut savefile = dead.savefile(path)?;
    let mut written = 0;

    for frame in frames.iter().filter(|f| f.linktype == linktype) {
        let header = PacketHeader {
            ts: libc::timeval {
                tv_sec: frame.timestamp.timestamp() as libc::time_t,
                tv_usec: frame.timestamp.timestamp_subsec_micros() as libc::suseconds_t,
            },
            caplen: frame.data.len() as u32,
            len: frame.orig_len.max(frame.data.len() as u32),
        };
        savefile.write(&Packet::new(&header, &frame.data));
        written += 1;
    }
    // the dump file is flushed and closed on drop
    drop(savefile);
    Ok(written)
}

/// Every capture-capable device the backend reports.
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    Ok(Device::list()?.into_iter().map(device_info).collect())
}

fn device_info(device: Device) -> DeviceInfo {
    let description = device.desc.unwrap_or_default();
    let friendly_name = description
        .replace("Network adapter '", "")
        .replace("' on local host", "");
    let ip_address = device
        .addresses
        .iter()
        .find(|a| a.addr.is_ipv4())
        .map(|a| a.addr.to_string())
        .unwrap_or_else(|| NO_IP.to_string());

    DeviceInfo {
        name: device.name,
        description,
        friendly_name,
        ip_address,
    }
}

/// Pick the device to monitor.
///
/// An explicit `preferred` name must exist. Otherwise the first physical
/// looking interface with a routable IPv4 wins, then any non-loopback one,
/// then whatever comes first.
pub fn select_device(devices: &[DeviceInfo], preferred: Option<&str>) -> Result<DeviceInfo> {
    if devices.is_empty() {
        return Err(SensorError::NoDevices);
    }

    if let Some(name) = preferred {
        return devices
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| SensorError::DeviceNotFound(name.to_string()));
    }

    let not_loopback = |d: &&DeviceInfo| {
        !d.name.contains("Loopback") && !d.name.starts_with("lo") && !d.description.contains("Loopback")
    };
    let physical = |d: &&DeviceInfo| {
        !d.description.is_empty()
            && !d.description.contains("WAN Miniport")
            && !d.description.contains("Virtual")
    };

    let chosen = devices
        .iter()
        .filter(not_loopback)
        .find(|d| physical(d) && has_routable_ipv4(d))
        .or_else(|| devices.iter().filter(not_loopback).find(|d| !d.description.contains("WAN Miniport")))
        .unwrap_or(&devices[0]);
    Ok(chosen.clone())
}

fn has_routable_ipv4(device: &DeviceInfo) -> bool {
    let ip = device.ip_address.as_str();
    ip != NO_IP && !ip.starts_with("169.254.") && ip != "0.0.0.0" && ip != "127.0.0.1"
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
