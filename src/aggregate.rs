use std::collections::HashSet;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::config::DEFAULT_PORT_WHITELIST;
use crate::models::domain::{FeatureVector, PacketRecord};

/// Ports below this are treated as service ports when deciding traffic direction.
const SERVICE_PORT_LIMIT: u16 = 1024;

/// Ratio reported when a window has outbound bytes but no inbound ones.
const OUTBOUND_ONLY_RATIO: f64 = 10.0;

/// Buffers dissected packets between capture and the detection tick and
/// reduces each window to a [`FeatureVector`].
pub struct FeatureAggregator {
    tx: Sender<PacketRecord>,
    rx: Receiver<PacketRecord>,
    port_whitelist: Vec<u16>,
}

impl FeatureAggregator {
    pub fn new(port_whitelist: Vec<u16>) -> Self {
        let (tx, rx) = unbounded();
        FeatureAggregator {
            tx,
            rx,
            port_whitelist,
        }
    }

    /// Producer handle for the ingestion queue. Sending never blocks.
    pub fn sender(&self) -> Sender<PacketRecord> {
        self.tx.clone()
    }

    pub fn ingest(&self, packet: PacketRecord) {
        // we hold a receiver ourselves, so the queue cannot be disconnected
        let _ = self.tx.send(packet);
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Drains the queue until it is empty and reduces what was taken.
    ///
    /// Never blocks the producer; packets sent while draining may land in
    /// this window or the next one, but never in both.
    pub fn drain_window(&self) -> FeatureVector {
        let window: Vec<PacketRecord> = self.rx.try_iter().collect();
        reduce(&window, &self.port_whitelist)
    }
}

impl Default for FeatureAggregator {
    fn default() -> Self {
        FeatureAggregator::new(DEFAULT_PORT_WHITELIST.to_vec())
    }
}

/// Reduce one window of packets. The result does not depend on packet order.
pub fn reduce(packets: &[PacketRecord], port_whitelist: &[u16]) -> FeatureVector {
    let mut total_bytes = 0u64;
    let mut unusual_bytes = 0u64;
    let mut outbound_bytes = 0u64;
    let mut inbound_bytes = 0u64;
    let mut destinations: HashSet<&str> = HashSet::new();

    for packet in packets {
        let len = packet.length as u64;
        total_bytes += len;

        if !packet.destination_ip.is_empty() {
            destinations.insert(packet.destination_ip.as_str());
        }
        if !port_whitelist.contains(&packet.destination_port) {
            unusual_bytes += len;
        }
        if packet.destination_port < SERVICE_PORT_LIMIT {
            outbound_bytes += len;
        }
        if packet.source_port < SERVICE_PORT_LIMIT {
            inbound_bytes += len;
        }
    }

    FeatureVector {
        bytes_per_sec: total_bytes as f64,
        packets_per_sec: packets.len() as f64,
        unique_ips: destinations.len() as f64,
        unusual_port_bytes: unusual_bytes as f64,
        outbound_ratio: outbound_ratio(outbound_bytes, inbound_bytes),
    }
}

pub fn outbound_ratio(outbound: u64, inbound: u64) -> f64 {
    match (outbound, inbound) {
        (0, 0) => 1.0,
        (_, 0) => OUTBOUND_ONLY_RATIO,
        (out, inb) => out as f64 / inb as f64,
    }
}
