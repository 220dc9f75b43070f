pub mod domain {
    use std::fmt;

    use chrono::{DateTime, Utc};
    use pcap::Linktype;
    use serde::{Deserialize, Serialize};

    /// Width of the traffic feature schema.
    pub const FEATURE_DIM: usize = 5;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Protocol {
        #[serde(rename = "TCP")]
        Tcp,
        #[serde(rename = "UDP")]
        Udp,
        #[serde(rename = "ARP")]
        Arp,
        #[serde(rename = "HTTP")]
        Http,
        #[serde(rename = "TLS")]
        Tls,
        #[serde(rename = "DNS")]
        Dns,
        Unknown,
    }

    impl Protocol {
        pub fn as_str(&self) -> &'static str {
            match self {
                Protocol::Tcp => "TCP",
                Protocol::Udp => "UDP",
                Protocol::Arp => "ARP",
                Protocol::Http => "HTTP",
                Protocol::Tls => "TLS",
                Protocol::Dns => "DNS",
                Protocol::Unknown => "Unknown",
            }
        }
    }

    impl fmt::Display for Protocol {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// One dissected frame.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct PacketRecord {
        pub number: u64,
        pub timestamp: DateTime<Utc>,
        pub source_ip: String,
        pub destination_ip: String,
        pub source_port: u16,
        pub destination_port: u16,
        pub protocol: Protocol,
        /// Captured length of the whole frame in bytes.
        pub length: usize,
        pub info: String,
        pub payload: Option<Vec<u8>>,
        pub tcp_sequence: Option<u32>,
    }

    impl PacketRecord {
        pub fn new(number: u64, timestamp: DateTime<Utc>, length: usize) -> Self {
            PacketRecord {
                number,
                timestamp,
                source_ip: String::new(),
                destination_ip: String::new(),
                source_port: 0,
                destination_port: 0,
                protocol: Protocol::Unknown,
                length,
                info: String::new(),
                payload: None,
                tcp_sequence: None,
            }
        }

        /// Payload as printable ASCII, anything else shown as `.`.
        pub fn payload_text(&self) -> String {
            self.payload
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|&b| if (32..=126).contains(&b) { b as char } else { '.' })
                .collect()
        }

        /// Payload as space separated upper-case hex.
        pub fn payload_hex(&self) -> String {
            self.payload
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|b| hex::encode_upper([*b]))
                .collect::<Vec<_>>()
                .join(" ")
        }
    }

    /// Captured bytes kept for export. Never mutated once retained.
    #[derive(Debug, Clone, PartialEq)]
    pub struct RawFrame {
        pub data: Vec<u8>,
        pub linktype: Linktype,
        pub timestamp: DateTime<Utc>,
        /// Length on the wire; may exceed `data.len()` when the snaplen truncated it.
        pub orig_len: u32,
    }

    /// Per-window traffic features, all non-negative.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
    pub struct FeatureVector {
        pub bytes_per_sec: f64,
        pub packets_per_sec: f64,
        pub unique_ips: f64,
        pub unusual_port_bytes: f64,
        pub outbound_ratio: f64,
    }

    impl FeatureVector {
        pub fn to_array(&self) -> [f64; FEATURE_DIM] {
            [
                self.bytes_per_sec,
                self.packets_per_sec,
                self.unique_ips,
                self.unusual_port_bytes,
                self.outbound_ratio,
            ]
        }

        pub fn from_array(values: [f64; FEATURE_DIM]) -> Self {
            let [bytes_per_sec, packets_per_sec, unique_ips, unusual_port_bytes, outbound_ratio] =
                values;
            FeatureVector {
                bytes_per_sec,
                packets_per_sec,
                unique_ips,
                unusual_port_bytes,
                outbound_ratio,
            }
        }
    }

    /// Capture-capable interface as shown to the operator.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DeviceInfo {
        pub name: String,
        pub description: String,
        pub friendly_name: String,
        pub ip_address: String,
    }
}

pub mod dto {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    use super::domain::FeatureVector;

    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
    pub struct StatsEvent {
        pub timestamp: DateTime<Utc>,
        pub bytes_per_sec: f64,
        pub packets_per_sec: f64,
        pub unique_ips: f64,
        pub unusual_port_bytes: f64,
        pub outbound_ratio: f64,
        pub is_anomaly: bool,
        pub score: f64,
    }

    impl StatsEvent {
        pub fn new(timestamp: DateTime<Utc>, features: &FeatureVector, is_anomaly: bool, score: f64) -> Self {
            StatsEvent {
                timestamp,
                bytes_per_sec: features.bytes_per_sec,
                packets_per_sec: features.packets_per_sec,
                unique_ips: features.unique_ips,
                unusual_port_bytes: features.unusual_port_bytes,
                outbound_ratio: features.outbound_ratio,
                is_anomaly,
                score,
            }
        }
    }

    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
    pub struct AnomalyEvent {
        pub timestamp: DateTime<Utc>,
        pub bytes_per_sec: f64,
        pub packets_per_sec: f64,
        pub unique_ips: f64,
        pub unusual_port_bytes: f64,
        pub outbound_ratio: f64,
        pub score: f64,
        pub reason: String,
    }

    impl AnomalyEvent {
        pub fn new(timestamp: DateTime<Utc>, features: &FeatureVector, score: f64, reason: impl Into<String>) -> Self {
            AnomalyEvent {
                timestamp,
                bytes_per_sec: features.bytes_per_sec,
                packets_per_sec: features.packets_per_sec,
                unique_ips: features.unique_ips,
                unusual_port_bytes: features.unusual_port_bytes,
                outbound_ratio: features.outbound_ratio,
                score,
                reason: reason.into(),
            }
        }
    }
}
