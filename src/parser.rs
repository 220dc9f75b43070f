// src/parser.rs
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use etherparse::{
    EtherType, Ethernet2Header, Ethernet2HeaderSlice, NetSlice, SlicedPacket, TcpSlice,
    TransportSlice, UdpSlice,
};
use pcap::Linktype;

use crate::decode::{classify_tls_record, dns_query_name, extract_sni};
use crate::models::domain::{PacketRecord, Protocol};

const HTTP_PORT: u16 = 80;
const TLS_PORT: u16 = 443;
const DNS_PORT: u16 = 53;

/// Smallest TLS payload worth labelling: one record header.
const TLS_MIN_PAYLOAD: usize = 5;
const DNS_HEADER_LEN: usize = 12;

const HTTP_PREFIXES: [&[u8]; 3] = [b"GET ", b"POST ", b"HTTP/"];

// Link types as reported by libpcap (DLT_RAW differs between platforms).
const DLT_NULL: i32 = 0;
const DLT_EN10MB: i32 = 1;
const DLT_RAW_BSD: i32 = 12;
const DLT_RAW_OPENBSD: i32 = 14;
const DLT_LOOP: i32 = 108;
const LINKTYPE_RAW: i32 = 101;
const LINKTYPE_IPV4: i32 = 228;
const LINKTYPE_IPV6: i32 = 229;

/// Dissect one captured frame.
///
/// Total over all inputs: anything that cannot be parsed ends up labelled
/// [`Protocol::Unknown`] instead of failing.
pub fn dissect(
    data: &[u8],
    linktype: Linktype,
    number: u64,
    timestamp: DateTime<Utc>,
) -> PacketRecord {
    let mut record = PacketRecord::new(number, timestamp, data.len());

    let sliced = slice_frame(data, linktype);
    if let Some(packet) = &sliced {
        if let Some(net) = &packet.net {
            handle_ip(net, packet.transport.as_ref(), &mut record);
            return record;
        }
    }

    if linktype.0 == DLT_EN10MB {
        if let Some((sender, target)) = handle_arp(data) {
            record.protocol = Protocol::Arp;
            record.info = format!("Who has {}? Tell {}", target, sender);
            return record;
        }
    }

    if sliced.is_some() {
        record.info = "Non-IP Packet".into();
    }
    record
}

fn slice_frame(data: &[u8], linktype: Linktype) -> Option<SlicedPacket<'_>> {
    match linktype.0 {
        DLT_EN10MB => SlicedPacket::from_ethernet(data).ok(),
        DLT_RAW_BSD | DLT_RAW_OPENBSD | LINKTYPE_RAW | LINKTYPE_IPV4 | LINKTYPE_IPV6 => {
            SlicedPacket::from_ip(data).ok()
        }
        // 4 byte address family header in host byte order
        DLT_NULL | DLT_LOOP => data.get(4..).and_then(|ip| SlicedPacket::from_ip(ip).ok()),
        _ => None,
    }
}

fn handle_ip(net: &NetSlice<'_>, transport: Option<&TransportSlice<'_>>, record: &mut PacketRecord) {
    let ip_number = match net {
        NetSlice::Ipv4(ipv4) => {
            record.source_ip = ipv4.header().source_addr().to_string();
            record.destination_ip = ipv4.header().destination_addr().to_string();
            ipv4.payload().ip_number
        }
        NetSlice::Ipv6(ipv6) => {
            record.source_ip = ipv6.header().source_addr().to_string();
            record.destination_ip = ipv6.header().destination_addr().to_string();
            ipv6.payload().ip_number
        }
        #[allow(unreachable_patterns)]
        _ => return,
    };

    match transport {
        Some(TransportSlice::Tcp(tcp)) => handle_tcp(tcp, record),
        Some(TransportSlice::Udp(udp)) => handle_udp(udp, record),
        _ => record.info = format!("IP protocol {}", ip_number.0),
    }
}

fn handle_tcp(tcp: &TcpSlice<'_>, record: &mut PacketRecord) {
    let (src_port, dst_port) = (tcp.source_port(), tcp.destination_port());
    let seq = tcp.sequence_number();
    let payload = tcp.payload();

    record.protocol = Protocol::Tcp;
    record.source_port = src_port;
    record.destination_port = dst_port;
    record.tcp_sequence = Some(seq);
    record.info = format!("{} -> {} Seq={}", src_port, dst_port, seq);
    record.payload = Some(payload.to_vec());

    if either_port(src_port, dst_port, HTTP_PORT) && !payload.is_empty() {
        if HTTP_PREFIXES.iter().any(|prefix| payload.starts_with(prefix)) {
            record.protocol = Protocol::Http;
            if let Some(line) = first_line(payload) {
                record.info = line;
            }
        }
    } else if either_port(src_port, dst_port, TLS_PORT) && payload.len() > TLS_MIN_PAYLOAD {
        record.protocol = Protocol::Tls;
        record.info = match extract_sni(payload) {
            Some(sni) if !sni.is_empty() => format!("Client Hello (SNI: {})", sni),
            _ => classify_tls_record(payload).to_string(),
        };
    }
}

fn handle_udp(udp: &UdpSlice<'_>, record: &mut PacketRecord) {
    let (src_port, dst_port) = (udp.source_port(), udp.destination_port());
    let payload = udp.payload();

    record.protocol = Protocol::Udp;
    record.source_port = src_port;
    record.destination_port = dst_port;
    record.info = format!("{} -> {} Len={}", src_port, dst_port, udp.length());
    record.payload = Some(payload.to_vec());

    if either_port(src_port, dst_port, DNS_PORT) && payload.len() > DNS_HEADER_LEN {
        record.protocol = Protocol::Dns;
        let name = dns_query_name(payload);
        if !name.is_empty() {
            let direction = if src_port == DNS_PORT { "Response" } else { "Query" };
            record.info = format!("{} {}", direction, name);
        }
    }
}

/// Sender and target protocol addresses of an Ethernet ARP frame.
fn handle_arp(frame: &[u8]) -> Option<(String, String)> {
    let eth = Ethernet2HeaderSlice::from_slice(frame).ok()?;
    if eth.ether_type() != EtherType::ARP {
        return None;
    }
    let arp = frame.get(Ethernet2Header::LEN..)?;

    // htype(2) ptype(2) hlen(1) plen(1) oper(2), then sha spa tha tpa
    let hlen = *arp.get(4)? as usize;
    let plen = *arp.get(5)? as usize;
    let spa_start = 8 + hlen;
    let tpa_start = spa_start + plen + hlen;
    let sender = arp.get(spa_start..spa_start + plen)?;
    let target = arp.get(tpa_start..tpa_start + plen)?;

    Some((proto_addr(sender), proto_addr(target)))
}

fn proto_addr(bytes: &[u8]) -> String {
    match <[u8; 4]>::try_from(bytes) {
        Ok(octets) => Ipv4Addr::from(octets).to_string(),
        Err(_) => hex::encode(bytes),
    }
}

fn either_port(src: u16, dst: u16, port: u16) -> bool {
    src == port || dst == port
}

fn first_line(payload: &[u8]) -> Option<String> {
    String::from_utf8_lossy(payload)
        .split(['\r', '\n'])
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
