mod common;

use std::sync::Arc;

use chrono::Utc;
use crossbeam_channel::unbounded;
use pcap::Linktype;

use sniffguard::{
    AnomalyModel, AnomalyReason, CaptureSession, DetectionLoop, EventBus, PacketRecord, Protocol,
    SensorConfig, SensorEvent,
};

use common::{client_hello, tcp_frame, udp_frame};

struct Pipeline {
    session: CaptureSession,
    detection: DetectionLoop,
    events: crossbeam_channel::Receiver<SensorEvent>,
    records: crossbeam_channel::Receiver<PacketRecord>,
}

fn pipeline() -> Pipeline {
    let config = SensorConfig::default();
    let model = Arc::new(AnomalyModel::bootstrap(&config).unwrap());
    let bus = EventBus::new(128);
    let events = bus.subscribe();

    let detection = DetectionLoop::new(&config, model, bus.clone());
    let session = CaptureSession::new(&config, bus);
    session.add_packet_sink(detection.packet_sender());

    let (tap, records) = unbounded();
    session.add_packet_sink(tap);

    Pipeline {
        session,
        detection,
        events,
        records,
    }
}

#[test]
fn client_hello_burst_raises_unique_ip_anomaly() {
    let mut p = pipeline();
    let hello = client_hello("malicious.test", 256);

    for i in 0..100u8 {
        let frame = tcp_frame([10, 0, 0, 7], [203, 0, 113, i], 40000 + i as u16, 443, &hello);
        p.session.ingest_frame(&frame, Linktype::ETHERNET, Utc::now(), frame.len() as u32);
    }

    let records: Vec<PacketRecord> = p.records.try_iter().collect();
    assert_eq!(records.len(), 100);
    assert!(records.iter().all(|r| r.protocol == Protocol::Tls));
    assert!(records
        .iter()
        .all(|r| r.info == "Client Hello (SNI: malicious.test)"));

    let outcome = p.detection.tick();
    assert_eq!(outcome.features.packets_per_sec, 100.0);
    assert_eq!(outcome.features.unique_ips, 100.0);
    assert!(outcome.prediction.is_anomaly);

    // bandwidth is spiking too, but the unique-IP rule takes precedence
    let avg = p.detection.averages().current();
    assert!(outcome.features.bytes_per_sec > avg.bytes_per_sec * 3.0 + 5000.0);
    assert_eq!(outcome.reason, Some(AnomalyReason::UniqueIps));

    let events: Vec<SensorEvent> = p.events.try_iter().collect();
    assert_eq!(events.len(), 2);
    match &events[0] {
        SensorEvent::Stats(stats) => {
            assert!(stats.is_anomaly);
            assert_eq!(stats.unique_ips, 100.0);
            assert!(stats.score > 0.0);
        }
        other => panic!("expected stats first, got {other:?}"),
    }
    match &events[1] {
        SensorEvent::Anomaly(anomaly) => {
            assert_eq!(anomaly.reason, "Spike in Unique IPs Contacted");
            assert_eq!(anomaly.packets_per_sec, 100.0);
        }
        other => panic!("expected anomaly second, got {other:?}"),
    }
}

#[test]
fn baseline_like_window_is_quiet() {
    let mut p = pipeline();
    let peers = [[93, 184, 216, 34], [1, 1, 1, 1], [140, 82, 121, 3]];

    // about 1.3 kB over 12 packets to three peers, service port on both ends
    for i in 0..12usize {
        let mut frame = tcp_frame([10, 0, 0, 7], peers[i % peers.len()], 443, 443, &[0x17, 3, 3, 0, 40, 1, 2, 3]);
        frame.resize(110, 0);
        p.session.ingest_frame(&frame, Linktype::ETHERNET, Utc::now(), 110);
    }

    let outcome = p.detection.tick();
    assert_eq!(outcome.features.packets_per_sec, 12.0);
    assert_eq!(outcome.features.outbound_ratio, 1.0);
    assert!(!outcome.prediction.is_anomaly, "score {}", outcome.prediction.score);
    assert!(matches!(p.events.try_recv(), Ok(SensorEvent::Stats(s)) if !s.is_anomaly));
    assert!(p.events.try_recv().is_err());
}

#[test]
fn mixed_traffic_is_labelled() {
    let p = pipeline();

    let mut dns = vec![0xbe, 0xef, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
    dns.extend_from_slice(b"\x04mail\x07example\x03org\x00\x00\x01\x00\x01");
    let frames = [
        udp_frame([10, 0, 0, 7], [9, 9, 9, 9], 53123, 53, &dns),
        tcp_frame([10, 0, 0, 7], [198, 51, 100, 1], 50000, 80, b"POST /login HTTP/1.1\r\n\r\n"),
        tcp_frame([10, 0, 0, 7], [198, 51, 100, 2], 50001, 22, b"SSH-2.0-OpenSSH_9.6\r\n"),
        vec![0u8; 3],
    ];
    for frame in &frames {
        p.session.ingest_frame(frame, Linktype::ETHERNET, Utc::now(), frame.len() as u32);
    }

    let records: Vec<PacketRecord> = p.records.try_iter().collect();
    let labels: Vec<(Protocol, &str)> = records.iter().map(|r| (r.protocol, r.info.as_str())).collect();
    assert_eq!(labels[0], (Protocol::Dns, "Query mail.example.org"));
    assert_eq!(labels[1], (Protocol::Http, "POST /login HTTP/1.1"));
    assert_eq!(labels[2], (Protocol::Tcp, "50001 -> 22 Seq=268435456"));
    assert_eq!(labels[3].0, Protocol::Unknown);
    assert_eq!(
        records.iter().map(|r| r.number).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
}
