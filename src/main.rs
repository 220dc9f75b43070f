use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sniffguard::config::DEFAULT_PORT_WHITELIST;
use sniffguard::sniff::{list_devices, select_device};
use sniffguard::{
    AnomalyModel, CaptureSession, DetectionLoop, EventBus, SensorConfig, SensorEvent, ThresholdPolicy,
};

#[derive(Parser, Debug)]
#[command(version, about = "Network anomaly sensor")]
struct Args {
    /// Capture device; picked automatically when omitted
    #[arg(short, long, env = "SNIFFGUARD_INTERFACE")]
    interface: Option<String>,

    /// BPF capture filter
    #[arg(short, long, env = "SNIFFGUARD_FILTER", default_value = "")]
    filter: String,

    /// Replay a capture file instead of capturing live
    #[arg(short, long)]
    read: Option<PathBuf>,

    /// Export captured frames to this pcap file on exit
    #[arg(short, long, env = "SNIFFGUARD_WRITE")]
    write: Option<PathBuf>,

    /// Print capture devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Aggregation window in milliseconds
    #[arg(long, env = "SNIFFGUARD_WINDOW_MS", default_value_t = 1000)]
    window_ms: u64,

    /// Principal directions kept by the model
    #[arg(long, env = "SNIFFGUARD_RANK", default_value_t = 3)]
    rank: usize,

    /// Threshold = max baseline error x margin
    #[arg(long, env = "SNIFFGUARD_THRESHOLD_MARGIN", default_value_t = 1.5)]
    threshold_margin: f64,

    /// Calibrate on this percentile of baseline errors instead of the maximum
    #[arg(long, env = "SNIFFGUARD_THRESHOLD_PERCENTILE")]
    threshold_percentile: Option<f64>,

    /// Fixed threshold, skipping calibration
    #[arg(long, env = "SNIFFGUARD_THRESHOLD", conflicts_with = "threshold_percentile")]
    threshold: Option<f64>,

    /// Weight kept by the running averages each window
    #[arg(long, env = "SNIFFGUARD_SMOOTHING", default_value_t = 0.9)]
    smoothing: f64,

    /// Destination ports not counted as unusual
    #[arg(long, env = "SNIFFGUARD_WHITELIST", value_delimiter = ',')]
    whitelist: Vec<u16>,
}

impl Args {
    fn config(&self) -> SensorConfig {
        let threshold = match (self.threshold, self.threshold_percentile) {
            (Some(t), _) => ThresholdPolicy::Fixed(t),
            (None, Some(percentile)) => ThresholdPolicy::Percentile {
                percentile,
                margin: self.threshold_margin,
            },
            (None, None) => ThresholdPolicy::MaxBaselineMargin {
                margin: self.threshold_margin,
            },
        };
        let port_whitelist = if self.whitelist.is_empty() {
            DEFAULT_PORT_WHITELIST.to_vec()
        } else {
            self.whitelist.clone()
        };

        SensorConfig {
            window: Duration::from_millis(self.window_ms),
            rank: self.rank,
            threshold,
            port_whitelist,
            smoothing: self.smoothing,
            ..SensorConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sniffguard=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.list_devices {
        for device in list_devices()? {
            println!("{}\t{}\t{}", device.name, device.ip_address, device.friendly_name);
        }
        return Ok(());
    }

    let config = args.config();
    config.validate()?;

    let model = Arc::new(AnomalyModel::bootstrap(&config)?);
    let events = EventBus::new(config.subscriber_capacity);

    // stdout relay: one JSON event per line
    let relay = events.subscribe();
    thread::spawn(move || {
        for event in relay {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::error!("failed to encode event: {}", e),
            }
        }
    });
    let control = events.subscribe();

    let detection = DetectionLoop::new(&config, model, events.clone());
    let mut session = CaptureSession::new(&config, events.clone());
    session.add_packet_sink(detection.packet_sender());
    let detection = detection.spawn();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    match &args.read {
        Some(path) => session.load_from_file(path)?,
        None => {
            let devices = list_devices()?;
            let device = match select_device(&devices, args.interface.as_deref()) {
                Ok(device) => device,
                Err(e) => {
                    tracing::error!("{}", e);
                    detection.stop().await;
                    return Err(e.into());
                }
            };
            tracing::info!(device = %device.name, ip = %device.ip_address, "selected device");
            session.start(&device.name, &args.filter)?;
        }
    }

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let replay_done = control
            .try_iter()
            .any(|event| matches!(event, SensorEvent::ReplayComplete { .. }));
        if replay_done {
            // let the last replayed window be scored
            tokio::time::sleep(config.window + Duration::from_millis(100)).await;
            break;
        }
    }

    tracing::info!("shutting down");
    session.stop();
    detection.stop().await;

    if let Some(path) = &args.write {
        if let Err(e) = session.export_to_file(path) {
            tracing::error!("export failed: {}", e);
        }
    }
    Ok(())
}
