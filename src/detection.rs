use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::Sender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::aggregate::FeatureAggregator;
use crate::config::SensorConfig;
use crate::events::{EventBus, SensorEvent};
use crate::models::domain::{FeatureVector, PacketRecord};
use crate::models::dto::{AnomalyEvent, StatsEvent};
use crate::pca::{AnomalyModel, Prediction};

/// Why an anomalous window was flagged. Rules are checked in declaration
/// order and the first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyReason {
    UniqueIps,
    UnusualPorts,
    OutboundRatio,
    Bandwidth,
    General,
}

impl AnomalyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyReason::UniqueIps => "Spike in Unique IPs Contacted",
            AnomalyReason::UnusualPorts => "Spike in Unusual Port Traffic",
            AnomalyReason::OutboundRatio => "Spike in Outbound Traffic Ratio",
            AnomalyReason::Bandwidth => "Spike in Total Bandwidth",
            AnomalyReason::General => "General Traffic Spike",
        }
    }
}

impl fmt::Display for AnomalyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential moving average of every feature. Only used to explain
/// anomalies, never fed back into the model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningAverages {
    current: FeatureVector,
    smoothing: f64,
}

impl RunningAverages {
    pub fn new(initial: FeatureVector, smoothing: f64) -> Self {
        RunningAverages {
            current: initial,
            smoothing,
        }
    }

    pub fn update(&mut self, window: &FeatureVector) {
        let keep = self.smoothing;
        let old = self.current.to_array();
        let new = window.to_array();
        self.current = FeatureVector::from_array(std::array::from_fn(|i| {
            old[i] * keep + new[i] * (1.0 - keep)
        }));
    }

    pub fn current(&self) -> FeatureVector {
        self.current
    }
}

pub fn classify(window: &FeatureVector, avg: &FeatureVector) -> AnomalyReason {
    if window.unique_ips > avg.unique_ips * 3.0 + 5.0 {
        AnomalyReason::UniqueIps
    } else if window.unusual_port_bytes > avg.unusual_port_bytes * 3.0 + 1000.0 {
        AnomalyReason::UnusualPorts
    } else if window.outbound_ratio > avg.outbound_ratio * 3.0 + 2.0 {
        AnomalyReason::OutboundRatio
    } else if window.bytes_per_sec > avg.bytes_per_sec * 3.0 + 5000.0 {
        AnomalyReason::Bandwidth
    } else {
        AnomalyReason::General
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome {
    pub features: FeatureVector,
    pub prediction: Prediction,
    pub reason: Option<AnomalyReason>,
}

/// Periodic aggregation and scoring. Owns the aggregator and the running
/// averages outright, so nothing on the tick path needs a lock.
pub struct DetectionLoop {
    aggregator: FeatureAggregator,
    model: Arc<AnomalyModel>,
    averages: RunningAverages,
    events: EventBus,
    window: Duration,
    #[cfg(test)]
    fail_next_tick: Arc<AtomicBool>,
}

impl DetectionLoop {
    /// Averages start at the model's baseline mean.
    pub fn new(config: &SensorConfig, model: Arc<AnomalyModel>, events: EventBus) -> Self {
        let averages = RunningAverages::new(model.mean(), config.smoothing);
        DetectionLoop {
            aggregator: FeatureAggregator::new(config.port_whitelist.clone()),
            model,
            averages,
            events,
            window: config.window,
            #[cfg(test)]
            fail_next_tick: Arc::default(),
        }
    }

    /// Ingestion handle for the capture side.
    pub fn packet_sender(&self) -> Sender<PacketRecord> {
        self.aggregator.sender()
    }

    pub fn averages(&self) -> &RunningAverages {
        &self.averages
    }

    /// One aggregation window: drain, score, update averages, publish.
    pub fn tick(&mut self) -> TickOutcome {
        #[cfg(test)]
        {
            if self.fail_next_tick.swap(false, Ordering::SeqCst) {
                panic!("tick fault requested by test");
            }
        }

        let features = self.aggregator.drain_window();
        let prediction = self.model.score(&features);
        self.averages.update(&features);

        let now = Utc::now();
        self.events.publish(SensorEvent::Stats(StatsEvent::new(
            now,
            &features,
            prediction.is_anomaly,
            prediction.score,
        )));

        let reason = prediction.is_anomaly.then(|| {
            let reason = classify(&features, &self.averages.current());
            tracing::warn!(%reason, score = prediction.score, "anomaly detected");
            self.events.publish(SensorEvent::Anomaly(AnomalyEvent::new(
                now,
                &features,
                prediction.score,
                reason.as_str(),
            )));
            reason
        });

        tracing::debug!(
            bytes = features.bytes_per_sec,
            packets = features.packets_per_sec,
            unique_ips = features.unique_ips,
            score = prediction.score,
            "window scored"
        );

        TickOutcome {
            features,
            prediction,
            reason,
        }
    }

    /// Tick every window until `shutdown` turns true or its sender goes away.
    /// A window still filling when the stop arrives is discarded.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval_at(Instant::now() + self.window, self.window);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(window_ms = self.window.as_millis() as u64, "detection loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if catch_unwind(AssertUnwindSafe(|| self.tick())).is_err() {
                        tracing::warn!("detection tick failed, continuing with next window");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("detection loop stopped");
    }

    /// Run on the current tokio runtime.
    pub fn spawn(self) -> DetectionHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(rx));
        DetectionHandle { shutdown, task }
    }
}

pub struct DetectionHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DetectionHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("detection task ended abnormally: {}", e);
        }
    }
}
