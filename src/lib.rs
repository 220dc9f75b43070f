//! Network anomaly sensor.
//!
//! Frames from a live device or a capture file are dissected
//! ([`parser::dissect`]), reduced to one [`FeatureVector`] per window
//! ([`aggregate`]) and scored by a PCA reconstruction-error model ([`pca`]).
//! [`detection::DetectionLoop`] ties these together and publishes
//! [`SensorEvent`]s on an [`EventBus`].

pub mod aggregate;
pub mod config;
pub mod decode;
pub mod detection;
pub mod error;
pub mod events;
pub mod models;
pub mod parser;
pub mod pca;
pub mod sniff;

pub use config::{SensorConfig, ThresholdPolicy};
pub use detection::{AnomalyReason, DetectionHandle, DetectionLoop};
pub use error::{Result, SensorError};
pub use events::{EventBus, SensorEvent};
pub use models::domain::{DeviceInfo, FeatureVector, PacketRecord, Protocol, RawFrame};
pub use pca::AnomalyModel;
pub use sniff::{CaptureSession, CaptureState};
