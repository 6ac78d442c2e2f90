//! Device registry and performance scoring.
//!
//! Holds the last-known telemetry and usage predictions for every device and
//! turns them into a single ranking score per device. Scores are derived:
//! callers never set them, they call [`DeviceRegistry::rescore`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use thiserror::Error;

/// Default reference speed (Mbps) at which a speed metric saturates.
pub const DEFAULT_SPEED_REFERENCE: f64 = 1000.0;

#[derive(Debug, Error, PartialEq)]
pub enum ScoreError {
    #[error("Weight for {0} must be a non-negative number")]
    InvalidWeight(Metric),

    #[error("Speed reference must be a positive number")]
    InvalidSpeedReference,

    #[error("Device ID cannot be empty")]
    EmptyId,
}

pub type Result<T> = std::result::Result<T, ScoreError>;

/// A scored metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cpu,
    Ram,
    Gpu,
    DownloadSpeed,
    UploadSpeed,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Cpu,
        Metric::Ram,
        Metric::Gpu,
        Metric::DownloadSpeed,
        Metric::UploadSpeed,
    ];
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Metric::Cpu => "cpu",
            Metric::Ram => "ram",
            Metric::Gpu => "gpu",
            Metric::DownloadSpeed => "download_speed",
            Metric::UploadSpeed => "upload_speed",
        };
        f.write_str(name)
    }
}

/// One weight per metric. All weights must be non-negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub cpu: f64,
    pub ram: f64,
    pub gpu: f64,
    pub download_speed: f64,
    pub upload_speed: f64,
    /// Speed (Mbps) that normalizes to 1.0
    #[serde(default = "default_speed_reference")]
    pub speed_reference: f64,
}

fn default_speed_reference() -> f64 {
    DEFAULT_SPEED_REFERENCE
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            ram: 1.0,
            gpu: 0.5,
            download_speed: 1.0,
            upload_speed: 1.0,
            speed_reference: DEFAULT_SPEED_REFERENCE,
        }
    }
}

impl ScoreWeights {
    pub fn weight(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Cpu => self.cpu,
            Metric::Ram => self.ram,
            Metric::Gpu => self.gpu,
            Metric::DownloadSpeed => self.download_speed,
            Metric::UploadSpeed => self.upload_speed,
        }
    }

    /// Reject negative or non-finite weights instead of clamping them.
    pub fn validate(&self) -> Result<()> {
        for metric in Metric::ALL {
            let w = self.weight(metric);
            if !w.is_finite() || w < 0.0 {
                return Err(ScoreError::InvalidWeight(metric));
            }
        }
        if !self.speed_reference.is_finite() || self.speed_reference <= 0.0 {
            return Err(ScoreError::InvalidSpeedReference);
        }
        Ok(())
    }
}

/// Raw telemetry as returned by `GET devices`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTelemetry {
    pub device_id: String,
    pub device_name: String,
    #[serde(default)]
    pub online: bool,
    /// Percent, 0-100
    #[serde(default)]
    pub cpu_usage: Option<f64>,
    #[serde(default)]
    pub ram_usage: Option<f64>,
    #[serde(default)]
    pub gpu_usage: Option<f64>,
    /// Mbps
    #[serde(default)]
    pub upload_speed: Option<f64>,
    #[serde(default)]
    pub download_speed: Option<f64>,
    #[serde(default)]
    pub battery: Option<f64>,
    #[serde(default)]
    pub files_available_for_download: u64,
    #[serde(default)]
    pub files_needed: u64,
}

/// Prediction fields as returned by `GET device-predictions`, keyed by device name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevicePrediction {
    /// Lookup key only; `Device` already carries the name from telemetry
    #[serde(skip_serializing)]
    pub device_name: String,
    #[serde(default)]
    pub predicted_cpu_usage: Option<f64>,
    #[serde(default)]
    pub use_predicted_cpu_usage: bool,
    #[serde(default)]
    pub predicted_ram_usage: Option<f64>,
    #[serde(default)]
    pub use_predicted_ram_usage: bool,
    #[serde(default)]
    pub predicted_gpu_usage: Option<f64>,
    #[serde(default)]
    pub use_predicted_gpu_usage: bool,
    #[serde(default)]
    pub predicted_upload_speed: Option<f64>,
    #[serde(default)]
    pub use_predicted_upload_speed: bool,
    #[serde(default)]
    pub predicted_download_speed: Option<f64>,
    #[serde(default)]
    pub use_predicted_download_speed: bool,
}

/// Last-known state of a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    #[serde(flatten)]
    pub telemetry: DeviceTelemetry,
    #[serde(flatten)]
    pub prediction: DevicePrediction,
    score: f64,
    score_timestamp: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(telemetry: DeviceTelemetry) -> Self {
        let prediction = DevicePrediction {
            device_name: telemetry.device_name.clone(),
            ..Default::default()
        };
        Self {
            telemetry,
            prediction,
            score: 0.0,
            score_timestamp: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.telemetry.device_id
    }

    pub fn name(&self) -> &str {
        &self.telemetry.device_name
    }

    pub fn is_online(&self) -> bool {
        self.telemetry.online
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn score_timestamp(&self) -> Option<DateTime<Utc>> {
        self.score_timestamp
    }

    /// Predicted value when its flag is set, measured value otherwise.
    pub fn metric_value(&self, metric: Metric) -> Option<f64> {
        let t = &self.telemetry;
        let p = &self.prediction;
        let (predicted, use_predicted, measured) = match metric {
            Metric::Cpu => (p.predicted_cpu_usage, p.use_predicted_cpu_usage, t.cpu_usage),
            Metric::Ram => (p.predicted_ram_usage, p.use_predicted_ram_usage, t.ram_usage),
            Metric::Gpu => (p.predicted_gpu_usage, p.use_predicted_gpu_usage, t.gpu_usage),
            Metric::DownloadSpeed => (
                p.predicted_download_speed,
                p.use_predicted_download_speed,
                t.download_speed,
            ),
            Metric::UploadSpeed => (
                p.predicted_upload_speed,
                p.use_predicted_upload_speed,
                t.upload_speed,
            ),
        };
        if use_predicted { predicted } else { measured }
    }
}

/// Map a raw metric onto [0, 1] where higher is better.
fn normalize(metric: Metric, value: f64, speed_reference: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let normalized = match metric {
        Metric::Cpu | Metric::Ram | Metric::Gpu => (100.0 - value) / 100.0,
        Metric::DownloadSpeed | Metric::UploadSpeed => value / speed_reference,
    };
    normalized.clamp(0.0, 1.0)
}

/// Weighted contribution of a single metric. Missing metrics contribute 0.
pub fn metric_contribution(device: &Device, metric: Metric, weights: &ScoreWeights) -> f64 {
    device
        .metric_value(metric)
        .map(|v| weights.weight(metric) * normalize(metric, v, weights.speed_reference))
        .unwrap_or(0.0)
}

/// Compute a device's score. Pure: the registry is not touched.
pub fn score(device: &Device, weights: &ScoreWeights) -> Result<f64> {
    weights.validate()?;
    Ok(Metric::ALL
        .iter()
        .map(|m| metric_contribution(device, *m, weights))
        .sum())
}

/// Registry of known devices, one entry per `device_id`.
///
/// Thread-safe; wrap in `Arc` for shared ownership.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<Vec<Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a device's telemetry, keeping its predictions and score.
    pub fn upsert_telemetry(&self, telemetry: DeviceTelemetry) -> Result<Device> {
        if telemetry.device_id.is_empty() {
            return Err(ScoreError::EmptyId);
        }
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        let device = match devices
            .iter_mut()
            .find(|d| d.telemetry.device_id == telemetry.device_id)
        {
            Some(existing) => {
                existing.prediction.device_name = telemetry.device_name.clone();
                existing.telemetry = telemetry;
                existing.clone()
            }
            None => {
                let device = Device::new(telemetry);
                devices.push(device.clone());
                device
            }
        };
        Ok(device)
    }

    /// Attach predictions to devices by name. Unknown names are skipped.
    ///
    /// Returns the number of devices updated.
    pub fn apply_predictions(&self, predictions: Vec<DevicePrediction>) -> usize {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        let mut applied = 0;
        for prediction in predictions {
            if let Some(device) = devices
                .iter_mut()
                .find(|d| d.telemetry.device_name == prediction.device_name)
            {
                device.prediction = prediction;
                applied += 1;
            }
        }
        applied
    }

    pub fn set_online(&self, device_id: &str, online: bool) -> bool {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        match devices.iter_mut().find(|d| d.telemetry.device_id == device_id) {
            Some(device) => {
                device.telemetry.online = online;
                true
            }
            None => false,
        }
    }

    /// Recompute and persist every device's score.
    ///
    /// Weights are validated before any score is written.
    pub fn rescore(&self, weights: &ScoreWeights, now: DateTime<Utc>) -> Result<Vec<Device>> {
        weights.validate()?;
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        for device in devices.iter_mut() {
            device.score = score(device, weights)?;
            device.score_timestamp = Some(now);
        }
        Ok(devices.clone())
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|d| d.telemetry.device_id == device_id)
            .cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Device> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|d| d.telemetry.device_name == name)
            .cloned()
    }

    /// All devices in registration order.
    pub fn snapshot(&self) -> Vec<Device> {
        self.devices.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Highest-scoring online device among the candidate device names.
    ///
    /// Ties go to the candidate listed first.
    pub fn best_device_for(&self, candidates: &[&str]) -> Option<Device> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        let mut best: Option<&Device> = None;
        for name in candidates {
            let Some(device) = devices
                .iter()
                .find(|d| d.telemetry.device_name == *name && d.is_online())
            else {
                continue;
            };
            if best.map(|b| device.score > b.score).unwrap_or(true) {
                best = Some(device);
            }
        }
        best.cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry(id: &str, name: &str) -> DeviceTelemetry {
        DeviceTelemetry {
            device_id: id.into(),
            device_name: name.into(),
            online: true,
            cpu_usage: Some(20.0),
            ram_usage: Some(50.0),
            gpu_usage: Some(10.0),
            upload_speed: Some(100.0),
            download_speed: Some(500.0),
            battery: Some(80.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_score_weighted_sum() {
        let device = Device::new(telemetry("d1", "laptop"));
        let weights = ScoreWeights {
            cpu: 1.0,
            ram: 1.0,
            gpu: 0.0,
            download_speed: 1.0,
            upload_speed: 0.0,
            speed_reference: 1000.0,
        };
        // cpu 0.8 + ram 0.5 + download 0.5
        let s = score(&device, &weights).unwrap();
        assert!((s - 1.8).abs() < 1e-9);
    }

    #[test]
    fn test_predicted_value_used_only_when_flagged() {
        let mut device = Device::new(telemetry("d1", "laptop"));
        device.prediction.predicted_cpu_usage = Some(90.0);
        assert_eq!(device.metric_value(Metric::Cpu), Some(20.0));

        device.prediction.use_predicted_cpu_usage = true;
        assert_eq!(device.metric_value(Metric::Cpu), Some(90.0));
    }

    #[test]
    fn test_flagged_prediction_without_value_contributes_zero() {
        let mut device = Device::new(telemetry("d1", "laptop"));
        device.prediction.use_predicted_gpu_usage = true;
        let weights = ScoreWeights::default();
        assert_eq!(metric_contribution(&device, Metric::Gpu, &weights), 0.0);
    }

    #[test]
    fn test_device_json_has_single_name() {
        let device = Device::new(telemetry("d1", "laptop"));
        let json = serde_json::to_string(&device).unwrap();
        assert_eq!(json.matches("\"device_name\"").count(), 1);
        assert!(json.contains("\"device_name\":\"laptop\""));
    }

    #[test]
    fn test_missing_metrics_still_score() {
        let device = Device::new(DeviceTelemetry {
            device_id: "d1".into(),
            device_name: "bare".into(),
            download_speed: Some(1000.0),
            ..Default::default()
        });
        let s = score(&device, &ScoreWeights::default()).unwrap();
        assert!((s - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_negative_weight_rejected() {
        let device = Device::new(telemetry("d1", "laptop"));
        let weights = ScoreWeights {
            ram: -0.5,
            ..Default::default()
        };
        assert_eq!(
            score(&device, &weights).unwrap_err(),
            ScoreError::InvalidWeight(Metric::Ram)
        );
    }

    #[test]
    fn test_nan_weight_rejected() {
        let weights = ScoreWeights {
            upload_speed: f64::NAN,
            ..Default::default()
        };
        assert!(weights.validate().is_err());
    }

    #[test]
    fn test_increasing_weight_never_decreases_contribution() {
        let device = Device::new(telemetry("d1", "laptop"));
        for metric in Metric::ALL {
            let mut previous = 0.0;
            for step in 0..10 {
                let mut weights = ScoreWeights::default();
                match metric {
                    Metric::Cpu => weights.cpu = step as f64,
                    Metric::Ram => weights.ram = step as f64,
                    Metric::Gpu => weights.gpu = step as f64,
                    Metric::DownloadSpeed => weights.download_speed = step as f64,
                    Metric::UploadSpeed => weights.upload_speed = step as f64,
                }
                let c = metric_contribution(&device, metric, &weights);
                assert!(c >= previous, "{metric} contribution decreased");
                previous = c;
            }
        }
    }

    #[test]
    fn test_out_of_range_usage_is_clamped() {
        let mut t = telemetry("d1", "laptop");
        t.cpu_usage = Some(140.0);
        t.download_speed = Some(5000.0);
        let device = Device::new(t);
        let weights = ScoreWeights::default();
        assert_eq!(metric_contribution(&device, Metric::Cpu, &weights), 0.0);
        assert_eq!(metric_contribution(&device, Metric::DownloadSpeed, &weights), 1.0);
    }

    #[test]
    fn test_upsert_keeps_one_device_per_id() {
        let registry = DeviceRegistry::new();
        registry.upsert_telemetry(telemetry("d1", "laptop")).unwrap();
        let mut updated = telemetry("d1", "laptop");
        updated.cpu_usage = Some(70.0);
        registry.upsert_telemetry(updated).unwrap();

        let devices = registry.snapshot();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].telemetry.cpu_usage, Some(70.0));
    }

    #[test]
    fn test_upsert_empty_id_rejected() {
        let registry = DeviceRegistry::new();
        assert_eq!(
            registry.upsert_telemetry(telemetry("", "x")).unwrap_err(),
            ScoreError::EmptyId
        );
    }

    #[test]
    fn test_predictions_survive_telemetry_refresh() {
        let registry = DeviceRegistry::new();
        registry.upsert_telemetry(telemetry("d1", "laptop")).unwrap();
        let applied = registry.apply_predictions(vec![
            DevicePrediction {
                device_name: "laptop".into(),
                predicted_cpu_usage: Some(5.0),
                use_predicted_cpu_usage: true,
                ..Default::default()
            },
            DevicePrediction {
                device_name: "unknown".into(),
                ..Default::default()
            },
        ]);
        assert_eq!(applied, 1);

        registry.upsert_telemetry(telemetry("d1", "laptop")).unwrap();
        let device = registry.get("d1").unwrap();
        assert_eq!(device.metric_value(Metric::Cpu), Some(5.0));
    }

    #[test]
    fn test_rescore_persists_score_and_timestamp() {
        let registry = DeviceRegistry::new();
        registry.upsert_telemetry(telemetry("d1", "laptop")).unwrap();
        assert_eq!(registry.get("d1").unwrap().score_timestamp(), None);

        let now = Utc::now();
        let devices = registry.rescore(&ScoreWeights::default(), now).unwrap();
        assert!(devices[0].score() > 0.0);
        assert_eq!(registry.get("d1").unwrap().score_timestamp(), Some(now));
    }

    #[test]
    fn test_rescore_with_invalid_weights_writes_nothing() {
        let registry = DeviceRegistry::new();
        registry.upsert_telemetry(telemetry("d1", "laptop")).unwrap();
        let weights = ScoreWeights {
            cpu: -1.0,
            ..Default::default()
        };
        assert!(registry.rescore(&weights, Utc::now()).is_err());
        assert_eq!(registry.get("d1").unwrap().score_timestamp(), None);
    }

    #[test]
    fn test_best_device_prefers_online_high_score() {
        let registry = DeviceRegistry::new();
        let mut slow = telemetry("d1", "slow");
        slow.download_speed = Some(10.0);
        slow.upload_speed = Some(10.0);
        registry.upsert_telemetry(slow).unwrap();
        registry.upsert_telemetry(telemetry("d2", "fast")).unwrap();
        let mut offline = telemetry("d3", "offline");
        offline.online = false;
        offline.download_speed = Some(1000.0);
        registry.upsert_telemetry(offline).unwrap();
        registry.rescore(&ScoreWeights::default(), Utc::now()).unwrap();

        let best = registry
            .best_device_for(&["slow", "fast", "offline"])
            .unwrap();
        assert_eq!(best.name(), "fast");

        assert!(registry.best_device_for(&["offline"]).is_none());
        assert!(registry.best_device_for(&[]).is_none());
    }

    #[test]
    fn test_set_online_unknown_device() {
        let registry = DeviceRegistry::new();
        assert!(!registry.set_online("missing", true));
    }
}
