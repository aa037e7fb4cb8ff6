//! Metrics registry aggregating energy readings into Prometheus series.
//!
//! Every distinct `(device, room, type)` tuple owns a series holding a
//! cumulative total (exported as a counter) and the last reported value
//! (exported as a gauge). Series are created on first observation and live
//! for the lifetime of the process.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smanager_common::{LabelKey, Reading};
use thiserror::Error;
use tracing::debug;

/// Name of the cumulative consumption counter.
pub const TOTAL_METRIC: &str = "energy_total_consumption";

/// Name of the last-value consumption gauge.
pub const CURRENT_METRIC: &str = "current_energy_consumption";

const TOTAL_HELP: &str = "Total energy consumption for all devices in the smart home";
const CURRENT_HELP: &str = "Current energy consumption for all devices in the smart home";

/// Reasons a reading is refused by the registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApplyError {
    #[error("Negative energy consumption {value} for {key}: counters cannot decrease")]
    NegativeConsumption { key: LabelKey, value: f64 },

    #[error("Non-finite energy consumption for {key}")]
    NonFinite { key: LabelKey },
}

/// Accumulators for one label tuple.
#[derive(Debug, Default, Clone, Copy)]
struct Series {
    total: f64,
    current: f64,
}

/// Point-in-time copy of one series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSnapshot {
    pub key: LabelKey,
    /// Sum of every applied reading.
    pub total: f64,
    /// Value of the most recently applied reading.
    pub current: f64,
}

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Readings folded into a series.
    pub readings_applied: u64,
    /// Readings refused with an [`ApplyError`].
    pub readings_rejected: u64,
}

/// Thread-safe store of energy series.
///
/// The key map is only write-locked when a new series appears; updates to
/// an existing series take that series' own lock, so a `(total, current)`
/// pair is always read and written as a unit.
pub struct MetricsRegistry {
    /// Series indexed by label tuple.
    series: RwLock<HashMap<LabelKey, Arc<Mutex<Series>>>>,
    /// Prefix for the exporter's own metrics.
    prefix: String,
    /// Statistics.
    stats: RwLock<RegistryStats>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            prefix: prefix.into(),
            stats: RwLock::new(RegistryStats::default()),
        }
    }

    /// Fold a reading into its series: add to the total, overwrite the current value.
    pub fn apply(&self, reading: &Reading) -> Result<(), ApplyError> {
        let value = reading.energy_consumption;

        if !value.is_finite() {
            self.stats.write().readings_rejected += 1;
            return Err(ApplyError::NonFinite {
                key: reading.label_key(),
            });
        }
        if value < 0.0 {
            self.stats.write().readings_rejected += 1;
            return Err(ApplyError::NegativeConsumption {
                key: reading.label_key(),
                value,
            });
        }

        let series = self.series_for(reading.label_key());
        {
            let mut series = series.lock();
            series.total += value;
            series.current = value;
        }

        self.stats.write().readings_applied += 1;
        Ok(())
    }

    /// Copy every series, sorted by label tuple.
    pub fn snapshot(&self) -> Vec<SeriesSnapshot> {
        let entries: Vec<(LabelKey, Arc<Mutex<Series>>)> = self
            .series
            .read()
            .iter()
            .map(|(key, series)| (key.clone(), series.clone()))
            .collect();

        let mut snapshot: Vec<SeriesSnapshot> = entries
            .into_iter()
            .map(|(key, series)| {
                let Series { total, current } = *series.lock();
                SeriesSnapshot {
                    key,
                    total,
                    current,
                }
            })
            .collect();

        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot
    }

    /// Copy a single series.
    pub fn get(&self, key: &LabelKey) -> Option<SeriesSnapshot> {
        let series = self.series.read().get(key).cloned()?;
        let Series { total, current } = *series.lock();
        Some(SeriesSnapshot {
            key: key.clone(),
            total,
            current,
        })
    }

    /// Get the current number of stored series.
    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        self.stats.read().clone()
    }

    /// Render metrics in Prometheus exposition format.
    pub fn render(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = Vec::with_capacity(snapshot.len() * 200 + 512);

        writeln!(output, "# HELP {} {}", TOTAL_METRIC, TOTAL_HELP).ok();
        writeln!(output, "# TYPE {} counter", TOTAL_METRIC).ok();
        for series in &snapshot {
            writeln!(
                output,
                "{}{} {}",
                TOTAL_METRIC,
                format_labels(&series.key),
                format_value(series.total)
            )
            .ok();
        }

        writeln!(output, "# HELP {} {}", CURRENT_METRIC, CURRENT_HELP).ok();
        writeln!(output, "# TYPE {} gauge", CURRENT_METRIC).ok();
        for series in &snapshot {
            writeln!(
                output,
                "{}{} {}",
                CURRENT_METRIC,
                format_labels(&series.key),
                format_value(series.current)
            )
            .ok();
        }

        // Add registry stats as metrics
        let stats = self.stats();
        writeln!(output).ok();
        writeln!(output, "# TYPE {}_exporter_series_total gauge", self.prefix).ok();
        writeln!(
            output,
            "{}_exporter_series_total {}",
            self.prefix,
            snapshot.len()
        )
        .ok();

        writeln!(
            output,
            "# TYPE {}_exporter_readings_applied_total counter",
            self.prefix
        )
        .ok();
        writeln!(
            output,
            "{}_exporter_readings_applied_total {}",
            self.prefix, stats.readings_applied
        )
        .ok();

        writeln!(
            output,
            "# TYPE {}_exporter_readings_rejected_total counter",
            self.prefix
        )
        .ok();
        writeln!(
            output,
            "{}_exporter_readings_rejected_total {}",
            self.prefix, stats.readings_rejected
        )
        .ok();

        String::from_utf8(output).unwrap_or_default()
    }

    fn series_for(&self, key: LabelKey) -> Arc<Mutex<Series>> {
        if let Some(series) = self.series.read().get(&key) {
            return series.clone();
        }

        let mut map = self.series.write();
        // Another writer may have inserted it between the two locks
        if let Some(series) = map.get(&key) {
            return series.clone();
        }

        debug!(series = %key, "New energy series");
        let series = Arc::new(Mutex::new(Series::default()));
        map.insert(key, series.clone());
        series
    }
}

/// Create a shareable registry handle.
pub type SharedRegistry = Arc<MetricsRegistry>;

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

/// Format a label tuple for Prometheus exposition format.
fn format_labels(key: &LabelKey) -> String {
    let parts: Vec<String> = key
        .labels()
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();

    format!("{{{}}}", parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_registry() -> MetricsRegistry {
        MetricsRegistry::new("home_smanager")
    }

    fn reading(device: &str, room: &str, value: f64) -> Reading {
        Reading::new(device, room, "sensor", value)
    }

    #[test]
    fn test_apply_accumulates_total_and_overwrites_current() {
        let registry = make_registry();

        registry.apply(&reading("d", "r", 5.0)).unwrap();
        registry.apply(&reading("d", "r", 3.0)).unwrap();

        let series = registry.get(&LabelKey::new("d", "r", "sensor")).unwrap();
        assert_eq!(series.total, 8.0);
        assert_eq!(series.current, 3.0);
        assert_eq!(registry.series_count(), 1);
        assert_eq!(registry.stats().readings_applied, 2);
    }

    #[test]
    fn test_duplicate_readings_double_count() {
        let registry = make_registry();
        let r = reading("device1", "kitchen", 2.5);

        registry.apply(&r).unwrap();
        registry.apply(&r).unwrap();

        let series = registry.get(&r.label_key()).unwrap();
        assert_eq!(series.total, 5.0);
        assert_eq!(series.current, 2.5);
    }

    #[test]
    fn test_key_isolation() {
        let registry = make_registry();

        registry.apply(&reading("a", "kitchen", 1.0)).unwrap();
        let before = registry.get(&LabelKey::new("a", "kitchen", "sensor")).unwrap();

        registry.apply(&reading("b", "kitchen", 10.0)).unwrap();
        registry.apply(&reading("a", "bedroom", 20.0)).unwrap();
        registry
            .apply(&Reading::new("a", "kitchen", "plug", 30.0))
            .unwrap();

        let after = registry.get(&LabelKey::new("a", "kitchen", "sensor")).unwrap();
        assert_eq!(before, after);
        assert_eq!(registry.series_count(), 4);
    }

    #[test]
    fn test_negative_reading_rejected() {
        let registry = make_registry();
        registry.apply(&reading("d", "r", 4.0)).unwrap();

        let result = registry.apply(&reading("d", "r", -1.0));
        assert!(matches!(
            result,
            Err(ApplyError::NegativeConsumption { value, .. }) if value == -1.0
        ));

        let series = registry.get(&LabelKey::new("d", "r", "sensor")).unwrap();
        assert_eq!(series.total, 4.0);
        assert_eq!(series.current, 4.0);
        assert_eq!(registry.stats().readings_rejected, 1);
    }

    #[test]
    fn test_non_finite_reading_rejected() {
        let registry = make_registry();
        assert!(matches!(
            registry.apply(&reading("d", "r", f64::NAN)),
            Err(ApplyError::NonFinite { .. })
        ));
        assert_eq!(registry.series_count(), 0);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let registry = make_registry();
        registry.apply(&reading("device2", "kitchen", 1.0)).unwrap();
        registry.apply(&reading("device1", "kitchen", 1.0)).unwrap();
        registry.apply(&reading("device1", "bedroom", 1.0)).unwrap();

        let keys: Vec<LabelKey> = registry.snapshot().into_iter().map(|s| s.key).collect();
        assert_eq!(
            keys,
            vec![
                LabelKey::new("device1", "bedroom", "sensor"),
                LabelKey::new("device1", "kitchen", "sensor"),
                LabelKey::new("device2", "kitchen", "sensor"),
            ]
        );
    }

    #[test]
    fn test_snapshot_reflects_latest_sequential_apply() {
        let registry = make_registry();
        let key = LabelKey::new("d", "r", "sensor");

        let mut expected_total = 0.0;
        for k in 1..=50 {
            let value = f64::from(k) * 0.5;
            registry.apply(&reading("d", "r", value)).unwrap();
            expected_total += value;

            let snapshot = registry.snapshot();
            assert_eq!(snapshot.len(), 1);
            assert_eq!(snapshot[0].key, key);
            assert_eq!(snapshot[0].total, expected_total);
            assert_eq!(snapshot[0].current, value);
        }
    }

    #[test]
    fn test_concurrent_apply_loses_no_updates() {
        let registry = Arc::new(make_registry());
        let threads = 8;
        let per_thread = 1250;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..per_thread {
                        registry.apply(&reading("d", "r", 1.0)).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let series = registry.get(&LabelKey::new("d", "r", "sensor")).unwrap();
        assert_eq!(series.total, 10_000.0);
        assert_eq!(series.current, 1.0);
        assert_eq!(registry.stats().readings_applied, 10_000);
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_pairs() {
        let registry = Arc::new(make_registry());
        let key = LabelKey::new("d", "r", "sensor");
        let steps = 5_000u32;

        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for i in 1..=steps {
                    registry.apply(&reading("d", "r", f64::from(i))).unwrap();
                }
            })
        };

        // total after applying 1..=n is n(n+1)/2 where n == current
        while !writer.is_finished() {
            if let Some(series) = registry.get(&key) {
                let n = series.current;
                assert_eq!(series.total, n * (n + 1.0) / 2.0);
            }
        }
        writer.join().unwrap();

        let series = registry.get(&key).unwrap();
        assert_eq!(series.current, f64::from(steps));
    }

    #[test]
    fn test_render_format() {
        let registry = make_registry();
        registry
            .apply(&reading("device1", "living_room", 12.5))
            .unwrap();
        registry
            .apply(&reading("device1", "living_room", 7.25))
            .unwrap();

        let output = registry.render();

        assert!(output.contains("# TYPE energy_total_consumption counter"));
        assert!(output.contains("# TYPE current_energy_consumption gauge"));
        assert!(output.contains(
            "energy_total_consumption{device=\"device1\",room=\"living_room\",type=\"sensor\"} 19.75"
        ));
        assert!(output.contains(
            "current_energy_consumption{device=\"device1\",room=\"living_room\",type=\"sensor\"} 7.25"
        ));
        assert!(output.contains("home_smanager_exporter_series_total 1"));
        assert!(output.contains("home_smanager_exporter_readings_applied_total 2"));
    }

    #[test]
    fn test_render_empty_registry() {
        let output = make_registry().render();
        assert!(output.contains("# TYPE energy_total_consumption counter"));
        assert!(!output.contains("energy_total_consumption{"));
        assert!(output.contains("home_smanager_exporter_series_total 0"));
    }

    #[test]
    fn test_render_escapes_label_values() {
        let registry = make_registry();
        registry
            .apply(&Reading::new("dev\"ice", "back\\room", "multi\nline", 1.0))
            .unwrap();

        let output = registry.render();
        assert!(output.contains(r#"device="dev\"ice",room="back\\room",type="multi\nline""#));
    }

    #[test]
    fn test_escape_label_value() {
        assert_eq!(escape_label_value("simple"), "simple");
        assert_eq!(escape_label_value("with\"quote"), "with\\\"quote");
        assert_eq!(escape_label_value("with\\backslash"), "with\\\\backslash");
        assert_eq!(escape_label_value("with\nnewline"), "with\\nnewline");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(42.0), "42");
        assert_eq!(format_value(19.75), "19.75");
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(f64::NEG_INFINITY), "-Inf");
    }
}
