//! Per-frequency channel quality ledger.
//!
//! The orchestrator aggregates client scan reports here. Each frequency maps
//! reporting devices to their latest (quality, timestamp) pair; the average
//! only considers reports within the expiry window of the freshest report
//! for that frequency, so a node that went quiet stops dragging the average
//! around. Stale entries are ignored, not deleted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Latest report from one device for one frequency.
#[derive(Debug, Clone, Copy)]
pub struct NodeReport {
    pub quality: u32,
    pub timestamp: Instant,
}

#[derive(Debug, Default)]
struct FreqEntry {
    nodes: HashMap<String, NodeReport>,
    average_quality: Option<f64>,
}

impl FreqEntry {
    fn recompute(&mut self, window: Duration) {
        let latest = self.nodes.values().map(|report| report.timestamp).max();
        self.average_quality = latest.and_then(|latest| {
            let valid: Vec<f64> = self
                .nodes
                .values()
                .filter(|report| latest.duration_since(report.timestamp) <= window)
                .map(|report| f64::from(report.quality))
                .collect();
            if valid.is_empty() {
                None
            } else {
                Some(valid.iter().sum::<f64>() / valid.len() as f64)
            }
        });
    }
}

/// Quality ledger owned by the server FSM thread.
#[derive(Debug)]
pub struct QualityLedger {
    entries: HashMap<u32, FreqEntry>,
    expiry_window: Duration,
}

impl QualityLedger {
    pub fn new(expiry_window: Duration) -> Self {
        QualityLedger {
            entries: HashMap::new(),
            expiry_window,
        }
    }

    /// Insert or overwrite the (frequency, device) report and recompute the
    /// frequency's average.
    pub fn ingest(&mut self, freq: u32, device: &str, quality: u32, timestamp: Instant) {
        let entry = self.entries.entry(freq).or_default();
        entry
            .nodes
            .insert(device.to_string(), NodeReport { quality, timestamp });
        entry.recompute(self.expiry_window);
        log::info!(
            "Channel quality average for freq {freq}: {:?}",
            entry.average_quality
        );
    }

    pub fn average_quality(&self, freq: u32) -> Option<f64> {
        self.entries.get(&freq).and_then(|entry| entry.average_quality)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Frequencies ranked ascending by average quality, best first.
    ///
    /// Frequencies whose average is unknown sort last; frequency number
    /// breaks ties so the order is deterministic.
    pub fn ranked(&self) -> Vec<(u32, Option<f64>)> {
        let mut list: Vec<(u32, Option<f64>)> = self
            .entries
            .iter()
            .map(|(freq, entry)| (*freq, entry.average_quality))
            .collect();
        list.sort_by(|a, b| match (a.1, b.1) {
            (Some(x), Some(y)) => x.total_cmp(&y).then(a.0.cmp(&b.0)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.0.cmp(&b.0),
        });
        list
    }

    /// Frequencies with a known average, best first.
    pub fn scored(&self) -> Vec<u32> {
        self.ranked()
            .into_iter()
            .filter(|(_, avg)| avg.is_some())
            .map(|(freq, _)| freq)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(30);

    fn at(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn average_only_counts_reports_within_the_expiry_window() {
        let base = Instant::now();
        let mut ledger = QualityLedger::new(WINDOW);
        ledger.ingest(5180, "A", 2, at(base, 100));
        ledger.ingest(5180, "B", 10, at(base, 105));
        ledger.ingest(5180, "C", 4, at(base, 160));

        // T = 160, window [130, 160]: only C qualifies.
        assert_eq!(ledger.average_quality(5180), Some(4.0));
    }

    #[test]
    fn reports_on_the_window_boundary_still_count() {
        let base = Instant::now();
        let mut ledger = QualityLedger::new(WINDOW);
        ledger.ingest(5180, "A", 2, at(base, 100));
        ledger.ingest(5180, "B", 6, at(base, 130));

        // 130 - 30 = 100, inclusive: both qualify.
        assert_eq!(ledger.average_quality(5180), Some(4.0));
    }

    #[test]
    fn fresher_report_from_the_same_device_overwrites() {
        let base = Instant::now();
        let mut ledger = QualityLedger::new(WINDOW);
        ledger.ingest(5200, "A", 9, at(base, 10));
        ledger.ingest(5200, "A", 3, at(base, 12));

        assert_eq!(ledger.average_quality(5200), Some(3.0));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn ranking_is_ascending_by_average() {
        let base = Instant::now();
        let mut ledger = QualityLedger::new(WINDOW);
        ledger.ingest(5220, "A", 3, at(base, 10));
        ledger.ingest(5180, "A", 1, at(base, 10));
        ledger.ingest(5200, "A", 2, at(base, 10));

        assert_eq!(ledger.scored(), vec![5180, 5200, 5220]);
    }

    #[test]
    fn unknown_freq_has_no_average() {
        let ledger = QualityLedger::new(WINDOW);
        assert_eq!(ledger.average_quality(5180), None);
        assert!(ledger.is_empty());
        assert!(ledger.scored().is_empty());
    }
}
