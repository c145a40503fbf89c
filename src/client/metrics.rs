//! Transfer statistics for batch runs: per-file phase timings, aggregated
//! latency percentiles, and a JSON export for offline comparison.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::client::client::TransferReport;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferMetric {
    pub filename: String,
    pub upload_ms: u64,
    pub response_ms: u64,
    pub decrypt_ms: u64,
    pub total_ms: u64,
    pub success: bool,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AggregatedStats {
    pub total_transfers: usize,
    pub successful_transfers: usize,
    pub failed_transfers: usize,
    pub failure_rate: f64,

    // Total-latency statistics (milliseconds), successful transfers only.
    pub latency_min_ms: u64,
    pub latency_max_ms: u64,
    pub latency_avg_ms: f64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,

    pub avg_upload_ms: f64,
    pub avg_response_ms: f64,
    pub avg_decrypt_ms: f64,

    pub failure_reasons: HashMap<String, usize>,
}

#[derive(Debug)]
pub struct ClientMetrics {
    client_name: String,
    start_time: Instant,
    transfers: Vec<TransferMetric>,
}

impl ClientMetrics {
    pub fn new(client_name: String) -> Self {
        Self {
            client_name,
            start_time: Instant::now(),
            transfers: Vec::new(),
        }
    }

    pub fn record_success(&mut self, report: &TransferReport) {
        self.transfers.push(TransferMetric {
            filename: report.filename.clone(),
            upload_ms: (report.upload_secs * 1000.0) as u64,
            response_ms: (report.response_secs * 1000.0) as u64,
            decrypt_ms: (report.decrypt_secs * 1000.0) as u64,
            total_ms: (report.total_secs * 1000.0) as u64,
            success: true,
            failure_reason: None,
        });
    }

    pub fn record_failure(&mut self, filename: &str, reason: String) {
        self.transfers.push(TransferMetric {
            filename: filename.to_string(),
            upload_ms: 0,
            response_ms: 0,
            decrypt_ms: 0,
            total_ms: 0,
            success: false,
            failure_reason: Some(reason),
        });
    }

    pub fn aggregate(&self) -> AggregatedStats {
        let mut stats = AggregatedStats::default();
        if self.transfers.is_empty() {
            return stats;
        }

        stats.total_transfers = self.transfers.len();
        stats.successful_transfers = self.transfers.iter().filter(|t| t.success).count();
        stats.failed_transfers = stats.total_transfers - stats.successful_transfers;
        stats.failure_rate =
            (stats.failed_transfers as f64 / stats.total_transfers as f64) * 100.0;

        let successful: Vec<&TransferMetric> =
            self.transfers.iter().filter(|t| t.success).collect();
        if !successful.is_empty() {
            let mut latencies: Vec<u64> = successful.iter().map(|t| t.total_ms).collect();
            latencies.sort_unstable();

            stats.latency_min_ms = *latencies.first().unwrap();
            stats.latency_max_ms = *latencies.last().unwrap();
            stats.latency_avg_ms =
                latencies.iter().sum::<u64>() as f64 / latencies.len() as f64;
            stats.latency_p50_ms = percentile(&latencies, 50.0);
            stats.latency_p95_ms = percentile(&latencies, 95.0);
            stats.latency_p99_ms = percentile(&latencies, 99.0);

            let n = successful.len() as f64;
            stats.avg_upload_ms = successful.iter().map(|t| t.upload_ms).sum::<u64>() as f64 / n;
            stats.avg_response_ms =
                successful.iter().map(|t| t.response_ms).sum::<u64>() as f64 / n;
            stats.avg_decrypt_ms =
                successful.iter().map(|t| t.decrypt_ms).sum::<u64>() as f64 / n;
        }

        for transfer in self.transfers.iter().filter(|t| !t.success) {
            if let Some(reason) = &transfer.failure_reason {
                *stats.failure_reasons.entry(reason.clone()).or_insert(0) += 1;
            }
        }

        stats
    }

    pub fn export_to_json<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let stats = self.aggregate();
        let output = serde_json::json!({
            "client_name": self.client_name,
            "run_duration_secs": self.start_time.elapsed().as_secs(),
            "aggregated_stats": stats,
        });
        let json_string = serde_json::to_string_pretty(&output)?;
        let mut file = File::create(path)?;
        file.write_all(json_string.as_bytes())?;
        Ok(())
    }
}

fn percentile(sorted_data: &[u64], percentile: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }
    let index = (percentile / 100.0 * (sorted_data.len() - 1) as f64).round() as usize;
    sorted_data[index.min(sorted_data.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn report(total_ms: u64) -> TransferReport {
        TransferReport {
            filename: "padi.jpg".to_string(),
            upload_secs: 0.1,
            response_secs: 0.2,
            decrypt_secs: 0.01,
            total_secs: total_ms as f64 / 1000.0,
            encrypted_bytes: 1032,
            plaintext_bytes: 1024,
            format_hint: "JPEG",
            output_path: PathBuf::from("client_data/results/detected_padi.jpg"),
            telemetry_acked: true,
        }
    }

    #[test]
    fn test_percentile() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        assert_eq!(percentile(&data, 50.0), 5);
        assert_eq!(percentile(&data, 95.0), 10);
        assert_eq!(percentile(&data, 0.0), 1);
    }

    #[test]
    fn aggregation_splits_successes_and_failures() {
        let mut metrics = ClientMetrics::new("bench".to_string());
        metrics.record_success(&report(100));
        metrics.record_success(&report(300));
        metrics.record_failure("broken.jpg", "timeout".to_string());

        let stats = metrics.aggregate();
        assert_eq!(stats.total_transfers, 3);
        assert_eq!(stats.successful_transfers, 2);
        assert_eq!(stats.failed_transfers, 1);
        assert_eq!(stats.latency_min_ms, 100);
        assert_eq!(stats.latency_max_ms, 300);
        assert_eq!(stats.failure_reasons.get("timeout"), Some(&1));
    }

    #[test]
    fn export_writes_parseable_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let mut metrics = ClientMetrics::new("bench".to_string());
        metrics.record_success(&report(42));
        metrics.export_to_json(&path).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["client_name"], "bench");
        assert_eq!(parsed["aggregated_stats"]["total_transfers"], 1);
    }
}
