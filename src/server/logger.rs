//! # Session Persistence Collaborator
//!
//! Fire-and-forget sink for session reports and per-connection errors.
//! Handlers call this from their own tasks; appends to the shared CSV and
//! error log are serialized behind one mutex so concurrent sessions never
//! interleave lines. Failures are logged and swallowed — persistence must
//! never stall the protocol loop.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use log::{error, info};

use super::session::SessionMetrics;

pub struct SessionLogger {
    log_dir: PathBuf,
    append_lock: Mutex<()>,
}

impl SessionLogger {
    pub fn new(log_dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&log_dir)?;
        Ok(Self {
            log_dir,
            append_lock: Mutex::new(()),
        })
    }

    /// Record one finished session: a readable per-session report plus a
    /// summary row in the shared CSV.
    pub fn record_session(&self, metrics: &SessionMetrics) {
        if let Err(e) = self.write_session_report(metrics) {
            error!("failed to write session report: {e}");
        }
        if let Err(e) = self.append_csv_row(metrics) {
            error!("failed to append session csv row: {e}");
        }
        info!(
            "📝 session logged: {} - {} files, {:.1}s",
            metrics.ip,
            metrics.files.len(),
            metrics.duration_secs()
        );
    }

    /// Append one line to the shared error log.
    pub fn record_error(&self, ip: &str, message: &str, context: &str) {
        let line = format!(
            "{} | {} | {} | {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            ip,
            context,
            message
        );
        let _guard = match self.append_lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_dir.join("errors.log"))
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            error!("failed to append error log: {e}");
        }
    }

    fn write_session_report(&self, metrics: &SessionMetrics) -> std::io::Result<()> {
        let filename = format!(
            "session_{}.txt",
            metrics.connected_at.format("%Y%m%d_%H%M%S")
        );
        let mut out = String::new();
        out.push_str(&format!("client ip      : {}\n", metrics.ip));
        out.push_str(&format!(
            "connected      : {}\n",
            metrics.connected_at.format("%Y-%m-%d %H:%M:%S")
        ));
        if let Some(at) = metrics.disconnected_at {
            out.push_str(&format!(
                "disconnected   : {}\n",
                at.format("%Y-%m-%d %H:%M:%S")
            ));
        }
        out.push_str(&format!(
            "session length : {:.2}s\n",
            metrics.duration_secs()
        ));
        out.push_str(&format!("files processed: {}\n", metrics.files.len()));
        out.push_str(&format!("detections     : {}\n", metrics.detection_count()));
        out.push_str(&format!(
            "avg confidence : {:.3}\n\n",
            metrics.average_confidence()
        ));

        out.push_str(
            "file | labels | size_orig_kb | size_enc_kb | detect_s | encrypt_s | client_decrypt_s | confidence\n",
        );
        for file in &metrics.files {
            out.push_str(&format!(
                "{} | {} | {:.1} | {:.1} | {:.3} | {:.3} | {:.3} | {:.3}\n",
                file.filename,
                if file.labels.is_empty() {
                    "NO_DETECTION".to_string()
                } else {
                    file.labels.join(", ")
                },
                file.size_original_kb,
                file.size_encrypted_kb,
                file.detection_secs,
                file.encryption_secs,
                file.client_decrypt_secs,
                file.confidence,
            ));
        }

        std::fs::write(self.log_dir.join(filename), out)
    }

    fn append_csv_row(&self, metrics: &SessionMetrics) -> std::io::Result<()> {
        let path = self.log_dir.join("sessions.csv");
        let _guard = match self.append_lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let needs_header = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if needs_header {
            writeln!(
                file,
                "ip,connected_at,duration_secs,files,detections,avg_confidence"
            )?;
        }
        writeln!(
            file,
            "{},{},{:.2},{},{},{:.3}",
            metrics.ip,
            metrics.connected_at.format("%Y-%m-%d %H:%M:%S"),
            metrics.duration_secs(),
            metrics.files.len(),
            metrics.detection_count(),
            metrics.average_confidence(),
        )
    }
}
