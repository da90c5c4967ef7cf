//! Progress reporter implementation
//!
//! Uses indicatif to render one negotiation:
//! - Status line with the current strategy or transfer step
//! - File count progress
//! - Byte progress of the current file with throughput and ETA

use crate::rendezvous::{ConnectionListener, ConnectionState, RendezvousConnection, RvEvent};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

fn style(template: &str, bar: bool) -> ProgressStyle {
    let base = if bar {
        ProgressStyle::default_bar()
    } else {
        ProgressStyle::default_spinner()
    };
    match base.clone().template(template) {
        Ok(style) if bar => style.progress_chars("=> "),
        Ok(style) => style,
        Err(_) => base,
    }
}

/// Renders the events of a connection as terminal progress bars
pub struct ProgressReporter {
    /// Multi-progress container
    multi: MultiProgress,
    /// Current file (bytes)
    bytes_bar: ProgressBar,
    /// File count progress bar
    files_bar: ProgressBar,
    /// Current status message
    status: ProgressBar,
    start_time: Instant,
    /// Bytes of completed files plus the current one
    bytes_done: AtomicU64,
    /// Bytes of completed files
    bytes_completed_files: AtomicU64,
    files_done: AtomicU64,
    total_files: AtomicU64,
    finished: AtomicBool,
    enabled: AtomicBool,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let multi = MultiProgress::new();

        let status = multi.add(ProgressBar::new_spinner());
        status.set_style(style("{spinner:.cyan} {msg}", false));
        status.enable_steady_tick(Duration::from_millis(120));

        let files_bar = multi.add(ProgressBar::new(0));
        files_bar.set_style(style(
            "{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} files ({percent}%)",
            true,
        ));
        files_bar.set_prefix("Files");

        let bytes_bar = multi.add(ProgressBar::new(0));
        bytes_bar.set_style(style(
            "{prefix:.bold.dim} [{bar:40.green/white}] {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta})",
            true,
        ));
        bytes_bar.set_prefix("Data ");

        Self {
            multi,
            bytes_bar,
            files_bar,
            status,
            start_time: Instant::now(),
            bytes_done: AtomicU64::new(0),
            bytes_completed_files: AtomicU64::new(0),
            files_done: AtomicU64::new(0),
            total_files: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
        }
    }

    /// Create a disabled progress reporter (for quiet mode)
    pub fn disabled() -> Self {
        let reporter = Self::new();
        reporter.enabled.store(false, Ordering::SeqCst);
        reporter.status.disable_steady_tick();
        reporter.multi.set_draw_target(ProgressDrawTarget::hidden());
        reporter
    }

    /// Check if progress is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Whether the connection reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn set_status(&self, msg: String) {
        self.status.set_message(msg);
    }

    fn set_current_file(&self, file: &str, transferred: u64, total: u64) {
        let display = if file.chars().count() > 60 {
            let tail: String = file.chars().rev().take(57).collect::<Vec<_>>().into_iter().rev().collect();
            format!("...{}", tail)
        } else {
            file.to_string()
        };
        self.status.set_message(format!("transferring {}", display));
        self.bytes_bar.set_length(total);
        self.bytes_bar.set_position(transferred);
        self.bytes_done.store(
            self.bytes_completed_files.load(Ordering::Relaxed) + transferred,
            Ordering::Relaxed,
        );
    }

    fn file_complete(&self, size: u64) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
        let completed = self.bytes_completed_files.fetch_add(size, Ordering::Relaxed) + size;
        self.bytes_done.store(completed, Ordering::Relaxed);
        self.files_bar.inc(1);
        self.bytes_bar.set_position(self.bytes_bar.length().unwrap_or(size));
    }

    /// Finish progress with success message
    pub fn finish_success(&self, message: &str) {
        self.finished.store(true, Ordering::SeqCst);
        self.status.finish_with_message(format!("✓ {}", message));
        self.files_bar.finish();
        self.bytes_bar.finish();
    }

    /// Finish progress with error message
    pub fn finish_error(&self, message: &str) {
        self.finished.store(true, Ordering::SeqCst);
        self.status.finish_with_message(format!("✗ {}", message));
        self.files_bar.abandon();
        self.bytes_bar.abandon();
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get progress summary
    pub fn summary(&self) -> ProgressSummary {
        let bytes = self.bytes_done.load(Ordering::Relaxed);
        let elapsed = self.elapsed();
        let secs = elapsed.as_secs_f64();
        ProgressSummary {
            bytes_transferred: bytes,
            files_done: self.files_done.load(Ordering::Relaxed),
            total_files: self.total_files.load(Ordering::Relaxed),
            elapsed,
            throughput: if secs > 0.0 { bytes as f64 / secs } else { 0.0 },
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionListener for ProgressReporter {
    fn state_changed(
        &self,
        conn: &RendezvousConnection,
        _old: ConnectionState,
        new: ConnectionState,
        event: Option<&RvEvent>,
    ) {
        match new {
            ConnectionState::Preparing => {
                if let Some(description) = conn.description() {
                    self.total_files.store(description.file_count as u64, Ordering::Relaxed);
                    self.files_bar.set_length(description.file_count as u64);
                }
                self.set_status(format!("negotiating with {}", conn.peer()));
            }
            ConnectionState::Finished => {
                let message = match event {
                    Some(RvEvent::TransferComplete(summary)) => format!(
                        "{} file(s), {} in {:.1?} ({}/s)",
                        summary.files,
                        humansize::format_size(summary.bytes_transferred, humansize::BINARY),
                        summary.elapsed,
                        humansize::format_size(summary.throughput() as u64, humansize::BINARY)
                    ),
                    _ => "transfer complete".to_string(),
                };
                self.finish_success(&message);
            }
            ConnectionState::Failed => {
                let message = event
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "connection failed".to_string());
                self.finish_error(&message);
            }
            _ => {
                if let Some(event) = event {
                    self.set_status(event.to_string());
                }
            }
        }
    }

    fn event_received(&self, _conn: &RendezvousConnection, event: &RvEvent) {
        match event {
            RvEvent::TransferringFile {
                file,
                transferred,
                total,
            } => self.set_current_file(file, *transferred, *total),
            RvEvent::FileComplete { size, .. } => self.file_complete(*size),
            RvEvent::Checksumming { file, done, total } => self.set_status(format!(
                "checksumming {} ({}/{})",
                file,
                humansize::format_size(*done, humansize::BINARY),
                humansize::format_size(*total, humansize::BINARY)
            )),
            other => self.set_status(other.to_string()),
        }
    }
}

/// Progress summary
#[derive(Debug, Clone)]
pub struct ProgressSummary {
    /// Bytes transferred so far
    pub bytes_transferred: u64,
    /// Files completed so far
    pub files_done: u64,
    /// Files in the batch
    pub total_files: u64,
    /// Elapsed time
    pub elapsed: Duration,
    /// Throughput in bytes/second
    pub throughput: f64,
}

impl ProgressSummary {
    /// Print summary to console
    pub fn print(&self) {
        println!("Files:    {}/{}", self.files_done, self.total_files);
        println!(
            "Bytes:    {}",
            humansize::format_size(self.bytes_transferred, humansize::BINARY)
        );
        println!("Elapsed:  {:.1?}", self.elapsed);
        println!(
            "Speed:    {}/s",
            humansize::format_size(self.throughput as u64, humansize::BINARY)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracks_file_progress() {
        let reporter = ProgressReporter::disabled();
        assert!(!reporter.is_enabled());

        reporter.set_current_file("a.bin", 400, 1000);
        reporter.file_complete(1000);
        reporter.set_current_file("b.bin", 250, 500);

        let summary = reporter.summary();
        assert_eq!(summary.files_done, 1);
        assert_eq!(summary.bytes_transferred, 1250);
    }

    #[test]
    fn test_long_names_are_truncated() {
        let reporter = ProgressReporter::disabled();
        let name = "d/".repeat(50) + "file.bin";
        reporter.set_current_file(&name, 0, 10);
        assert!(reporter.status.message().chars().count() < 80);
        assert!(reporter.status.message().ends_with("file.bin"));
    }

    #[test]
    fn test_finish_marks_done() {
        let reporter = ProgressReporter::disabled();
        reporter.finish_error("rejected by peer");
        assert!(reporter.is_finished());
    }
}
