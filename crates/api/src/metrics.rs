use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use pipeline::IngestionReport;

pub struct Metrics {
    // Counters
    ingestions: AtomicUsize,
    failed_ingestions: AtomicUsize,
    questions: AtomicUsize,
    failed_questions: AtomicUsize,

    // Timing (in microseconds)
    total_ingest_time_us: AtomicU64,
    total_query_time_us: AtomicU64,

    // Counts
    total_chunks_processed: AtomicUsize,
    total_chunks_skipped: AtomicUsize,
    total_entities_extracted: AtomicUsize,
    total_rejected: AtomicUsize,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ingestions: AtomicUsize::new(0),
            failed_ingestions: AtomicUsize::new(0),
            questions: AtomicUsize::new(0),
            failed_questions: AtomicUsize::new(0),
            total_ingest_time_us: AtomicU64::new(0),
            total_query_time_us: AtomicU64::new(0),
            total_chunks_processed: AtomicUsize::new(0),
            total_chunks_skipped: AtomicUsize::new(0),
            total_entities_extracted: AtomicUsize::new(0),
            total_rejected: AtomicUsize::new(0),
        })
    }

    pub fn record_ingest(&self, duration: Duration, report: Option<&IngestionReport>) {
        self.ingestions.fetch_add(1, Ordering::Relaxed);
        self.total_ingest_time_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        match report {
            Some(report) => {
                self.total_chunks_processed.fetch_add(report.chunks, Ordering::Relaxed);
                self.total_chunks_skipped.fetch_add(report.skipped_chunks.len(), Ordering::Relaxed);
                self.total_entities_extracted.fetch_add(report.entities, Ordering::Relaxed);
                self.total_rejected.fetch_add(report.rejected, Ordering::Relaxed);
            }
            None => {
                self.failed_ingestions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_question(&self, duration: Duration, success: bool) {
        self.questions.fetch_add(1, Ordering::Relaxed);
        self.total_query_time_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        if !success {
            self.failed_questions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ingestions: self.ingestions.load(Ordering::Relaxed),
            failed_ingestions: self.failed_ingestions.load(Ordering::Relaxed),
            questions: self.questions.load(Ordering::Relaxed),
            failed_questions: self.failed_questions.load(Ordering::Relaxed),
            avg_ingest_time_ms: self.avg_time_ms(&self.total_ingest_time_us, &self.ingestions),
            avg_query_time_ms: self.avg_time_ms(&self.total_query_time_us, &self.questions),
            total_chunks_processed: self.total_chunks_processed.load(Ordering::Relaxed),
            total_chunks_skipped: self.total_chunks_skipped.load(Ordering::Relaxed),
            total_entities_extracted: self.total_entities_extracted.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }

    fn avg_time_ms(&self, total_us: &AtomicU64, count: &AtomicUsize) -> f64 {
        let total = total_us.load(Ordering::Relaxed) as f64;
        let cnt = count.load(Ordering::Relaxed) as f64;
        if cnt > 0.0 {
            total / cnt / 1000.0 // Convert to ms
        } else {
            0.0
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub ingestions: usize,
    pub failed_ingestions: usize,
    pub questions: usize,
    pub failed_questions: usize,
    pub avg_ingest_time_ms: f64,
    pub avg_query_time_ms: f64,
    pub total_chunks_processed: usize,
    pub total_chunks_skipped: usize,
    pub total_entities_extracted: usize,
    pub total_rejected: usize,
}

pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_over_recorded_operations() {
        let metrics = Metrics::new();
        metrics.record_question(Duration::from_millis(10), true);
        metrics.record_question(Duration::from_millis(30), false);
        metrics.record_ingest(Duration::from_millis(5), None);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.questions, 2);
        assert_eq!(snapshot.failed_questions, 1);
        assert_eq!(snapshot.failed_ingestions, 1);
        assert!((snapshot.avg_query_time_ms - 20.0).abs() < 1e-6);
        assert_eq!(Metrics::new().snapshot().avg_ingest_time_ms, 0.0);
    }
}
