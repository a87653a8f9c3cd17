use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Keep this many render durations per template for percentiles.
const DURATION_SAMPLES: usize = 100;

/// Metrics collector for Prometheus-compatible output
pub struct MetricsCollector {
    jobs_submitted: AtomicU64,
    jobs_done: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_expired: AtomicU64,
    queue_depth: AtomicU64,
    render_durations: DashMap<String, Vec<u64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            jobs_submitted: AtomicU64::new(0),
            jobs_done: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_expired: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            render_durations: DashMap::new(),
        }
    }

    /// Returns the lifetime submission count including this one.
    pub fn record_submission(&self) -> u64 {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_dequeue(&self) {
        let _ = self
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(1)));
    }

    pub fn record_success(&self, template: &str, duration_ms: u64) {
        self.jobs_done.fetch_add(1, Ordering::Relaxed);

        let mut entry = self
            .render_durations
            .entry(template.to_string())
            .or_insert_with(Vec::new);
        entry.push(duration_ms);
        let len = entry.len();
        if len > DURATION_SAMPLES {
            entry.drain(0..len - DURATION_SAMPLES);
        }
    }

    pub fn record_failure(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self, count: u64) {
        self.jobs_expired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Generate Prometheus-compatible metrics output
    pub fn export(&self) -> String {
        let mut output = String::new();

        counter(&mut output, "labelq_jobs_submitted_total", "Total number of submitted jobs", &self.jobs_submitted);
        counter(&mut output, "labelq_jobs_done_total", "Total number of jobs that produced a PDF", &self.jobs_done);
        counter(&mut output, "labelq_jobs_failed_total", "Total number of failed jobs", &self.jobs_failed);
        counter(&mut output, "labelq_jobs_expired_total", "Total number of jobs removed by retention", &self.jobs_expired);

        output.push_str("# HELP labelq_queue_depth Jobs waiting for a worker\n");
        output.push_str("# TYPE labelq_queue_depth gauge\n");
        output.push_str(&format!("labelq_queue_depth {}\n\n", self.queue_depth()));

        // Duration percentiles
        output.push_str("# HELP labelq_render_duration_ms Render duration percentiles per template\n");
        output.push_str("# TYPE labelq_render_duration_ms gauge\n");
        for entry in self.render_durations.iter() {
            let mut durations = entry.value().clone();
            if durations.is_empty() {
                continue;
            }
            durations.sort_unstable();
            for (label, p) in [("0.5", 50.0), ("0.95", 95.0), ("0.99", 99.0)] {
                output.push_str(&format!(
                    "labelq_render_duration_ms{{template=\"{}\",quantile=\"{}\"}} {}\n",
                    entry.key(),
                    label,
                    percentile(&durations, p)
                ));
            }
        }

        output
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: &AtomicU64) {
    output.push_str(&format!("# HELP {} {}\n", name, help));
    output.push_str(&format!("# TYPE {} counter\n", name));
    output.push_str(&format!("{} {}\n\n", name, value.load(Ordering::Relaxed)));
}

fn percentile(sorted_data: &[u64], p: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }
    let index = ((p / 100.0) * (sorted_data.len() as f64 - 1.0)).round() as usize;
    sorted_data[index.min(sorted_data.len() - 1)]
}
