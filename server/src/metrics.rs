use serde::Serialize;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const LATENCY_BUCKET_COUNT: usize = 12;
const LATENCY_BUCKETS_MS: [u64; LATENCY_BUCKET_COUNT] =
    [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

#[derive(Clone, Debug, Serialize)]
pub struct LatencySnapshot {
    pub buckets_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub overflow: u64,
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

#[derive(Default)]
struct LatencyMetrics {
    buckets: [AtomicU64; LATENCY_BUCKET_COUNT],
    overflow: AtomicU64,
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyMetrics {
    fn record(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        fetch_max(&self.max_ms, ms);

        match LATENCY_BUCKETS_MS.iter().position(|bucket| ms <= *bucket) {
            Some(idx) => self.buckets[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        let avg_ms = if count > 0 {
            total_ms as f64 / count as f64
        } else {
            0.0
        };

        LatencySnapshot {
            buckets_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            overflow: self.overflow.load(Ordering::Relaxed),
            count,
            avg_ms,
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

fn fetch_max(target: &AtomicU64, value: u64) {
    let mut current = target.load(Ordering::Relaxed);
    while value > current {
        match target.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(next) => current = next,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HttpMetricsSnapshot {
    pub submit: LatencySnapshot,
    pub finish: LatencySnapshot,
    pub details: LatencySnapshot,
    pub leaderboard: LatencySnapshot,
    pub reject_verification: u64,
    pub reject_invalid: u64,
    pub reject_rate_limit: u64,
    pub reject_body_limit: u64,
    pub reject_origin: u64,
    pub storage_errors: u64,
}

#[derive(Default)]
pub struct HttpMetrics {
    submit: LatencyMetrics,
    finish: LatencyMetrics,
    details: LatencyMetrics,
    leaderboard: LatencyMetrics,
    reject_verification: AtomicU64,
    reject_invalid: AtomicU64,
    reject_rate_limit: AtomicU64,
    reject_body_limit: AtomicU64,
    reject_origin: AtomicU64,
    storage_errors: AtomicU64,
}

impl HttpMetrics {
    pub fn record_submit(&self, duration: Duration) {
        self.submit.record(duration);
    }

    pub fn record_finish(&self, duration: Duration) {
        self.finish.record(duration);
    }

    pub fn record_details(&self, duration: Duration) {
        self.details.record(duration);
    }

    pub fn record_leaderboard(&self, duration: Duration) {
        self.leaderboard.record(duration);
    }

    pub fn inc_reject_verification(&self) {
        self.reject_verification.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reject_invalid(&self) {
        self.reject_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reject_rate_limit(&self) {
        self.reject_rate_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reject_body_limit(&self) {
        self.reject_body_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reject_origin(&self) {
        self.reject_origin.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_storage_error(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        HttpMetricsSnapshot {
            submit: self.submit.snapshot(),
            finish: self.finish.snapshot(),
            details: self.details.snapshot(),
            leaderboard: self.leaderboard.snapshot(),
            reject_verification: self.reject_verification.load(Ordering::Relaxed),
            reject_invalid: self.reject_invalid.load(Ordering::Relaxed),
            reject_rate_limit: self.reject_rate_limit.load(Ordering::Relaxed),
            reject_body_limit: self.reject_body_limit.load(Ordering::Relaxed),
            reject_origin: self.reject_origin.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ReferralMetricsSnapshot {
    pub credited: u64,
    pub bonus_punches: u64,
    pub self_referrals: u64,
    pub retried: u64,
    pub failed: u64,
    pub dropped: u64,
    pub queue_depth: u64,
    pub queue_high_water: u64,
    pub queue_backpressure: u64,
}

#[derive(Default)]
pub struct ReferralMetrics {
    credited: AtomicU64,
    bonus_punches: AtomicU64,
    self_referrals: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    queue_depth: AtomicU64,
    queue_high_water: AtomicU64,
    queue_backpressure: AtomicU64,
}

impl ReferralMetrics {
    pub fn record_credit(&self, bonus: u64) {
        self.credited.fetch_add(1, Ordering::Relaxed);
        self.bonus_punches.fetch_add(bonus, Ordering::Relaxed);
    }

    pub fn inc_self_referral(&self) {
        self.self_referrals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_queue_backpressure(&self) {
        self.queue_backpressure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_queue_depth(&self) {
        let depth = self.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        fetch_max(&self.queue_high_water, depth);
    }

    pub fn dec_queue_depth(&self) {
        let mut current = self.queue_depth.load(Ordering::Relaxed);
        while current > 0 {
            match self.queue_depth.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(next) => current = next,
            }
        }
    }

    pub fn snapshot(&self) -> ReferralMetricsSnapshot {
        ReferralMetricsSnapshot {
            credited: self.credited.load(Ordering::Relaxed),
            bonus_punches: self.bonus_punches.load(Ordering::Relaxed),
            self_referrals: self.self_referrals.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            queue_high_water: self.queue_high_water.load(Ordering::Relaxed),
            queue_backpressure: self.queue_backpressure.load(Ordering::Relaxed),
        }
    }
}

/// Render both metric families in the Prometheus text format.
pub fn render_prometheus(http: &HttpMetricsSnapshot, referral: &ReferralMetricsSnapshot) -> String {
    let mut out = String::new();

    append_histogram(&mut out, "punchcard_http_submit_latency_ms", &http.submit);
    append_histogram(&mut out, "punchcard_http_finish_latency_ms", &http.finish);
    append_histogram(&mut out, "punchcard_http_details_latency_ms", &http.details);
    append_histogram(
        &mut out,
        "punchcard_http_leaderboard_latency_ms",
        &http.leaderboard,
    );
    append_counter(
        &mut out,
        "punchcard_http_reject_verification_total",
        http.reject_verification,
    );
    append_counter(
        &mut out,
        "punchcard_http_reject_invalid_total",
        http.reject_invalid,
    );
    append_counter(
        &mut out,
        "punchcard_http_reject_rate_limit_total",
        http.reject_rate_limit,
    );
    append_counter(
        &mut out,
        "punchcard_http_reject_body_limit_total",
        http.reject_body_limit,
    );
    append_counter(
        &mut out,
        "punchcard_http_reject_origin_total",
        http.reject_origin,
    );
    append_counter(
        &mut out,
        "punchcard_http_storage_errors_total",
        http.storage_errors,
    );

    append_counter(&mut out, "punchcard_referral_credited_total", referral.credited);
    append_counter(
        &mut out,
        "punchcard_referral_bonus_punches_total",
        referral.bonus_punches,
    );
    append_counter(
        &mut out,
        "punchcard_referral_self_referrals_total",
        referral.self_referrals,
    );
    append_counter(&mut out, "punchcard_referral_retried_total", referral.retried);
    append_counter(&mut out, "punchcard_referral_failed_total", referral.failed);
    append_counter(&mut out, "punchcard_referral_dropped_total", referral.dropped);
    append_counter(
        &mut out,
        "punchcard_referral_queue_backpressure_total",
        referral.queue_backpressure,
    );
    append_gauge(&mut out, "punchcard_referral_queue_depth", referral.queue_depth);
    append_gauge(
        &mut out,
        "punchcard_referral_queue_high_water",
        referral.queue_high_water,
    );

    out
}

fn append_counter(out: &mut String, name: &str, value: u64) {
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn append_gauge(out: &mut String, name: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

fn append_histogram(out: &mut String, name: &str, snapshot: &LatencySnapshot) {
    let _ = writeln!(out, "# TYPE {name} histogram");
    let mut cumulative = 0u64;
    for (bucket, count) in snapshot.buckets_ms.iter().zip(snapshot.counts.iter()) {
        cumulative = cumulative.saturating_add(*count);
        let _ = writeln!(out, "{name}_bucket{{le=\"{bucket}\"}} {cumulative}");
    }
    cumulative = cumulative.saturating_add(snapshot.overflow);
    let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(out, "{name}_count {}", snapshot.count);
    let sum = snapshot.avg_ms * snapshot.count as f64;
    let _ = writeln!(out, "{name}_sum {sum}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_lands_in_smallest_fitting_bucket() {
        let metrics = LatencyMetrics::default();
        metrics.record(Duration::from_millis(3));
        metrics.record(Duration::from_millis(3));
        metrics.record(Duration::from_secs(10));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.count, 3);
        assert_eq!(snapshot.counts[2], 2);
        assert_eq!(snapshot.overflow, 1);
        assert_eq!(snapshot.max_ms, 10_000);
    }

    #[test]
    fn queue_depth_never_underflows() {
        let metrics = ReferralMetrics::default();
        metrics.dec_queue_depth();
        metrics.inc_queue_depth();
        metrics.inc_queue_depth();
        metrics.dec_queue_depth();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queue_depth, 1);
        assert_eq!(snapshot.queue_high_water, 2);
    }

    #[test]
    fn renders_prometheus_text() {
        let http = HttpMetrics::default();
        http.record_submit(Duration::from_millis(4));
        http.inc_reject_verification();
        let referral = ReferralMetrics::default();
        referral.record_credit(5);

        let body = render_prometheus(&http.snapshot(), &referral.snapshot());
        assert!(body.contains("# TYPE punchcard_http_submit_latency_ms histogram"));
        assert!(body.contains("punchcard_http_submit_latency_ms_bucket{le=\"5\"} 1"));
        assert!(body.contains("punchcard_http_reject_verification_total 1"));
        assert!(body.contains("punchcard_referral_bonus_punches_total 5"));
    }
}
