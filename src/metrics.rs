//! Process-wide counters for the accept/dispatch pipeline.
//!
//! With the `metrics` feature every hook is a relaxed atomic increment and a
//! reporter thread logs deltas periodically. Without it every hook is a no-op.

#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use tracing::info;

    static CONNECTIONS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
    static ACCEPT_FAILURES: AtomicU64 = AtomicU64::new(0);
    // Acceptor sleeps caused by an exhausted free list or a full pending queue.
    static BACKPRESSURE_WAITS: AtomicU64 = AtomicU64::new(0);
    static JOBS_DISPATCHED: AtomicU64 = AtomicU64::new(0);
    static JOBS_COMPLETED: AtomicU64 = AtomicU64::new(0);
    static JOB_PANICS: AtomicU64 = AtomicU64::new(0);
    static RECV_FAILURES: AtomicU64 = AtomicU64::new(0);

    #[derive(Debug, Clone, Copy, Default)]
    pub struct MetricsSnapshot {
        pub connections_accepted: u64,
        pub accept_failures: u64,
        pub backpressure_waits: u64,
        pub jobs_dispatched: u64,
        pub jobs_completed: u64,
        pub job_panics: u64,
        pub recv_failures: u64,
    }

    pub fn inc_connections_accepted() {
        CONNECTIONS_ACCEPTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_accept_failures() {
        ACCEPT_FAILURES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_backpressure_waits() {
        BACKPRESSURE_WAITS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_jobs_dispatched() {
        JOBS_DISPATCHED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_jobs_completed() {
        JOBS_COMPLETED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_job_panics() {
        JOB_PANICS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_recv_failures() {
        RECV_FAILURES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: CONNECTIONS_ACCEPTED.load(Ordering::Relaxed),
            accept_failures: ACCEPT_FAILURES.load(Ordering::Relaxed),
            backpressure_waits: BACKPRESSURE_WAITS.load(Ordering::Relaxed),
            jobs_dispatched: JOBS_DISPATCHED.load(Ordering::Relaxed),
            jobs_completed: JOBS_COMPLETED.load(Ordering::Relaxed),
            job_panics: JOB_PANICS.load(Ordering::Relaxed),
            recv_failures: RECV_FAILURES.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        let spawned = std::thread::Builder::new()
            .name("metrics".into())
            .spawn(|| {
                let mut last = snapshot();
                loop {
                    std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                    let snap = snapshot();
                    info!(
                        "metrics delta {}s: accepted={} accept_failures={} backpressure={} dispatched={} completed={} panics={} recv_failures={}",
                        INTERVAL_SECS,
                        snap.connections_accepted
                            .saturating_sub(last.connections_accepted),
                        snap.accept_failures.saturating_sub(last.accept_failures),
                        snap.backpressure_waits
                            .saturating_sub(last.backpressure_waits),
                        snap.jobs_dispatched.saturating_sub(last.jobs_dispatched),
                        snap.jobs_completed.saturating_sub(last.jobs_completed),
                        snap.job_panics.saturating_sub(last.job_panics),
                        snap.recv_failures.saturating_sub(last.recv_failures),
                    );
                    last = snap;
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("Metrics reporter not started: {e}");
        }
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Debug, Clone, Copy, Default)]
    pub struct MetricsSnapshot {
        pub connections_accepted: u64,
        pub accept_failures: u64,
        pub backpressure_waits: u64,
        pub jobs_dispatched: u64,
        pub jobs_completed: u64,
        pub job_panics: u64,
        pub recv_failures: u64,
    }

    pub fn inc_connections_accepted() {}
    pub fn inc_accept_failures() {}
    pub fn inc_backpressure_waits() {}
    pub fn inc_jobs_dispatched() {}
    pub fn inc_jobs_completed() {}
    pub fn inc_job_panics() {}
    pub fn inc_recv_failures() {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot::default()
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
