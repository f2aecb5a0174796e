//! Contadores de despacho inyectados (no globales), de modo que varias
//! instancias del servicio no compartan un contador de proceso.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DispatchMetrics {
    dispatches: AtomicU64,
    dispatch_failures: AtomicU64,
    resubmissions: AtomicU64,
    alias_redirects: AtomicU64,
    stale_callbacks: AtomicU64,
    authorization_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub dispatches: u64,
    pub dispatch_failures: u64,
    pub resubmissions: u64,
    pub alias_redirects: u64,
    pub stale_callbacks: u64,
    pub authorization_failures: u64,
}

/// Contador que se incrementa. Devuelve el nuevo valor.
#[derive(Debug, Clone, Copy)]
pub enum Counter {
    Dispatch,
    DispatchFailure,
    Resubmission,
    AliasRedirect,
    StaleCallback,
    AuthorizationFailure,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, c: Counter) -> &AtomicU64 {
        match c {
            Counter::Dispatch => &self.dispatches,
            Counter::DispatchFailure => &self.dispatch_failures,
            Counter::Resubmission => &self.resubmissions,
            Counter::AliasRedirect => &self.alias_redirects,
            Counter::StaleCallback => &self.stale_callbacks,
            Counter::AuthorizationFailure => &self.authorization_failures,
        }
    }

    pub fn incr(&self, c: Counter) -> u64 {
        self.slot(c).fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Logging adaptativo: primera ocurrencia y potencias de diez.
    pub fn incr_and_should_log(&self, c: Counter) -> bool {
        let n = self.incr(c);
        n == 1 || is_power_of_ten(n)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot { dispatches: self.dispatches.load(Ordering::Relaxed),
                          dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
                          resubmissions: self.resubmissions.load(Ordering::Relaxed),
                          alias_redirects: self.alias_redirects.load(Ordering::Relaxed),
                          stale_callbacks: self.stale_callbacks.load(Ordering::Relaxed),
                          authorization_failures: self.authorization_failures.load(Ordering::Relaxed) }
    }
}

fn is_power_of_ten(mut n: u64) -> bool {
    while n >= 10 && n % 10 == 0 {
        n /= 10;
    }
    n == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_logging_thins_out() {
        let m = DispatchMetrics::new();
        let logged: Vec<u64> = (1..=120).filter(|_| m.incr_and_should_log(Counter::StaleCallback))
                                        .map(|_| m.snapshot().stale_callbacks)
                                        .collect();
        assert_eq!(logged, vec![1, 10, 100]);
    }

    #[test]
    fn instances_do_not_share_counters() {
        let a = DispatchMetrics::new();
        let b = DispatchMetrics::new();
        a.incr(Counter::Dispatch);
        assert_eq!(a.snapshot().dispatches, 1);
        assert_eq!(b.snapshot().dispatches, 0);
    }
}
