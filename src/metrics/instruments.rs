//! Atomic metric instruments and their text exposition.

use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Something that can be written in Prometheus text format.
pub trait Expose {
    /// `counter` or `gauge`.
    const KIND: &'static str;

    fn name(&self) -> &'static str;
    fn help(&self) -> &'static str;
    fn value(&self) -> String;

    /// Append the HELP, TYPE and sample lines to `out`.
    fn expose(&self, out: &mut String) {
        let name = self.name();
        let _ = writeln!(out, "# HELP {} {}", name, self.help());
        let _ = writeln!(out, "# TYPE {} {}", name, Self::KIND);
        let _ = writeln!(out, "{} {}", name, self.value());
    }
}

/// Monotonic count.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Expose for Counter {
    const KIND: &'static str = "counter";

    fn name(&self) -> &'static str {
        self.name
    }

    fn help(&self) -> &'static str {
        self.help
    }

    fn value(&self) -> String {
        self.get().to_string()
    }
}

/// Level that moves both ways, such as snapshots currently pinned.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicI64::new(0),
        }
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Expose for Gauge {
    const KIND: &'static str = "gauge";

    fn name(&self) -> &'static str {
        self.name
    }

    fn help(&self) -> &'static str {
        self.help
    }

    fn value(&self) -> String {
        self.get().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_exposition() {
        let counter = Counter::new("segrep_transfers_total", "Transfers started");
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);

        let mut out = String::new();
        counter.expose(&mut out);
        assert_eq!(
            out,
            "# HELP segrep_transfers_total Transfers started\n\
             # TYPE segrep_transfers_total counter\n\
             segrep_transfers_total 5\n"
        );
    }

    #[test]
    fn test_gauge_moves_both_ways() {
        let gauge = Gauge::new("segrep_active", "Active");
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
        gauge.set(-2);

        let mut out = String::new();
        gauge.expose(&mut out);
        assert!(out.contains("# TYPE segrep_active gauge"));
        assert!(out.ends_with("segrep_active -2\n"));
    }
}
