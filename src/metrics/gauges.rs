//! Gauges for values that go up and down.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};

/// A point-in-time value such as the number of routes or running migrations.
///
/// Values owned by another component (the route table, the quiesce gate) are
/// copied in with [`set`](Gauge::set) when metrics are read; values the
/// gateway changes itself use [`inc`](Gauge::inc) and [`dec`](Gauge::dec).
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

    pub fn name(&self) -> &'static str {
        self.name
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

    /// Append the `HELP`, `TYPE` and sample lines.
    pub fn render(&self, out: &mut String) {
        let _ = write!(
            out,
            "# HELP {0} {1}\n# TYPE {0} gauge\n{0} {2}\n",
            self.name,
            self.help,
            self.get()
        );
    }
}
