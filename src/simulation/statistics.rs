use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::floating_type_mod::FT;

#[derive(Clone)]
pub struct Counter<T> {
    values: Vec<T>,
    last_start: Option<Instant>,
}

impl<T> Counter<T> {
    fn new() -> Self {
        Counter::<T> {
            values: Vec::new(),
            last_start: None,
        }
    }

    fn add_value(&mut self, v: T) {
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Counter<FT> {
    pub fn avg(&self) -> FT {
        self.values.iter().cloned().sum::<FT>() / self.values.len() as FT
    }
    pub fn min(&self) -> FT {
        self.values.iter().cloned().fold(FT::MAX, FT::min)
    }
    pub fn max(&self) -> FT {
        self.values.iter().cloned().fold(FT::MIN, FT::max)
    }
    pub fn last(&self) -> Option<FT> {
        self.values.last().cloned()
    }
}

impl Counter<Duration> {
    fn begin(&mut self) {
        self.last_start = Some(Instant::now());
    }

    fn end(&mut self) {
        if let Some(start) = self.last_start.take() {
            self.values.push(start.elapsed());
        }
    }

    fn end_add_to_last(&mut self) {
        if let Some(start) = self.last_start.take() {
            match self.values.last_mut() {
                Some(last) => *last += start.elapsed(),
                None => self.values.push(start.elapsed()),
            }
        }
    }

    pub fn avg(&self) -> Duration {
        if self.values.is_empty() {
            return Duration::default();
        }
        self.sum() / self.values.len() as u32
    }

    pub fn sum(&self) -> Duration {
        self.values.iter().cloned().sum::<Duration>()
    }
}

/// Named scalar samples, e.g. the mean density error of every step.
pub struct ValueCounters {
    counters: HashMap<String, Counter<FT>>,
    enabled: bool,
}

impl ValueCounters {
    pub fn new(enabled: bool) -> ValueCounters {
        ValueCounters {
            counters: HashMap::default(),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn add_value(&mut self, id: &str, v: FT) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<FT>::new)
                .add_value(v);
        }
    }

    pub fn get(&self, id: &str) -> Option<&Counter<FT>> {
        self.counters.get(id)
    }

    fn sorted(&self) -> Vec<(&String, &Counter<FT>)> {
        let mut v = self.counters.iter().collect::<Vec<_>>();
        v.sort_by(|x, y| x.0.cmp(y.0));
        v
    }
}

/// Wall clock time per pipeline phase. A disabled instance never reads the clock.
pub struct PerformanceCounters {
    counters: HashMap<String, Counter<Duration>>,
    enabled: bool,
}

impl PerformanceCounters {
    pub fn new(enabled: bool) -> PerformanceCounters {
        PerformanceCounters {
            counters: HashMap::default(),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn begin(&mut self, id: &str) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<Duration>::new)
                .begin();
        }
    }

    pub fn end(&mut self, id: &str) {
        if self.enabled {
            if let Some(counter) = self.counters.get_mut(id) {
                counter.end();
            }
        }
    }

    /// Adds the elapsed time to the last sample instead of starting a new one.
    pub fn end_add_to_last(&mut self, id: &str) {
        if self.enabled {
            if let Some(counter) = self.counters.get_mut(id) {
                counter.end_add_to_last();
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Counter<Duration>> {
        self.counters.get(id)
    }

    fn sorted(&self) -> Vec<(&String, &Counter<Duration>)> {
        let mut v = self.counters.iter().collect::<Vec<_>>();
        v.sort_by(|x, y| x.0.cmp(y.0));
        v
    }
}

/// Plain text report of all counters, sorted by label.
pub fn write_counters(pcounters: &PerformanceCounters, vcounters: &ValueCounters) -> String {
    let mut s = String::new();
    // writing into a String does not fail
    let _ = write_counters_into(&mut s, pcounters, vcounters);
    s
}

fn write_counters_into(
    s: &mut String,
    pcounters: &PerformanceCounters,
    vcounters: &ValueCounters,
) -> std::fmt::Result {
    if let Some(step) = pcounters.get("simulation-step") {
        writeln!(s, "simulation-time: {}ms", step.sum().as_secs_f64() * 1000.)?;
        writeln!(s)?;
    }

    for (label, pcounter) in pcounters.sorted() {
        writeln!(s, "{}: avg:{}ms", label, pcounter.avg().as_secs_f64() * 1000.)?;
    }
    writeln!(s)?;

    for (label, vcounter) in vcounters.sorted() {
        if vcounter.is_empty() {
            continue;
        }
        writeln!(
            s,
            "{}: min:{} max:{} avg:{}",
            label,
            vcounter.min(),
            vcounter.max(),
            vcounter.avg()
        )?;
    }

    Ok(())
}

#[test]
fn disabled_counters_record_nothing() {
    let mut pcounters = PerformanceCounters::new(false);
    let mut vcounters = ValueCounters::new(false);
    pcounters.begin("a");
    pcounters.end("a");
    vcounters.add_value("b", 1.);
    assert!(pcounters.get("a").is_none());
    assert!(vcounters.get("b").is_none());
    assert_eq!(write_counters(&pcounters, &vcounters).trim(), "");
}

#[test]
fn value_counter_min_max_avg() {
    let mut vcounters = ValueCounters::new(true);
    for v in [1., 4., 2., 5.].iter() {
        vcounters.add_value("particle-count", *v);
    }
    let counter = vcounters.get("particle-count").unwrap();
    assert_eq!(counter.len(), 4);
    assert_eq!(counter.min(), 1.);
    assert_eq!(counter.max(), 5.);
    assert_eq!(counter.avg(), 3.);
    assert_eq!(counter.last(), Some(5.));
}

#[test]
fn report_is_sorted_by_label() {
    let mut pcounters = PerformanceCounters::new(true);
    for id in ["vorticity", "density", "simulation-step"].iter() {
        pcounters.begin(id);
        pcounters.end(id);
    }
    // a second timing of the same phase extends the last sample
    pcounters.begin("density");
    pcounters.end_add_to_last("density");
    assert_eq!(pcounters.get("density").unwrap().len(), 1);

    let mut vcounters = ValueCounters::new(true);
    vcounters.add_value("neighbor-count", 30.);
    vcounters.add_value("density-error", 0.01);

    let report = write_counters(&pcounters, &vcounters);
    let density = report.find("density: avg").unwrap();
    let vorticity = report.find("vorticity: avg").unwrap();
    assert!(density < vorticity);
    let density_error = report.find("density-error: min").unwrap();
    let neighbor_count = report.find("neighbor-count: min").unwrap();
    assert!(density_error < neighbor_count);
    assert!(report.starts_with("simulation-time:"));
}
