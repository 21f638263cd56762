//! Purely observational profiling of compiler passes.
//!
//! Process-wide tables of timers and counters keyed by call-site; mutexes
//! guard them so concurrently compiled methods can report safely. Dumping
//! the tables logs a report and clears them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Call-site key of a profiling entry.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct SiteKey {
    pub file: &'static str,
    pub line: u32,
    pub name: &'static str,
}

#[derive(Default)]
struct TimerEntry {
    duration: Duration,
    invocations: u64,
}

struct CounterEntry {
    site: SiteKey,
    count: i64,
    invocations: u64,
    /// Index of the counter to report the difference against.
    previous: Option<usize>,
}

fn timers() -> &'static Mutex<HashMap<SiteKey, TimerEntry>> {
    static TIMERS: OnceLock<Mutex<HashMap<SiteKey, TimerEntry>>> = OnceLock::new();
    TIMERS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn counters() -> &'static Mutex<BTreeMap<usize, CounterEntry>> {
    static COUNTERS: OnceLock<Mutex<BTreeMap<usize, CounterEntry>>> = OnceLock::new();
    COUNTERS.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Guard measuring from construction to drop.
pub struct ScopeTimer {
    site: SiteKey,
    start: Instant,
}

impl ScopeTimer {
    pub fn new(site: SiteKey) -> Self {
        ScopeTimer {
            site,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopeTimer {
    fn drop(&mut self) {
        let mut table = timers().lock().unwrap();
        let entry = table.entry(self.site.clone()).or_default();
        entry.duration += self.start.elapsed();
        entry.invocations += 1;
    }
}

/// Add `value` to the counter at `index`.
pub fn increase_counter(index: usize, site: SiteKey, value: i64, previous: Option<usize>) {
    let mut table = counters().lock().unwrap();
    let entry = table.entry(index).or_insert_with(|| CounterEntry {
        site: site.clone(),
        count: 0,
        invocations: 0,
        previous,
    });
    entry.site = site;
    entry.count += value;
    entry.invocations += 1;
    entry.previous = previous.or(entry.previous);
}

/// Log all profiling results and clear the tables.
pub fn dump_results(as_warning: bool) {
    let mut timer_table = timers().lock().unwrap();
    let mut counter_table = counters().lock().unwrap();

    let mut entries: Vec<(SiteKey, Duration, u64)> = timer_table
        .iter()
        .map(|(site, entry)| (site.clone(), entry.duration, entry.invocations))
        .collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.name.cmp(b.0.name)));

    macro_rules! report {
        ($($arg:tt)*) => {
            if as_warning {
                log::warn!($($arg)*);
            } else {
                log::debug!($($arg)*);
            }
        };
    }

    report!("Profiling results for {} functions:", entries.len());
    for (site, duration, invocations) in &entries {
        report!(
            "{:>40} {:>9} us {:>8} calls {:>9} us/call {:>48}#{}",
            site.name,
            duration.as_micros(),
            invocations,
            duration.as_micros() / (*invocations as u128).max(1),
            site.file,
            site.line
        );
    }

    report!("Profiling results for {} counters:", counter_table.len());
    for (index, counter) in counter_table.iter() {
        let diff = counter
            .previous
            .and_then(|prev| counter_table.get(&prev))
            .map(|prev| {
                let delta = counter.count - prev.count;
                let percent = if prev.count != 0 {
                    100.0 * (counter.count as f64 / prev.count as f64 - 1.0)
                } else {
                    0.0
                };
                format!(" diff {delta:+} ({percent:+.0}%)")
            })
            .unwrap_or_default();
        report!(
            "[{:>4}] {:>36} {:>9} counts {:>6} calls {:>6} avg/call{} {:>40}#{}",
            index,
            counter.site.name,
            counter.count,
            counter.invocations,
            counter.count / (counter.invocations as i64).max(1),
            diff,
            counter.site.file,
            counter.site.line
        );
    }

    timer_table.clear();
    counter_table.clear();
}

/// Current value of a counter (for tests and reports).
pub fn counter_value(index: usize) -> Option<i64> {
    counters().lock().unwrap().get(&index).map(|c| c.count)
}

/// Base index for counters of the normalization steps.
pub const COUNTER_NORMALIZATION: usize = 1000;
/// Base index for counters of the optimization steps.
pub const COUNTER_OPTIMIZATION: usize = 2000;

/// Time the enclosing scope under the given name.
#[macro_export]
macro_rules! profile_scope {
    ($name:expr) => {
        let _profile_guard = $crate::profiler::ScopeTimer::new($crate::profiler::SiteKey {
            file: file!(),
            line: line!(),
            name: $name,
        });
    };
}

/// Add to a process-wide counter.
#[macro_export]
macro_rules! profile_counter {
    ($index:expr, $name:expr, $value:expr) => {
        $crate::profiler::increase_counter(
            $index,
            $crate::profiler::SiteKey {
                file: file!(),
                line: line!(),
                name: $name,
            },
            $value as i64,
            None,
        );
    };
    ($index:expr, $name:expr, $value:expr, $previous:expr) => {
        $crate::profiler::increase_counter(
            $index,
            $crate::profiler::SiteKey {
                file: file!(),
                line: line!(),
                name: $name,
            },
            $value as i64,
            Some($previous),
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let index = COUNTER_OPTIMIZATION + 900;
        profile_counter!(index, "test counter", 3);
        profile_counter!(index, "test counter", 4);
        assert_eq!(counter_value(index), Some(7));
    }

    #[test]
    fn scope_timer_records() {
        {
            profile_scope!("test scope");
            std::hint::black_box(0);
        }
        let table = timers().lock().unwrap();
        assert!(table.keys().any(|site| site.name == "test scope"));
    }
}
