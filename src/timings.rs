/// Pass timing report
/// Wall-clock per pipeline pass, printed under --verbose
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct PassTimings {
    entries: Vec<(String, Duration)>,
}

impl PassTimings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn time<T>(&mut self, name: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        self.entries.push((name.to_string(), start.elapsed()));
        result
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn report(&self) {
        if self.entries.is_empty() {
            return;
        }
        println!("\n{:<28} {:<12}", "Pass", "Time (ms)");
        println!("{}", "-".repeat(40));
        for (name, elapsed) in &self.entries {
            println!("{:<28} {:<12.2}", name, elapsed.as_secs_f64() * 1000.0);
        }
        let total: Duration = self.entries.iter().map(|(_, d)| *d).sum();
        println!("{:<28} {:<12.2}", "total", total.as_secs_f64() * 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_passes_in_order() {
        let mut timings = PassTimings::new();
        let value = timings.time("first", || 41 + 1);
        assert_eq!(value, 42);
        timings.time("second", || ());
        assert!(!timings.is_empty());
        assert_eq!(timings.entries.len(), 2);
        assert_eq!(timings.entries[0].0, "first");
    }
}
