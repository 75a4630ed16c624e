//! JSONL sampling.
//!
//! Two strategies over a stream of lines:
//! - fixed size: single-pass reservoir sampling, output keeps input order
//! - fraction: each valid line is kept independently with probability `p`
//!
//! Both are deterministic for a given seed.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::config::{SampleConfig, SampleMode};
use crate::error::{Error, Result};

/// Counters reported by a sampling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleStats {
    /// Physical lines read.
    pub total: usize,
    /// Lines that passed validation (all lines when validation is off).
    pub valid: usize,
    /// Lines written to the output.
    pub written: usize,
}

/// Reservoir sampler that remembers where each kept item came from.
///
/// Algorithm R: the first `capacity` items fill the reservoir, the n-th item
/// after that replaces a random slot with probability `capacity / n`.
#[derive(Debug)]
pub struct Reservoir<T> {
    capacity: usize,
    seen: usize,
    items: Vec<(usize, T)>,
    rng: StdRng,
}

impl<T> Reservoir<T> {
    /// Creates an empty reservoir.
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            capacity,
            seen: 0,
            items: Vec::with_capacity(capacity.min(1 << 16)),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Offers one item at input position `position`.
    pub fn offer(&mut self, position: usize, item: T) {
        self.seen += 1;
        if self.items.len() < self.capacity {
            self.items.push((position, item));
            return;
        }
        let j = self.rng.gen_range(1..=self.seen);
        if j <= self.capacity {
            self.items[j - 1] = (position, item);
        }
    }

    /// Number of items offered so far.
    pub fn seen(&self) -> usize {
        self.seen
    }

    /// Kept items in input order.
    pub fn into_sorted(mut self) -> Vec<T> {
        self.items.sort_by_key(|(position, _)| *position);
        self.items.into_iter().map(|(_, item)| item).collect()
    }
}

/// Returns true when `line` parses as JSON.
pub fn is_valid_json(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line).is_ok()
}

fn open_output(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

/// Reads raw lines (newline included) with their 1-based line number.
fn for_each_line(path: &Path, mut f: impl FnMut(usize, String)) -> Result<usize> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut position = 0;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        position += 1;
        f(position, line);
    }
    Ok(position)
}

fn write_line(out: &mut impl Write, line: &str) -> Result<()> {
    out.write_all(line.as_bytes())?;
    if !line.ends_with('\n') {
        out.write_all(b"\n")?;
    }
    Ok(())
}

/// Samples up to `size` lines from `input` into `output`, preserving order.
pub fn sample_fixed_size(
    input: &Path,
    output: &Path,
    size: usize,
    seed: u64,
    validate: bool,
) -> Result<SampleStats> {
    let mut reservoir = Reservoir::new(size, seed);
    let total = for_each_line(input, |position, line| {
        if validate && !is_valid_json(&line) {
            return;
        }
        reservoir.offer(position, line);
    })?;
    let valid = reservoir.seen();

    let mut out = open_output(output)?;
    let kept = reservoir.into_sorted();
    for line in &kept {
        write_line(&mut out, line)?;
    }
    out.flush()?;

    let stats = SampleStats {
        total,
        valid,
        written: kept.len(),
    };
    info!(
        size,
        written = stats.written,
        valid = stats.valid,
        total = stats.total,
        output = %output.display(),
        "reservoir sample written"
    );
    Ok(stats)
}

/// Runs the sampling strategy selected by `config.mode`.
pub fn sample_jsonl(config: &SampleConfig) -> Result<SampleStats> {
    match config.mode {
        SampleMode::Size(size) => sample_fixed_size(
            &config.input,
            &config.output,
            size,
            config.seed,
            config.validate,
        ),
        SampleMode::Fraction(fraction) => sample_fraction(
            &config.input,
            &config.output,
            fraction,
            config.seed,
            config.validate,
        ),
    }
}

/// Keeps each valid line of `input` with probability `fraction`.
pub fn sample_fraction(
    input: &Path,
    output: &Path,
    fraction: f64,
    seed: u64,
    validate: bool,
) -> Result<SampleStats> {
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(Error::Config(format!(
            "fraction must be in (0, 1], got {fraction}"
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = open_output(output)?;
    let mut stats = SampleStats::default();
    let mut write_err = None;

    let total = for_each_line(input, |_, line| {
        if write_err.is_some() || (validate && !is_valid_json(&line)) {
            return;
        }
        stats.valid += 1;
        if rng.gen_bool(fraction) {
            match write_line(&mut out, &line) {
                Ok(()) => stats.written += 1,
                Err(e) => write_err = Some(e),
            }
        }
    })?;
    if let Some(e) = write_err {
        return Err(e);
    }
    out.flush()?;
    stats.total = total;

    info!(
        fraction,
        written = stats.written,
        valid = stats.valid,
        total = stats.total,
        output = %output.display(),
        "fraction sample written"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservoir_keeps_everything_under_capacity() {
        let mut r = Reservoir::new(10, 1);
        for i in 0..5 {
            r.offer(i, i * 10);
        }
        assert_eq!(r.seen(), 5);
        assert_eq!(r.into_sorted(), vec![0, 10, 20, 30, 40]);
    }

    #[test]
    fn test_reservoir_caps_and_sorts() {
        let mut r = Reservoir::new(3, 7);
        for i in 0..100 {
            r.offer(i, i);
        }
        let kept = r.into_sorted();
        assert_eq!(kept.len(), 3);
        assert!(kept.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_reservoir_zero_capacity() {
        let mut r = Reservoir::new(0, 7);
        for i in 0..10 {
            r.offer(i, i);
        }
        assert!(r.into_sorted().is_empty());
    }

    #[test]
    fn test_reservoir_is_deterministic() {
        let run = |seed| {
            let mut r = Reservoir::new(5, seed);
            for i in 0..1000 {
                r.offer(i, i);
            }
            r.into_sorted()
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn test_is_valid_json() {
        assert!(is_valid_json("{\"a\": 1}\n"));
        assert!(is_valid_json("[1, 2]"));
        assert!(!is_valid_json("{broken\n"));
        assert!(!is_valid_json(""));
    }
}
