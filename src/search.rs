//! This module implements the two phase threshold search. For each searchable resource limit
//! the engine establishes a baseline fingerprint, bisects downward until the fingerprint first
//! diverges, then sweeps the remaining range in granularity sized steps, recording every
//! fingerprint that has not been observed before.
//!

use crate::filters::FilterSet;
use crate::fingerprint::{self, FingerprintSet, OutputKey};
use crate::process::Spawner;
use crate::rlimits::{LimitVector, ResourceKind};
use crate::script::ScriptEmitter;
use crate::Result;

/// Number of sweep steps without a new fingerprint after which the step size is grown by one
/// granularity unit. Chosen to match archived replay scripts; see [`sweep_step`].
///
/// [`sweep_step`]: fn.sweep_step.html
const COARSEN_INTERVAL: u64 = 32;

/// Set size at which the operator is warned that the target's output is probably too noisy to
/// search without filter patterns.
const NOISY_OUTPUT_THRESHOLD: usize = 128;

/// Transient per-limit search state.
struct ExplorationState {
    /// Fingerprint of the target under the parent's own (unmodified) limits.
    baseline_key: OutputKey,

    /// Sweep steps taken since the last new fingerprint.
    distance: u64,
}

/// Drives the bisection and sweep over every searchable resource limit.
pub struct SearchEngine<'a> {
    /// Spawns the target under each candidate limit vector.
    spawner: &'a Spawner,

    /// Canonicalizes child output before fingerprinting.
    filters: &'a FilterSet,

    /// Every distinct fingerprint observed so far, shared across all limits.
    seen: FingerprintSet,

    /// Replay script writer, if the operator asked for one.
    script: Option<ScriptEmitter>,

    /// Number of fingerprints recorded during sweeps, i.e. excluding baselines.
    new_keys: usize,
}

impl<'a> SearchEngine<'a> {
    /// Create a new engine over the given spawner and filter set.
    pub fn new(spawner: &'a Spawner, filters: &'a FilterSet, script: Option<ScriptEmitter>)
        -> SearchEngine<'a> {
        SearchEngine {
            spawner,
            filters,
            seen: FingerprintSet::new(),
            script,
            new_keys: 0,
        }
    }

    /// Get the number of anomalous fingerprints recorded so far.
    pub fn new_keys(&self) -> usize {
        self.new_keys
    }

    /// Search every limit with a nonzero granularity, in registry order.
    pub fn run(&mut self) -> Result<()> {
        for kind in ResourceKind::all_kinds() {
            if kind.granularity() == 0 {
                log::debug!("skipping {}: not searchable", kind.name());
                continue;
            }

            self.search_limit(kind, LimitVector::from_current())?;
        }

        Ok(())
    }

    /// Search one limit: baseline, bisection, then the granularity sweep.
    fn search_limit(&mut self, kind: ResourceKind, mut limits: LimitVector) -> Result<()> {
        log::info!("searching {}...", kind.name());

        let baseline_key = self.spawn_key(&limits)?;
        self.seen.insert(baseline_key.clone());

        let mut state = ExplorationState {
            baseline_key,
            distance: 0,
        };

        self.bisect(kind, &mut limits, &state)?;
        self.sweep(kind, &mut limits, &mut state)
    }

    /// Phase one: repeatedly halve the limit until the fingerprint diverges from baseline or
    /// the limit reaches zero. On divergence the last halving is undone, plus one, so the
    /// sweep starts just above the divergence point and re-captures it.
    fn bisect(&self, kind: ResourceKind, limits: &mut LimitVector, state: &ExplorationState)
        -> Result<()> {
        loop {
            let cur = limits.cur(kind) >> 1;
            if cur == 0 {
                limits.set_cur(kind, 0);
                return Ok(());
            }
            limits.set_cur(kind, cur);

            if self.spawn_key(limits)? != state.baseline_key {
                limits.set_cur(kind, (cur << 1) + 1);
                log::info!("{} diverges below {:#x}, starting sweep...",
                    kind.name(), limits.cur(kind));
                return Ok(());
            }
        }
    }

    /// Phase two: walk the limit down in granularity sized steps, recording every new
    /// fingerprint. The step grows while no new fingerprint shows up, and the walk ends when
    /// the limit falls below one granularity unit.
    fn sweep(&mut self, kind: ResourceKind, limits: &mut LimitVector,
        state: &mut ExplorationState) -> Result<()> {
        let granularity = kind.granularity();

        loop {
            let cur = limits.cur(kind);
            if cur < granularity {
                return Ok(());
            }
            limits.set_cur(kind, sweep_step(cur, granularity, state.distance));

            let (term, stdout, stderr) = self.spawner.spawn(limits)?;
            let key = fingerprint::fingerprint_streams(term, self.filters, &stdout, &stderr);
            if self.seen.insert(key) {
                state.distance = 0;
                self.new_keys += 1;
                self.record(kind, limits.cur(kind))?;
                // Show the canonicalized output, the form the key was computed from.
                log_sample(&self.filters.apply(&stdout), &self.filters.apply(&stderr));
            } else {
                state.distance += 1;
            }
        }
    }

    /// Spawn once under the given vector and fingerprint the result.
    fn spawn_key(&self, limits: &LimitVector) -> Result<OutputKey> {
        let (term, stdout, stderr) = self.spawner.spawn(limits)?;
        Ok(fingerprint::fingerprint_streams(term, self.filters, &stdout, &stderr))
    }

    /// Report a newly observed behavior to the operator and the replay script.
    fn record(&mut self, kind: ResourceKind, value: u64) -> Result<()> {
        log::info!("found new output @limit {}->{:#x}", kind.name(), value);

        if let Some(emitter) = self.script.as_mut() {
            emitter.emit(kind, value)?;
        }

        if self.seen.len() == NOISY_OUTPUT_THRESHOLD {
            log::warn!("{} distinct outputs so far; consider adding filter patterns",
                NOISY_OUTPUT_THRESHOLD);
        }

        Ok(())
    }
}

/// Show the operator a taste of a newly discovered output. Both streams must already be in
/// canonical (filtered) form. Stderr usually carries the interesting diagnostic, so it wins
/// over stdout.
fn log_sample(stdout: &[u8], stderr: &[u8]) {
    let sample = if stderr.is_empty() { stdout } else { stderr };
    let sample = &sample[..sample.len().min(160)];
    log::info!("\t{}", String::from_utf8_lossy(sample).trim_end());
}

/// Compute the next sweep value from the current one. The base decrement is one granularity
/// unit; every [`COARSEN_INTERVAL`] fruitless steps add another unit, and the total decrement
/// is clamped so the value never falls below zero.
///
/// [`COARSEN_INTERVAL`]: constant.COARSEN_INTERVAL.html
fn sweep_step(cur: u64, granularity: u64, distance: u64) -> u64 {
    debug_assert!(cur >= granularity);

    let coarsening = (granularity * (distance / COARSEN_INTERVAL)).min(cur - granularity);
    cur - granularity - coarsening
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::File;
    use std::time::Duration;

    #[test]
    fn test_sweep_step_base_decrement() {
        assert_eq!(99, sweep_step(100, 1, 0));
        assert_eq!(99, sweep_step(100, 1, 31));
    }

    #[test]
    fn test_sweep_step_adaptive_coarsening() {
        assert_eq!(98, sweep_step(100, 1, 32));
        assert_eq!(97, sweep_step(100, 1, 64));
        assert_eq!(4096 * 6, sweep_step(4096 * 9, 4096, 64));
    }

    #[test]
    fn test_sweep_step_never_underflows() {
        assert_eq!(0, sweep_step(1, 1, 0));
        assert_eq!(0, sweep_step(4096, 4096, 0));
        assert_eq!(0, sweep_step(5, 4, 320));
    }

    #[test]
    fn test_search_single_limit_records_divergence() {
        let command = vec!["echo".to_owned(), "hello".to_owned()];
        let envs = vec![format!("PATH={}", std::env::var("PATH").unwrap_or_default())];
        let stdin = File::open("/dev/null").unwrap();
        let spawner = Spawner::new(&command, envs, stdin, Duration::from_secs(5)).unwrap();
        let filters = FilterSet::empty();

        let mut engine = SearchEngine::new(&spawner, &filters, None);

        // Start the descent from a small ceiling to keep the test fast.
        let mut limits = LimitVector::from_current();
        limits.set_cur(ResourceKind::OpenFiles, 64);
        engine.search_limit(ResourceKind::OpenFiles, limits).unwrap();

        // Starving a dynamically linked binary of file descriptors must expose at least one
        // behavior beside the baseline.
        assert!(engine.seen.len() >= 2);
        assert!(engine.new_keys() >= 1);
    }

    #[test]
    fn test_unsearchable_limits_are_skipped() {
        assert_eq!(0, ResourceKind::CoreSize.granularity());
        assert_eq!(0, ResourceKind::ProcessCount.granularity());
    }
}
