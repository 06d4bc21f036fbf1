//! Pseudo-randomised trial schedule generation.
//!
//! A schedule is built once per run, before the run starts, and never changes
//! afterwards. Generation has three steps:
//!
//! 1. keep only the stimulus slots the operator actually customised,
//! 2. pair the configured labels deterministically so each label sits on port A once
//!    and on port B once across the full pairing set,
//! 3. for every block, shuffle that block's pairs independently and draw jittered
//!    interval durations per trial.
//!
//! The random source is injected, so a seeded `StdRng` reproduces a schedule exactly.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigurationError;

/// A base duration with symmetric uniform jitter, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSpec {
    /// Centre of the distribution
    pub base_ms: u64,
    /// Half-width of the uniform jitter
    pub jitter_ms: u64,
}

impl IntervalSpec {
    /// Create an interval spec.
    pub const fn new(base_ms: u64, jitter_ms: u64) -> Self {
        Self { base_ms, jitter_ms }
    }

    /// Fixed duration without jitter.
    pub const fn fixed(base_ms: u64) -> Self {
        Self::new(base_ms, 0)
    }

    /// Draw `base + U(-jitter, +jitter)`, clamped at zero.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        if self.jitter_ms == 0 {
            return self.base_ms;
        }
        let jitter = i64::try_from(self.jitter_ms).unwrap_or(i64::MAX);
        let offset = rng.gen_range(-jitter..=jitter);
        let base = i64::try_from(self.base_ms).unwrap_or(i64::MAX);
        u64::try_from(base.saturating_add(offset)).unwrap_or(0)
    }
}

/// Everything the operator supplies with `GENERATE_SCHEDULE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    /// Label per stimulus slot as entered by the operator
    pub labels: Vec<String>,
    /// Label per slot when left untouched; matching slots are "not configured"
    pub default_labels: Vec<String>,
    /// Number of blocks
    pub block_count: u32,
    /// Inter-trial interval
    pub iti: IntervalSpec,
    /// Time-to-contact window
    pub ttc: IntervalSpec,
    /// Sample phase
    pub sample: IntervalSpec,
}

/// A customised stimulus and the valve slot it lives on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stimulus {
    /// 0-based valve slot on the rig
    pub slot: u8,
    /// Operator label
    pub label: String,
}

/// One trial of the schedule. Immutable once generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialDefinition {
    /// 1-based block id
    pub trial_block: u32,
    /// 1-based position in the schedule
    pub trial_number: u32,
    /// Stimulus label on port A
    pub port_a_stimulus: String,
    /// Stimulus label on port B
    pub port_b_stimulus: String,
    /// Valve slot serving port A
    #[serde(skip)]
    pub port_a_valve: u8,
    /// Valve slot serving port B
    #[serde(skip)]
    pub port_b_valve: u8,
    /// Inter-trial interval
    pub iti_ms: u64,
    /// Time-to-contact window
    pub ttc_ms: u64,
    /// Sample phase length
    pub sample_ms: u64,
}

impl TrialDefinition {
    /// ITI as a `Duration`.
    pub fn iti(&self) -> Duration {
        Duration::from_millis(self.iti_ms)
    }

    /// TTC window as a `Duration`.
    pub fn ttc(&self) -> Duration {
        Duration::from_millis(self.ttc_ms)
    }

    /// Sample phase as a `Duration`.
    pub fn sample(&self) -> Duration {
        Duration::from_millis(self.sample_ms)
    }
}

/// Ordered, shared, immutable list of trial definitions.
pub type Schedule = Arc<[TrialDefinition]>;

/// Slots whose label differs from the slot default, in slot order.
///
/// Blank labels count as unconfigured.
pub fn configured_stimuli(
    labels: &[String],
    default_labels: &[String],
) -> Result<Vec<Stimulus>, ConfigurationError> {
    let mut seen = HashSet::new();
    let mut stimuli = Vec::new();
    for (slot, label) in labels.iter().enumerate() {
        let label = label.trim();
        let is_default = default_labels
            .get(slot)
            .is_some_and(|default| default.trim() == label);
        if label.is_empty() || is_default {
            continue;
        }
        if !seen.insert(label.to_string()) {
            return Err(ConfigurationError::DuplicateStimulus(label.to_string()));
        }
        let slot = u8::try_from(slot)
            .map_err(|_| ConfigurationError::InvalidSetting(format!("slot {slot} out of range")))?;
        stimuli.push(Stimulus {
            slot,
            label: label.to_string(),
        });
    }
    if stimuli.is_empty() {
        return Err(ConfigurationError::NoStimuliConfigured);
    }
    Ok(stimuli)
}

/// Partner index of `i` among `count` configured stimuli.
fn partner(i: usize, count: usize) -> Option<usize> {
    match count {
        2 => Some(1 - i),
        4 => Some(3 - i),
        8 if i % 2 == 0 => Some((i + 5) % 8),
        8 => Some((i + 3) % 8),
        _ => None,
    }
}

/// The full ordered pairing set `(port A index, port B index)` for `count` stimuli.
///
/// Every index appears exactly once on each side.
pub fn pair_stimuli(count: usize) -> Result<Vec<(usize, usize)>, ConfigurationError> {
    if !matches!(count, 2 | 4 | 8) {
        return Err(ConfigurationError::UnsupportedStimulusCount(count));
    }
    (0..count)
        .map(|i| {
            partner(i, count)
                .map(|p| (i, p))
                .ok_or(ConfigurationError::UnsupportedStimulusCount(count))
        })
        .collect()
}

/// Generate a schedule for `request`.
///
/// Even-indexed blocks use the pairs whose port A index is the lower one, odd-indexed
/// blocks the mirrored pairs, so a block holds `count / 2` trials and two consecutive
/// blocks put every label on both sides.
pub fn generate<R: Rng + ?Sized>(
    request: &ScheduleRequest,
    rng: &mut R,
) -> Result<Vec<TrialDefinition>, ConfigurationError> {
    if request.block_count == 0 {
        return Err(ConfigurationError::ZeroBlocks);
    }
    let stimuli = configured_stimuli(&request.labels, &request.default_labels)?;
    let pairs = pair_stimuli(stimuli.len())?;
    let (forward, reverse): (Vec<_>, Vec<_>) = pairs.into_iter().partition(|(a, b)| a < b);

    let mut trials = Vec::with_capacity(forward.len() * request.block_count as usize);
    let mut trial_number = 0u32;
    for block in 0..request.block_count {
        let mut block_pairs = if block % 2 == 0 {
            forward.clone()
        } else {
            reverse.clone()
        };
        block_pairs.shuffle(rng);

        for (a, b) in block_pairs {
            trial_number += 1;
            let (port_a, port_b) = (&stimuli[a], &stimuli[b]);
            trials.push(TrialDefinition {
                trial_block: block + 1,
                trial_number,
                port_a_stimulus: port_a.label.clone(),
                port_b_stimulus: port_b.label.clone(),
                port_a_valve: port_a.slot,
                port_b_valve: port_b.slot,
                iti_ms: request.iti.draw(rng),
                ttc_ms: request.ttc.draw(rng),
                sample_ms: request.sample.draw(rng),
            });
        }
    }

    tracing::info!(
        trials = trials.len(),
        blocks = request.block_count,
        stimuli = stimuli.len(),
        "Generated trial schedule"
    );
    Ok(trials)
}
