use std::fmt;

use crate::backup::BackupScope;
use crate::error::UpdateError;

/// Where an update run currently is. `Finished` and `Failed` are terminal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    BackingUp,
    Downloading,
    Applying,
    Finished,
    Failed(UpdateError),
}

impl RunState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Finished | RunState::Failed(_))
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::BackingUp => "backing up",
            RunState::Downloading => "downloading",
            RunState::Applying => "applying",
            RunState::Finished => "finished",
            RunState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Failed(err) => write!(f, "failed ({})", err.kind()),
            other => f.write_str(other.label()),
        }
    }
}

/// Progress of a whole run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UpdateProgress {
    /// Overall completion in `[0.0, 1.0]`, never decreasing within a run.
    Fraction(f32),
    /// The current transfer has no declared size.
    Indeterminate,
}

/// Share of the overall bar given to each step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressWeights {
    pub backup: f32,
    pub download: f32,
    pub apply: f32,
}

impl ProgressWeights {
    pub fn for_scope(scope: BackupScope) -> Self {
        let backup = if scope == BackupScope::None { 0.0 } else { 0.1 };
        let download = 0.7;
        Self {
            backup,
            download,
            apply: 1.0 - backup - download,
        }
    }
}

/// Maps per-step fractions onto one monotonic overall fraction.
#[derive(Clone, Debug)]
pub struct ProgressTracker {
    weights: ProgressWeights,
    last: f32,
}

impl ProgressTracker {
    pub fn new(weights: ProgressWeights) -> Self {
        Self { weights, last: 0.0 }
    }

    #[must_use]
    pub fn current(&self) -> f32 {
        self.last
    }

    /// Record `step_fraction` of `step`. `None` means the step cannot measure itself.
    pub fn report(&mut self, step: &RunState, step_fraction: Option<f32>) -> UpdateProgress {
        let (offset, weight) = match step {
            RunState::Idle => (0.0, 0.0),
            RunState::BackingUp => (0.0, self.weights.backup),
            RunState::Downloading => (self.weights.backup, self.weights.download),
            RunState::Applying => (
                self.weights.backup + self.weights.download,
                self.weights.apply,
            ),
            RunState::Finished => (1.0, 0.0),
            RunState::Failed(_) => (self.last, 0.0),
        };
        let Some(fraction) = step_fraction else {
            return UpdateProgress::Indeterminate;
        };
        let overall = (offset + weight * fraction.clamp(0.0, 1.0)).clamp(0.0, 1.0);
        self.last = self.last.max(overall);
        UpdateProgress::Fraction(self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_sum_to_one() {
        for scope in [BackupScope::None, BackupScope::DatabaseOnly, BackupScope::Everything] {
            let w = ProgressWeights::for_scope(scope);
            assert!((w.backup + w.download + w.apply - 1.0).abs() < 1e-6);
        }
        assert_eq!(ProgressWeights::for_scope(BackupScope::None).backup, 0.0);
    }

    #[test]
    fn tracker_maps_steps_onto_overall_range() {
        let mut tracker = ProgressTracker::new(ProgressWeights::for_scope(BackupScope::Everything));
        assert_eq!(
            tracker.report(&RunState::BackingUp, Some(1.0)),
            UpdateProgress::Fraction(0.1)
        );
        let UpdateProgress::Fraction(mid) = tracker.report(&RunState::Downloading, Some(0.5)) else {
            panic!("expected a fraction");
        };
        assert!((mid - 0.45).abs() < 1e-6);
        assert_eq!(
            tracker.report(&RunState::Finished, Some(1.0)),
            UpdateProgress::Fraction(1.0)
        );
    }

    #[test]
    fn tracker_never_goes_backwards() {
        let mut tracker = ProgressTracker::new(ProgressWeights::for_scope(BackupScope::None));
        tracker.report(&RunState::Downloading, Some(0.8));
        let before = tracker.current();
        assert_eq!(
            tracker.report(&RunState::Downloading, Some(0.2)),
            UpdateProgress::Fraction(before)
        );
        assert_eq!(
            tracker.report(&RunState::Downloading, None),
            UpdateProgress::Indeterminate
        );
        assert_eq!(tracker.current(), before);
    }

    #[test]
    fn terminal_states() {
        assert!(RunState::Finished.is_terminal());
        assert!(RunState::Failed(UpdateError::Cancelled).is_terminal());
        assert!(!RunState::Downloading.is_terminal());
        assert_eq!(
            RunState::Failed(UpdateError::Cancelled).to_string(),
            "failed (cancelled)"
        );
    }
}
