//! Dispensing-run ledger.
//!
//! Derives discrete cycle records and completion state from the raw weight
//! stream. The machine is deliberately synchronous: every transition is a
//! plain `&mut self` call, so the record index is computed in the same call
//! that appends the record and can never duplicate or skip.

use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    /// Terminal for the run; only a reset or a fresh start leaves it.
    Completed,
}

/// One weight-drop measurement interval. Immutable once appended.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleRecord {
    /// 1-based position in the run's log.
    pub cycle: u32,
    pub start_weight: f64,
    pub end_weight: f64,
    pub drop_amount: f64,
}

impl CycleRecord {
    /// Row shape the backend API expects: every field a string.
    pub fn backend_row(&self) -> BackendRow {
        BackendRow {
            cycle: self.cycle.to_string(),
            start: format_weight(self.start_weight),
            end: format_weight(self.end_weight),
            drop_rate: format_weight(self.drop_amount),
        }
    }
}

/// Whole grams print bare, fractional grams keep their digits.
fn format_weight(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct BackendRow {
    #[serde(rename = "Cycle")]
    pub cycle: String,
    #[serde(rename = "Start")]
    pub start: String,
    #[serde(rename = "End")]
    pub end: String,
    #[serde(rename = "Drop_Rate")]
    pub drop_rate: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    /// Operator tried to start without setting a positive initial weight.
    /// The one failure that blocks progress with an explicit prompt.
    #[error("set the initial weight first")]
    NoInitialWeight,
}

/// Effect of a successful start, for the driver to act on.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StartNotice {
    pub initial_weight: f64,
    /// True when this is the first start after a reset; surfaces an
    /// informational notice to the operator, nothing else.
    pub post_reset: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SampleOutcome {
    /// Machine not running, or nothing to do.
    Ignored,
    Recorded(CycleRecord),
    /// Remaining weight hit exactly zero with this record.
    RunCompleted(CycleRecord),
}

#[derive(Debug, Default)]
pub struct CycleStateMachine {
    phase: RunPhase,
    initial_weight: Option<f64>,
    remaining_weight: Option<f64>,
    records: Vec<CycleRecord>,
    was_reset: bool,
}

impl CycleStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn initial_weight(&self) -> Option<f64> {
        self.initial_weight
    }

    pub fn remaining_weight(&self) -> Option<f64> {
        self.remaining_weight
    }

    pub fn records(&self) -> &[CycleRecord] {
        &self.records
    }

    pub fn done(&self) -> bool {
        self.phase == RunPhase::Completed
    }

    /// Remaining weight as a percentage of the initial weight, for the
    /// operator's progress bar. `None` until a run has data.
    pub fn remaining_percent(&self) -> Option<f64> {
        let initial = self.initial_weight?;
        let remaining = self.remaining_weight?;
        Some(((remaining / initial) * 100.0).max(0.0))
    }

    pub fn set_initial_weight(&mut self, grams: f64) {
        self.initial_weight = Some(grams);
    }

    /// Begin a run. Requires a positive initial weight; clears the prior
    /// run's remaining weight and records.
    pub fn start(&mut self) -> Result<StartNotice, StartError> {
        let initial = match self.initial_weight {
            Some(w) if w > 0.0 => w,
            _ => return Err(StartError::NoInitialWeight),
        };
        self.remaining_weight = None;
        self.records.clear();
        self.phase = RunPhase::Running;
        let post_reset = std::mem::take(&mut self.was_reset);
        Ok(StartNotice {
            initial_weight: initial,
            post_reset,
        })
    }

    /// Feed one weight sample (grams dispensed this cycle). Samples outside
    /// a running phase are ignored; an overshoot past zero is clamped, not
    /// rejected, because the device reports cumulative dispensed amounts.
    pub fn on_sample(&mut self, dropped: f64) -> SampleOutcome {
        if self.phase != RunPhase::Running {
            return SampleOutcome::Ignored;
        }
        let Some(initial) = self.initial_weight else {
            return SampleOutcome::Ignored;
        };

        let start_weight = self.remaining_weight.unwrap_or(initial);
        let new_remaining = (start_weight - dropped).max(0.0);

        let record = CycleRecord {
            cycle: self.records.len() as u32 + 1,
            start_weight,
            end_weight: new_remaining,
            drop_amount: dropped,
        };
        self.records.push(record.clone());
        self.remaining_weight = Some(new_remaining);

        // Clamping guarantees exact zero, so no epsilon here.
        if new_remaining == 0.0 {
            self.phase = RunPhase::Completed;
            SampleOutcome::RunCompleted(record)
        } else {
            SampleOutcome::Recorded(record)
        }
    }

    /// Clear the run from any phase. Idempotent; the next start carries a
    /// post-reset notice.
    pub fn reset(&mut self) {
        self.initial_weight = None;
        self.remaining_weight = None;
        self.records.clear();
        self.phase = RunPhase::Idle;
        self.was_reset = true;
    }

    /// Backend-shaped rows for the whole run, for the completion handoff.
    pub fn backend_rows(&self) -> Vec<BackendRow> {
        self.records.iter().map(CycleRecord::backend_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(initial: f64) -> CycleStateMachine {
        let mut machine = CycleStateMachine::new();
        machine.set_initial_weight(initial);
        machine.start().expect("start");
        machine
    }

    #[test]
    fn three_cycle_run_completes_at_zero() {
        let mut machine = running(100.0);

        assert_eq!(
            machine.on_sample(40.0),
            SampleOutcome::Recorded(CycleRecord {
                cycle: 1,
                start_weight: 100.0,
                end_weight: 60.0,
                drop_amount: 40.0
            })
        );
        assert_eq!(
            machine.on_sample(35.0),
            SampleOutcome::Recorded(CycleRecord {
                cycle: 2,
                start_weight: 60.0,
                end_weight: 25.0,
                drop_amount: 35.0
            })
        );
        assert_eq!(
            machine.on_sample(25.0),
            SampleOutcome::RunCompleted(CycleRecord {
                cycle: 3,
                start_weight: 25.0,
                end_weight: 0.0,
                drop_amount: 25.0
            })
        );
        assert!(machine.done());
        assert_eq!(machine.remaining_weight(), Some(0.0));
    }

    #[test]
    fn overshoot_is_clamped_and_completes_immediately() {
        let mut machine = running(50.0);

        assert_eq!(
            machine.on_sample(60.0),
            SampleOutcome::RunCompleted(CycleRecord {
                cycle: 1,
                start_weight: 50.0,
                end_weight: 0.0,
                drop_amount: 60.0
            })
        );
        assert!(machine.done());
        assert_eq!(machine.records().len(), 1);
    }

    #[test]
    fn remaining_matches_clamped_running_sum() {
        let initial = 120.5;
        let samples = [10.0, 0.25, 55.75, 3.0, 80.0, 9.0];
        let mut machine = running(initial);

        let mut sum = 0.0;
        for w in samples {
            machine.on_sample(w);
            sum += w;
            let expected = (initial - sum).max(0.0);
            if let Some(remaining) = machine.remaining_weight() {
                assert!(
                    (remaining - expected).abs() < 1e-9,
                    "remaining {remaining} vs expected {expected}"
                );
                assert!(remaining >= 0.0);
            }
        }
    }

    #[test]
    fn samples_after_completion_are_ignored_until_restart() {
        let mut machine = running(50.0);
        machine.on_sample(60.0);
        assert!(machine.done());

        assert_eq!(machine.on_sample(5.0), SampleOutcome::Ignored);
        assert_eq!(machine.records().len(), 1);

        // a fresh start from Completed is allowed and clears the log
        machine.start().expect("restart");
        assert_eq!(machine.records().len(), 0);
        assert_eq!(machine.phase(), RunPhase::Running);
        assert!(matches!(machine.on_sample(5.0), SampleOutcome::Recorded(_)));
    }

    #[test]
    fn samples_while_idle_are_ignored() {
        let mut machine = CycleStateMachine::new();
        assert_eq!(machine.on_sample(12.0), SampleOutcome::Ignored);
        assert!(machine.records().is_empty());
    }

    #[test]
    fn start_without_initial_weight_is_an_error() {
        let mut machine = CycleStateMachine::new();
        assert_eq!(machine.start(), Err(StartError::NoInitialWeight));

        machine.set_initial_weight(0.0);
        assert_eq!(machine.start(), Err(StartError::NoInitialWeight));

        machine.set_initial_weight(-3.0);
        assert_eq!(machine.start(), Err(StartError::NoInitialWeight));

        assert_eq!(machine.phase(), RunPhase::Idle);
    }

    #[test]
    fn reset_clears_everything_and_flags_the_next_start() {
        let mut machine = running(100.0);
        machine.on_sample(40.0);

        machine.reset();
        assert_eq!(machine.initial_weight(), None);
        assert_eq!(machine.remaining_weight(), None);
        assert!(machine.records().is_empty());
        assert_eq!(machine.phase(), RunPhase::Idle);

        // idempotent
        machine.reset();
        assert_eq!(machine.phase(), RunPhase::Idle);

        machine.set_initial_weight(80.0);
        let notice = machine.start().expect("start after reset");
        assert!(notice.post_reset);

        // the flag is informational and one-shot
        machine.set_initial_weight(80.0);
        let notice = machine.start().expect("second start");
        assert!(!notice.post_reset);
    }

    #[test]
    fn start_notice_compares_by_value() {
        let mut machine = CycleStateMachine::new();
        machine.set_initial_weight(42.5);
        let notice = machine.start().expect("start");
        assert_eq!(
            notice,
            StartNotice {
                initial_weight: 42.5,
                post_reset: false
            }
        );
    }

    #[test]
    fn remaining_percent_tracks_the_run() {
        let mut machine = running(100.0);
        assert_eq!(machine.remaining_percent(), None);
        machine.on_sample(40.0);
        assert_eq!(machine.remaining_percent(), Some(60.0));
        machine.on_sample(60.0);
        assert_eq!(machine.remaining_percent(), Some(0.0));
    }

    #[test]
    fn backend_rows_serialize_as_strings() {
        let mut machine = running(100.0);
        machine.on_sample(40.0);
        machine.on_sample(35.0);
        machine.on_sample(25.0);

        let rows = machine.backend_rows();
        let json = serde_json::to_string(&rows[2]).expect("serialize");
        assert_eq!(
            json,
            r#"{"Cycle":"3","Start":"25","End":"0","Drop_Rate":"25"}"#
        );

        let fractional = CycleRecord {
            cycle: 1,
            start_weight: 10.5,
            end_weight: 0.25,
            drop_amount: 10.25,
        }
        .backend_row();
        assert_eq!(fractional.start, "10.5");
        assert_eq!(fractional.end, "0.25");
    }
}
