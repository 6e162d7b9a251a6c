//! Per-stage fault containment.
//!
//! A stage that fails has usually already changed the device. Its failure is
//! handed to a [`RecoveryHandler`] together with what the stage managed to do,
//! and only the handler decides whether the run goes on.

use crate::Stage;
use std::fmt::Write as _;
use tracing::{error, info};

pub struct StageContext {
    stage: Stage,
    notes: Vec<String>,
}

impl StageContext {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            notes: Vec::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Records a completed step. Notes end up in the failure report and the run report.
    pub fn note(&mut self, note: impl Into<String>) {
        let note = note.into();
        info!(stage = %self.stage, "{}", note);
        self.notes.push(note);
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub(crate) fn into_notes(self) -> Vec<String> {
        self.notes
    }
}

#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub cause: anyhow::Error,
    pub notes: Vec<String>,
    /// Fresh block-tree listing taken right after the failure, if the lister still ran.
    pub snapshot: Option<String>,
}

impl StageFailure {
    pub fn diagnostic(&self) -> String {
        let mut out = format!("stage {} failed: {}\n", self.stage, self.cause);
        for cause in self.cause.chain().skip(1) {
            let _ = writeln!(out, "  caused by: {}", cause);
        }
        if !self.notes.is_empty() {
            out.push_str("completed steps:\n");
            for note in &self.notes {
                let _ = writeln!(out, "  - {}", note);
            }
        }
        if let Some(snapshot) = &self.snapshot {
            out.push_str("device state:\n");
            out.push_str(snapshot);
            if !snapshot.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// The operator repaired the device; treat the stage as done.
    Continue,
    Abort,
}

pub trait RecoveryHandler {
    fn recover(&mut self, failure: &StageFailure) -> RecoveryDecision;
}

/// Aborts on the first failure. For unattended runs and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailFast;

impl RecoveryHandler for FailFast {
    fn recover(&mut self, failure: &StageFailure) -> RecoveryDecision {
        error!(stage = %failure.stage, "{:#}", failure.cause);
        RecoveryDecision::Abort
    }
}
