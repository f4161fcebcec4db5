//! Outcome of a devirtualization run.

use std::fmt::{self, Write as _};

use strum::EnumIter;

use crate::{
    devirt::{events::EventLog, method::VirtualizedMethod},
    metadata::{module::Module, token::Token},
    vm::BuildFingerprint,
    Error,
};

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter)]
pub enum Stage {
    /// Dispatch initializer, layout selection and opcode table
    OpcodeTable,
    /// Recovery of scrambled byte orders
    Endianness,
    /// Call stubs, method keys and the resolution stream
    Discovery,
    /// Per-method translation
    Translation,
    /// Replacement bodies written back to the module
    Output,
}

impl Stage {
    /// Stage name used in logs and events.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Stage::OpcodeTable => "opcodes",
            Stage::Endianness => "endianness",
            Stage::Discovery => "discovery",
            Stage::Translation => "translation",
            Stage::Output => "output",
        }
    }
}

/// Completion status of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    /// The stage ran to completion
    Completed,
    /// The stage failed with the given reason
    Failed(String),
    /// The stage did not run
    Skipped,
}

/// Result of one discovered method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodOutcome {
    /// The call stub
    pub stub: Token,
    /// Name of the virtualized method, once decoded
    pub name: Option<String>,
    /// Decoded method key
    pub key: u32,
    /// Translation succeeded
    pub translated: bool,
    /// Failure reason
    pub failure: Option<String>,
    /// The body contained homomorphic regions
    pub homomorphic: bool,
    /// Number of native instructions produced
    pub instruction_count: usize,
}

impl From<&VirtualizedMethod> for MethodOutcome {
    fn from(method: &VirtualizedMethod) -> Self {
        MethodOutcome {
            stub: method.stub,
            name: method.name().map(str::to_string),
            key: method.key,
            translated: method.successfully_translated,
            failure: method.failure().map(str::to_string),
            homomorphic: method.has_homomorphic_encryption,
            instruction_count: method.instructions.len(),
        }
    }
}

/// Statistics and diagnostics of a run.
#[derive(Debug, Default)]
pub struct DevirtResult {
    /// Stage statuses in execution order
    pub stages: Vec<(Stage, StageStatus)>,
    /// One outcome per discovered method
    pub methods: Vec<MethodOutcome>,
    /// Fingerprint of the dispatch initializer, when found
    pub fingerprint: Option<BuildFingerprint>,
    /// The error that aborted the run
    pub fatal: Option<Error>,
    /// Structured record of the run
    pub events: EventLog,
}

impl DevirtResult {
    /// Status of `stage`; stages that never reported are [`StageStatus::Skipped`].
    #[must_use]
    pub fn stage(&self, stage: Stage) -> &StageStatus {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map_or(&StageStatus::Skipped, |(_, status)| status)
    }

    /// Number of translated methods.
    #[must_use]
    pub fn translated_count(&self) -> usize {
        self.methods.iter().filter(|m| m.translated).count()
    }

    /// Number of failed methods.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.methods.iter().filter(|m| !m.translated).count()
    }

    /// Returns `true` if no stage aborted the run and every method translated.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.fatal.is_none() && self.failed_count() == 0
    }

    /// Human readable report.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(
            output,
            "Devirtualized {}/{} methods",
            self.translated_count(),
            self.methods.len()
        );
        if let Some(fatal) = &self.fatal {
            let _ = writeln!(output, "Aborted: {fatal}");
        }
        for (stage, status) in &self.stages {
            match status {
                StageStatus::Completed => {
                    let _ = writeln!(output, "  {:<12} ok", stage.name());
                }
                StageStatus::Failed(reason) => {
                    let _ = writeln!(output, "  {:<12} failed: {reason}", stage.name());
                }
                StageStatus::Skipped => {
                    let _ = writeln!(output, "  {:<12} skipped", stage.name());
                }
            }
        }
        let failed: Vec<&MethodOutcome> = self.methods.iter().filter(|m| !m.translated).collect();
        if !failed.is_empty() {
            output.push_str("\nFailed methods:\n");
            for method in failed {
                let _ = writeln!(
                    output,
                    "  {} {}: {}",
                    method.stub,
                    method.name.as_deref().unwrap_or("?"),
                    method.failure.as_deref().unwrap_or("unknown")
                );
            }
        }
        output
    }

    pub(crate) fn set_stage(&mut self, stage: Stage, status: StageStatus) {
        match self.stages.iter_mut().find(|(s, _)| *s == stage) {
            Some((_, existing)) => *existing = status,
            None => self.stages.push((stage, status)),
        }
    }
}

impl fmt::Display for DevirtResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Output of a run: the rewritten module, when the save policy allows one, and the result.
#[derive(Debug)]
pub struct DevirtOutput {
    /// The module with replacement bodies, `None` if nothing should be saved
    pub module: Option<Module>,
    /// Statistics and diagnostics
    pub result: DevirtResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(stub: u32, translated: bool) -> MethodOutcome {
        MethodOutcome {
            stub: Token::new(0x0600_0000 | stub),
            name: Some(format!("M{stub}")),
            key: stub * 16,
            translated,
            failure: (!translated).then(|| "Unknown private opcode - 0x0777".to_string()),
            homomorphic: false,
            instruction_count: 3,
        }
    }

    #[test]
    fn counts_and_summary() {
        let mut result = DevirtResult::default();
        result.set_stage(Stage::OpcodeTable, StageStatus::Completed);
        result.set_stage(Stage::Discovery, StageStatus::Failed("no stubs".into()));
        result.set_stage(Stage::Discovery, StageStatus::Completed);
        result.methods = vec![outcome(1, true), outcome(2, false), outcome(3, true)];

        assert_eq!(result.translated_count(), 2);
        assert_eq!(result.failed_count(), 1);
        assert!(!result.is_success());
        assert_eq!(result.stage(Stage::Discovery), &StageStatus::Completed);
        assert_eq!(result.stage(Stage::Output), &StageStatus::Skipped);
        assert_eq!(result.stages.len(), 2);

        let summary = result.summary();
        assert!(summary.starts_with("Devirtualized 2/3 methods"));
        assert!(summary.contains("M2: Unknown private opcode - 0x0777"));
    }
}
