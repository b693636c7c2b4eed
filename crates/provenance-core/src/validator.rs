use tracing::debug;

use crate::{Caller, Fruit, ProvenanceError, Stage, StageState, StageSubmission, TraceabilityCode};

/// Ordered-stage state machine and role rules.
///
/// The role check and the transition check are separate steps; neither reads
/// the user index.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageValidator;

impl StageValidator {
    /// The caller's declared role must be the one that owns `stage`.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::UnauthorizedRole`] on mismatch.
    pub fn check_role(self, caller: &Caller, stage: Stage) -> Result<(), ProvenanceError> {
        let required = stage.required_role();
        if caller.user_type != required {
            debug!(
                user_id = %caller.user_id,
                stage = %stage,
                role = %caller.user_type,
                "role rejected for stage"
            );
            return Err(ProvenanceError::UnauthorizedRole {
                stage,
                required,
                actual: caller.user_type,
            });
        }
        Ok(())
    }

    /// Check that `stage` may be written to the record as it currently stands.
    ///
    /// `current` is the live record, if any; `minted` says whether the code has
    /// ever been written, tombstoned records included.
    ///
    /// # Errors
    /// - [`ProvenanceError::DuplicateCode`] when the origin stage targets a code that
    ///   already exists or once existed.
    /// - [`ProvenanceError::NotFound`] when a later stage targets a missing code.
    /// - [`ProvenanceError::InvalidTransition`] when the record is not in the
    ///   stage's predecessor state or the stage is already populated.
    pub fn check_transition(
        self,
        code: &TraceabilityCode,
        stage: Stage,
        current: Option<&Fruit>,
        minted: bool,
    ) -> Result<(), ProvenanceError> {
        let Some(fruit) = current else {
            if stage == Stage::Farmer {
                if minted {
                    return Err(ProvenanceError::DuplicateCode { code: code.to_string() });
                }
                return Ok(());
            }
            return Err(ProvenanceError::NotFound { key: format!("fruit:{code}") });
        };

        if stage == Stage::Farmer {
            return Err(ProvenanceError::DuplicateCode { code: code.to_string() });
        }

        let expected = stage.predecessor_state();
        if fruit.state != expected || fruit.has_stage(stage) {
            debug!(
                code = %code,
                stage = %stage,
                expected = %expected,
                actual = %fruit.state,
                "stage transition rejected"
            );
            return Err(ProvenanceError::InvalidTransition {
                stage,
                expected,
                actual: fruit.state,
            });
        }
        Ok(())
    }

    /// Run every pre-write check for one submission in fail-fast order: role,
    /// then field validation, then the state machine.
    ///
    /// # Errors
    /// The first failing check's error.
    pub fn validate(
        self,
        caller: &Caller,
        code: &TraceabilityCode,
        submission: &StageSubmission,
        current: Option<&Fruit>,
        minted: bool,
    ) -> Result<(), ProvenanceError> {
        let stage = submission.stage();
        self.check_role(caller, stage)?;
        submission.validate()?;
        self.check_transition(code, stage, current, minted)
    }

    /// State a record ends up in after `stage` is accepted.
    #[must_use]
    pub fn advance(self, stage: Stage) -> StageState {
        stage.resulting_state()
    }
}
