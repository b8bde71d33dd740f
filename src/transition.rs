use crate::executor::{ExecutionOutcome, OutcomeClass};
use crate::types::Stage;

/// Default next stage for `(stage, outcome class)`, if the table has one.
///
/// | stage     | success    | reject   | unverifiable |
/// |-----------|------------|----------|--------------|
/// | triage    | research   | rejected |              |
/// | research  | response   |          | rejected     |
/// | response  | editorial  |          |              |
/// | editorial | post_queue |          |              |
pub fn default_next_stage(stage: Stage, outcome: OutcomeClass) -> Option<Stage> {
    use OutcomeClass::*;

    match (stage, outcome) {
        (Stage::Triage, Success) => Some(Stage::Research),
        (Stage::Triage, Reject) => Some(Stage::Rejected),
        (Stage::Research, Success) => Some(Stage::Response),
        (Stage::Research, Unverifiable) => Some(Stage::Rejected),
        (Stage::Response, Success) => Some(Stage::Editorial),
        (Stage::Editorial, Success) => Some(Stage::PostQueue),
        _ => None,
    }
}

/// Resolve the stage a successful outcome moves the item to.
///
/// An explicitly declared stage wins. Otherwise the default table is
/// consulted, and anything it does not map ends the item as `Completed`.
/// Failed outcomes never reach this function; the retry policy owns them.
pub fn resolve(stage: Stage, outcome: &ExecutionOutcome) -> Stage {
    if let Some(declared) = outcome.next_stage {
        return declared;
    }
    default_next_stage(stage, outcome.outcome).unwrap_or(Stage::Completed)
}

/// Check that a declared next stage is one an executor may choose.
///
/// Executors may advance to a later processing stage, hand off to the post
/// queue, or end the item as completed or rejected. Sending an item back to
/// triage or straight to the dead-letter state is not allowed.
pub fn validate_declared_stage(stage: Stage) -> Result<(), String> {
    match stage {
        Stage::Research
        | Stage::Response
        | Stage::Editorial
        | Stage::PostQueue
        | Stage::Completed
        | Stage::Rejected => Ok(()),
        Stage::Triage | Stage::Failed => Err(format!(
            "Invalid next_stage '{}': expected research, response, editorial, post_queue, completed, or rejected",
            stage
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_stage_is_allowed_or_rejected() {
        assert!(validate_declared_stage(Stage::PostQueue).is_ok());
        assert!(validate_declared_stage(Stage::Rejected).is_ok());
        assert!(validate_declared_stage(Stage::Triage).is_err());
        assert!(validate_declared_stage(Stage::Failed).is_err());
    }

    #[test]
    fn unmapped_pairs_have_no_default() {
        assert_eq!(default_next_stage(Stage::Response, OutcomeClass::Reject), None);
        assert_eq!(default_next_stage(Stage::PostQueue, OutcomeClass::Success), None);
    }
}
