use super::error::{PepError, PepResult};

const PERMIT: &str = "PERMIT";

/// Allows only a Permit decision. Deny, Indeterminate, NotApplicable and
/// anything unrecognized are all reported as `AccessDenied`.
pub fn evaluate(decision: &str) -> PepResult<()> {
    if decision.trim().eq_ignore_ascii_case(PERMIT) {
        Ok(())
    } else {
        Err(PepError::AccessDenied(decision.to_string()))
    }
}
