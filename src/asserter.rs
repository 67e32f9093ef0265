//! Pluggable sink for fatal configuration errors

use crate::error::InjectionError;

/// Receives every fatal error raised by an [`InjectionContext`](crate::InjectionContext).
///
/// The error is still returned to the caller (or reported through the
/// instance milestones for background failures); the asserter lets a host
/// abort, collect or forward it.
pub trait Asserter: Send + Sync {
    fn fail(&self, error: &InjectionError);
}

/// Asserter that panics on the first fatal error
#[derive(Debug, Default, Clone, Copy)]
pub struct PanicAsserter;

impl Asserter for PanicAsserter {
    fn fail(&self, error: &InjectionError) {
        panic!("{error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "No implementation registered for type Game.IAudio")]
    fn test_panic_asserter() {
        PanicAsserter.fail(&InjectionError::no_implementation("Game.IAudio"));
    }
}
