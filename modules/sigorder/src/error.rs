use thiserror::Error;

use crate::id::SlotId;

/// Returned by `sort()` (directly or through an auto-sorting mutation) when
/// the declared dependencies contain a cycle.
///
/// `chain` starts with the key that was found twice on the traversal stack,
/// followed by every enclosing key out to the root of that traversal. For a
/// self-edge on `a` the chain is `[a, a]`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circular dependency between signal groups: {chain:?}")]
pub struct CircularDependencyError<K> {
    chain: Vec<K>,
}

impl<K> CircularDependencyError<K> {
    pub(crate) fn new(chain: Vec<K>) -> Self {
        Self { chain }
    }

    /// The keys forming the cycle, innermost first.
    pub fn chain(&self) -> &[K] {
        &self.chain
    }

    pub fn into_chain(self) -> Vec<K> {
        self.chain
    }
}

/// One callback that returned an error during `emit`.
#[derive(Debug)]
pub struct SlotFailure<K = ()> {
    pub key: K,
    pub slot: SlotId,
    pub error: anyhow::Error,
}

#[derive(Error, Debug)]
pub enum EmitError<K = ()> {
    #[error(transparent)]
    CircularDependency(#[from] CircularDependencyError<K>),

    #[error("emit re-entered while the same dispatcher was already emitting")]
    Reentrant,

    #[error("{} slot(s) failed during emit", .0.len())]
    SlotsFailed(Vec<SlotFailure<K>>),
}

impl<K> EmitError<K> {
    /// Failures collected during the pass. Empty for the other variants.
    pub fn failures(&self) -> &[SlotFailure<K>] {
        match self {
            EmitError::SlotsFailed(failures) => failures,
            _ => &[],
        }
    }

    pub(crate) fn from_failures(failures: Vec<SlotFailure<K>>) -> Result<(), Self> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(EmitError::SlotsFailed(failures))
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_lists_chain_in_message() {
        let err = CircularDependencyError::new(vec!["c", "b", "a", "c"]);
        assert_eq!(err.chain(), &["c", "b", "a", "c"]);
        assert!(err.to_string().contains(r#"["c", "b", "a", "c"]"#));
    }

    #[test]
    fn empty_failures_are_ok() {
        assert!(EmitError::<()>::from_failures(Vec::new()).is_ok());
    }

    #[test]
    fn slots_failed_counts_failures() {
        let failures = vec![
            SlotFailure {
                key: (),
                slot: SlotId::new(0, 0),
                error: anyhow::anyhow!("first"),
            },
            SlotFailure {
                key: (),
                slot: SlotId::new(1, 0),
                error: anyhow::anyhow!("second"),
            },
        ];
        let err = EmitError::from_failures(failures).unwrap_err();
        assert_eq!(err.failures().len(), 2);
        assert_eq!(err.to_string(), "2 slot(s) failed during emit");
    }
}
