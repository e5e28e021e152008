//! Outcome classification shared by retry and circuit breaker
//!
//! Classification is an explicitly ordered predicate chain over a
//! [`Failure`] value:
//!
//! 1. any *ignore* predicate matches → [`Classification::Ignored`]
//! 2. explicit *include* predicates exist → `Included` if one matches,
//!    otherwise `Excluded`
//! 3. no include predicates → everything not ignored is `Included`
//!
//! For retry, "included" means retried; for a circuit breaker it means
//! recorded as a failure.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::error::{Failure, PolicyErrorKind};

/// Shareable predicate over a failed outcome.
#[derive(Clone)]
pub struct ErrorPredicate(Arc<dyn Fn(&Failure<'_>) -> bool + Send + Sync>);

impl ErrorPredicate {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Failure<'_>) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// Matches call errors of concrete type `X`.
    pub fn of_type<X>() -> Self
    where
        X: StdError + 'static,
    {
        Self::new(|failure| match failure {
            Failure::Call(e) => e.downcast_ref::<X>().is_some(),
            Failure::Policy(_) => false,
        })
    }

    /// Matches call errors of type `X` that also satisfy `predicate`.
    pub fn matching<X, F>(predicate: F) -> Self
    where
        X: StdError + 'static,
        F: Fn(&X) -> bool + Send + Sync + 'static,
    {
        Self::new(move |failure| match failure {
            Failure::Call(e) => e.downcast_ref::<X>().is_some_and(&predicate),
            Failure::Policy(_) => false,
        })
    }

    /// Matches a rejection raised by an inner policy.
    pub fn policy(kind: PolicyErrorKind) -> Self {
        Self::new(move |failure| matches!(failure, Failure::Policy(k) if *k == kind))
    }

    pub fn test(&self, failure: &Failure<'_>) -> bool {
        (self.0)(failure)
    }
}

impl fmt::Debug for ErrorPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorPredicate(..)")
    }
}

/// Result of running the classifier chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Matched an ignore predicate; neither success nor failure
    Ignored,
    /// Counts as a failure (retried, or recorded by the breaker)
    Included,
    /// Not ignored, but outside an explicit include set
    Excluded,
}

/// Ordered ignore → include → default chain.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    ignore: Vec<ErrorPredicate>,
    include: Vec<ErrorPredicate>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ignore(mut self, predicate: ErrorPredicate) -> Self {
        self.ignore.push(predicate);
        self
    }

    #[must_use]
    pub fn include(mut self, predicate: ErrorPredicate) -> Self {
        self.include.push(predicate);
        self
    }

    /// Whether an explicit include set has been configured
    pub fn has_include_rules(&self) -> bool {
        !self.include.is_empty()
    }

    pub fn classify(&self, failure: &Failure<'_>) -> Classification {
        if self.ignore.iter().any(|p| p.test(failure)) {
            Classification::Ignored
        } else if self.include.is_empty() || self.include.iter().any(|p| p.test(failure)) {
            Classification::Included
        } else {
            Classification::Excluded
        }
    }
}

/// Type-erased predicate over a successful result.
///
/// Built from a typed closure; results of any other type never match.
#[derive(Clone)]
pub struct ResultPredicate(Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>);

impl ResultPredicate {
    pub fn new<T, F>(predicate: F) -> Self
    where
        T: 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(move |value: &dyn Any| {
            value.downcast_ref::<T>().is_some_and(&predicate)
        }))
    }

    pub fn test(&self, value: &dyn Any) -> bool {
        (self.0)(value)
    }
}

impl fmt::Debug for ResultPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResultPredicate(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Debug, thiserror::Error)]
    #[error("business rule violated")]
    struct BusinessError;

    fn io_error(kind: io::ErrorKind) -> io::Error {
        io::Error::new(kind, "io")
    }

    #[test]
    fn test_default_includes_everything() {
        let classifier = ErrorClassifier::new();
        let err = io_error(io::ErrorKind::TimedOut);
        assert_eq!(
            classifier.classify(&Failure::Call(&err)),
            Classification::Included
        );
        assert_eq!(
            classifier.classify(&Failure::Policy(PolicyErrorKind::CallNotPermitted)),
            Classification::Included
        );
    }

    #[test]
    fn test_ignore_takes_precedence_over_include() {
        let classifier = ErrorClassifier::new()
            .ignore(ErrorPredicate::of_type::<BusinessError>())
            .include(ErrorPredicate::of_type::<BusinessError>());

        assert_eq!(
            classifier.classify(&Failure::Call(&BusinessError)),
            Classification::Ignored
        );
    }

    #[test]
    fn test_explicit_include_excludes_the_rest() {
        let classifier = ErrorClassifier::new().include(ErrorPredicate::matching(
            |e: &io::Error| e.kind() == io::ErrorKind::ConnectionReset,
        ));

        let reset = io_error(io::ErrorKind::ConnectionReset);
        let denied = io_error(io::ErrorKind::PermissionDenied);
        assert_eq!(
            classifier.classify(&Failure::Call(&reset)),
            Classification::Included
        );
        assert_eq!(
            classifier.classify(&Failure::Call(&denied)),
            Classification::Excluded
        );
        assert_eq!(
            classifier.classify(&Failure::Call(&BusinessError)),
            Classification::Excluded
        );
    }

    #[test]
    fn test_policy_predicate() {
        let classifier = ErrorClassifier::new()
            .ignore(ErrorPredicate::policy(PolicyErrorKind::BulkheadFull));
        assert_eq!(
            classifier.classify(&Failure::Policy(PolicyErrorKind::BulkheadFull)),
            Classification::Ignored
        );
        assert_eq!(
            classifier.classify(&Failure::Policy(PolicyErrorKind::Timeout)),
            Classification::Included
        );
    }

    #[test]
    fn test_result_predicate_is_type_checked() {
        let empty = ResultPredicate::new(|v: &Vec<u8>| v.is_empty());
        assert!(empty.test(&Vec::<u8>::new()));
        assert!(!empty.test(&vec![1u8]));
        assert!(!empty.test(&"not a vec"));
    }
}
