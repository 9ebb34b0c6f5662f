//! Boolean eligibility constraints evaluated against merged metadata
//! environments.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interpolate::interpolate;

/// Constraint evaluation failure.
///
/// Not an exceptional condition: the next environment change re-evaluates
/// the constraint and may clear it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("constraint {expression:?} failed for {key:?}: interpolated to {actual:?}")]
pub struct ConstraintError {
    /// The key template that was checked.
    pub key: String,
    /// The comparison expression it was checked against.
    pub expression: String,
    /// What the template interpolated to.
    pub actual: String,
}

/// Mapping from interpolatable key templates to comparison expressions.
///
/// An expression is an optional `!=` prefix (absence means equality)
/// followed by the expected literal. Entries are checked in map order and
/// the first violation fails the whole constraint. Evaluation is pure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Constraint(BTreeMap<String, String>);

impl Constraint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, expression: impl Into<String>) {
        self.0.insert(key.into(), expression.into());
    }

    /// Merge another constraint in. Colliding keys take the other's
    /// expression.
    pub fn extend(&mut self, other: Constraint) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Evaluate against an environment.
    ///
    /// Each key template is interpolated (missing keys become empty
    /// strings) and the result string-compared with the expected literal
    /// under the expression's operator.
    pub fn check(&self, env: &BTreeMap<String, String>) -> Result<(), ConstraintError> {
        for (key, expression) in &self.0 {
            let (negate, expect) = match expression.strip_prefix("!=") {
                Some(rest) => (true, rest.trim()),
                None => (false, expression.trim()),
            };
            let actual = interpolate(key, &[env]);
            if (actual == expect) == negate {
                return Err(ConstraintError {
                    key: key.clone(),
                    expression: expression.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Constraint {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Constraint {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}
