//! The model contract.
//!
//! The engine needs exactly one capability from user code: evaluate the
//! full input set and return output values. Closures work directly:
//!
//! ```
//! use lume_runtime::model::{InputSnapshot, Model, OutputValues};
//! use lume_runtime::engine::EvaluationError;
//!
//! let mut double = |inputs: &InputSnapshot| -> Result<OutputValues, EvaluationError> {
//!     let x = inputs.scalar("x")?;
//!     Ok(OutputValues::new().with("y", 2.0 * x))
//! };
//!
//! let inputs = InputSnapshot::from_iter([("x".to_string(), 4.0.into())]);
//! let out = double.evaluate(&inputs).unwrap();
//! assert_eq!(out.get("y").and_then(|v| v.as_scalar()), Some(8.0));
//! ```

use crate::engine::EvaluationError;
use lume_types::{ArrayData, PvValue};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// A user model evaluated by the execution loop.
///
/// `evaluate` is never called concurrently with itself. It runs on the
/// execution loop's own thread and may block for as long as it needs.
pub trait Model: Send {
    /// Computes outputs from the complete current input set.
    ///
    /// # Errors
    ///
    /// Any error is logged by the loop; previously published outputs are
    /// kept.
    fn evaluate(&mut self, inputs: &InputSnapshot) -> Result<OutputValues, EvaluationError>;
}

impl<F> Model for F
where
    F: FnMut(&InputSnapshot) -> Result<OutputValues, EvaluationError> + Send,
{
    fn evaluate(&mut self, inputs: &InputSnapshot) -> Result<OutputValues, EvaluationError> {
        self(inputs)
    }
}

/// Point-in-time values of every input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSnapshot {
    values: BTreeMap<String, PvValue>,
}

impl InputSnapshot {
    #[must_use]
    pub fn new(values: BTreeMap<String, PvValue>) -> Self {
        Self { values }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PvValue> {
        self.values.get(name)
    }

    /// Scalar input `name`.
    ///
    /// # Errors
    ///
    /// [`EvaluationError::MissingInput`] if absent or not a scalar.
    pub fn scalar(&self, name: &str) -> Result<f64, EvaluationError> {
        self.get(name)
            .and_then(PvValue::as_scalar)
            .ok_or_else(|| EvaluationError::MissingInput {
                name: name.to_string(),
            })
    }

    /// Array or image input `name`.
    ///
    /// # Errors
    ///
    /// [`EvaluationError::MissingInput`] if absent or a scalar.
    pub fn array(&self, name: &str) -> Result<&ArrayData, EvaluationError> {
        self.get(name)
            .and_then(PvValue::as_array)
            .ok_or_else(|| EvaluationError::MissingInput {
                name: name.to_string(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PvValue)> {
        self.values.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, PvValue)> for InputSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, PvValue)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Output values returned by a model, keyed by variable name.
///
/// A model may return a subset of its outputs; omitted outputs keep their
/// current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputValues {
    values: BTreeMap<String, PvValue>,
}

impl OutputValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<PvValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<PvValue>) {
        self.values.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PvValue> {
        self.values.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> BTreeMap<String, PvValue> {
        self.values
    }
}

impl FromIterator<(String, PvValue)> for OutputValues {
    fn from_iter<I: IntoIterator<Item = (String, PvValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Runs `evaluate`, turning a panic into [`EvaluationError::Panicked`].
pub(crate) fn evaluate_guarded(
    model: &mut dyn Model,
    inputs: &InputSnapshot,
) -> Result<OutputValues, EvaluationError> {
    match catch_unwind(AssertUnwindSafe(|| model.evaluate(inputs))) {
        Ok(result) => result,
        Err(payload) => Err(EvaluationError::Panicked {
            message: panic_message(payload),
        }),
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
