//! Variable descriptors.

use super::ValidationError;
use crate::config::{Role, ValueRange};
use lume_types::{Axis, Protocol, PvValue, VariableKind};

/// External address of a variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvAddress {
    pub pvname: String,
    pub protocol: Protocol,
    /// `false`: externally owned, monitored but never published.
    pub serve: bool,
}

/// Link from a scalar to the axis bound it supplies on an image/array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentBinding {
    pub name: String,
    pub axis: Axis,
}

/// A typed model variable with its current value and protocol binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub kind: VariableKind,
    pub role: Role,
    pub value: PvValue,
    pub default: PvValue,
    pub range: Option<ValueRange>,
    pub parent: Option<ParentBinding>,
    pub units: Option<String>,
    pub precision: Option<u32>,
    pub address: PvAddress,
}

impl Variable {
    #[must_use]
    pub fn is_input(&self) -> bool {
        self.role == Role::Input
    }

    /// Served over `protocol` by this server (as opposed to monitored).
    #[must_use]
    pub fn is_served_over(&self, protocol: Protocol) -> bool {
        self.address.serve && self.address.protocol == protocol
    }

    /// Externally owned and bound over `protocol`.
    #[must_use]
    pub fn is_monitored_over(&self, protocol: Protocol) -> bool {
        !self.address.serve && self.address.protocol == protocol
    }

    /// Shape every array/image value of this variable must have.
    #[must_use]
    pub fn expected_shape(&self) -> Option<&[usize]> {
        self.default.as_array().map(|a| a.shape.as_slice())
    }

    /// Checks `value` against kind, shape and range.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self, value: &PvValue) -> Result<(), ValidationError> {
        if value.kind() != self.kind {
            return Err(ValidationError::KindMismatch {
                name: self.name.clone(),
                expected: self.kind,
                found: value.kind(),
            });
        }

        match value {
            PvValue::Scalar(v) => {
                if !v.is_finite() {
                    return Err(ValidationError::NonFinite {
                        name: self.name.clone(),
                    });
                }
                self.check_range(*v)
            }
            PvValue::Array(a) | PvValue::Image(a) => {
                let expected = self.expected_shape().unwrap_or(&[]);
                let image_rank_ok = self.kind != VariableKind::Image || a.ndim() == 2;
                // Shape first: a foreign shape is never multiplied out.
                if a.shape != expected || !image_rank_ok || !a.is_consistent() {
                    return Err(ValidationError::ShapeMismatch {
                        name: self.name.clone(),
                        expected: expected.to_vec(),
                        found: a.shape.clone(),
                        len: a.len(),
                    });
                }
                if self.range.is_some() {
                    for v in &a.data {
                        self.check_range(*v)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn check_range(&self, v: f64) -> Result<(), ValidationError> {
        match self.range {
            Some(r) if !r.contains(v) => Err(ValidationError::OutOfRange {
                name: self.name.clone(),
                value: v,
                min: r.min,
                max: r.max,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lume_types::ArrayData;

    fn scalar(range: Option<ValueRange>) -> Variable {
        Variable {
            name: "input1".into(),
            kind: VariableKind::Scalar,
            role: Role::Input,
            value: PvValue::Scalar(1.0),
            default: PvValue::Scalar(1.0),
            range,
            parent: None,
            units: None,
            precision: None,
            address: PvAddress {
                pvname: "test:input1".into(),
                protocol: Protocol::ChannelAccess,
                serve: true,
            },
        }
    }

    fn image(shape: Vec<usize>) -> Variable {
        let default = PvValue::Image(ArrayData::zeros(shape));
        Variable {
            name: "img".into(),
            kind: VariableKind::Image,
            role: Role::Output,
            value: default.clone(),
            default,
            ..scalar(None)
        }
    }

    #[test]
    fn scalar_range_is_inclusive() {
        let var = scalar(Some(ValueRange::new(0.0, 256.0)));
        assert!(var.validate(&PvValue::Scalar(0.0)).is_ok());
        assert!(var.validate(&PvValue::Scalar(256.0)).is_ok());
        assert!(matches!(
            var.validate(&PvValue::Scalar(256.5)),
            Err(ValidationError::OutOfRange { value, .. }) if value == 256.5
        ));
    }

    #[test]
    fn scalar_rejects_nan() {
        let var = scalar(None);
        assert!(matches!(
            var.validate(&PvValue::Scalar(f64::NAN)),
            Err(ValidationError::NonFinite { .. })
        ));
    }

    #[test]
    fn kind_must_match() {
        let var = scalar(None);
        let err = var
            .validate(&PvValue::Array(ArrayData::zeros(vec![1])))
            .unwrap_err();
        assert!(matches!(err, ValidationError::KindMismatch { .. }));
    }

    #[test]
    fn image_shape_must_match_default() {
        let var = image(vec![2, 3]);
        assert!(var
            .validate(&PvValue::Image(ArrayData::zeros(vec![2, 3])))
            .is_ok());
        assert!(matches!(
            var.validate(&PvValue::Image(ArrayData::zeros(vec![3, 2]))),
            Err(ValidationError::ShapeMismatch { .. })
        ));
        let ragged = ArrayData::new(vec![2, 3], vec![0.0; 5]);
        assert!(var.validate(&PvValue::Image(ragged)).is_err());
    }

    #[test]
    fn overflowing_shape_is_rejected() {
        let var = image(vec![2, 3]);
        let huge = ArrayData::new(vec![usize::MAX, 2], Vec::new());
        assert!(matches!(
            var.validate(&PvValue::Image(huge)),
            Err(ValidationError::ShapeMismatch { found, len: 0, .. }) if found == vec![usize::MAX, 2]
        ));

        // Matching rank and shape still fail on an element count that overflows.
        let wide = image(vec![usize::MAX, 2]);
        let huge = ArrayData::new(vec![usize::MAX, 2], vec![0.0; 4]);
        assert!(matches!(
            wide.validate(&PvValue::Image(huge)),
            Err(ValidationError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn image_must_be_two_dimensional() {
        let var = image(vec![6]);
        assert!(matches!(
            var.validate(&PvValue::Image(ArrayData::zeros(vec![6]))),
            Err(ValidationError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn array_range_is_element_wise() {
        let mut var = image(vec![1, 3]);
        var.range = Some(ValueRange::new(0.0, 1.0));
        let bad = ArrayData::new(vec![1, 3], vec![0.0, 0.5, 2.0]);
        assert!(matches!(
            var.validate(&PvValue::Image(bad)),
            Err(ValidationError::OutOfRange { value, .. }) if value == 2.0
        ));
    }

    #[test]
    fn serve_flags() {
        let mut var = scalar(None);
        assert!(var.is_served_over(Protocol::ChannelAccess));
        assert!(!var.is_served_over(Protocol::PvAccess));
        var.address.serve = false;
        assert!(var.is_monitored_over(Protocol::ChannelAccess));
        assert!(!var.is_served_over(Protocol::ChannelAccess));
    }
}
