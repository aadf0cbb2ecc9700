//! Protocol-level values.
//!
//! [`WireValue`] is what a transport stores and ships for one point. It
//! is deliberately close to what the protocols carry: Channel Access
//! points are doubles, integers, strings and flat arrays; pvAccess adds
//! NDArray-like values and structures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// NDArray-like payload with named attributes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
    #[serde(default)]
    pub attributes: BTreeMap<String, f64>,
}

/// Value of one protocol point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireValue {
    Double(f64),
    Int(i64),
    Text(String),
    DoubleArray(Vec<f64>),
    IntArray(Vec<i64>),
    NdArray(NdArray),
    Structure(BTreeMap<String, WireValue>),
}

impl WireValue {
    /// Short type name for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Double(_) => "double",
            Self::Int(_) => "int",
            Self::Text(_) => "text",
            Self::DoubleArray(_) => "double array",
            Self::IntArray(_) => "int array",
            Self::NdArray(_) => "ndarray",
            Self::Structure(_) => "structure",
        }
    }

    /// Numeric scalar value (doubles and integers).
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Flat numeric array (double or integer arrays).
    #[must_use]
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        match self {
            Self::DoubleArray(v) => Some(v.clone()),
            #[allow(clippy::cast_precision_loss)]
            Self::IntArray(v) => Some(v.iter().map(|x| *x as f64).collect()),
            _ => None,
        }
    }

    /// Integer array as sizes; negative entries fail.
    #[must_use]
    pub fn to_usize_vec(&self) -> Option<Vec<usize>> {
        match self {
            Self::IntArray(v) => v.iter().map(|x| usize::try_from(*x).ok()).collect(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_structure(&self) -> Option<&BTreeMap<String, WireValue>> {
        match self {
            Self::Structure(fields) => Some(fields),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_coercions() {
        assert_eq!(WireValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(WireValue::Text("3".into()).as_f64(), None);
        assert_eq!(
            WireValue::IntArray(vec![1, 2]).to_f64_vec(),
            Some(vec![1.0, 2.0])
        );
        assert_eq!(WireValue::IntArray(vec![2, -1]).to_usize_vec(), None);
        assert_eq!(
            WireValue::IntArray(vec![50, 40]).to_usize_vec(),
            Some(vec![50, 40])
        );
    }

    #[test]
    fn type_names() {
        assert_eq!(WireValue::NdArray(NdArray::default()).type_name(), "ndarray");
        assert_eq!(
            WireValue::Structure(BTreeMap::new()).type_name(),
            "structure"
        );
    }
}
