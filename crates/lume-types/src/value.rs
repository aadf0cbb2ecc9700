//! Process variable payloads.
//!
//! [`PvValue`] is the protocol-neutral value stored in the registry and
//! handed to the model. It is plain owned data: cloning a value is the
//! only way it crosses an execution-context boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a variable's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    /// Single `f64`.
    Scalar,
    /// N-dimensional array.
    Array,
    /// Two-dimensional image with axis bounds.
    Image,
}

impl fmt::Display for VariableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scalar => "scalar",
            Self::Array => "array",
            Self::Image => "image",
        };
        f.write_str(s)
    }
}

/// One of the four axis limits of an image or array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    XMin,
    XMax,
    YMin,
    YMax,
}

impl Axis {
    /// All axes in publication order.
    pub const ALL: [Axis; 4] = [Axis::XMin, Axis::XMax, Axis::YMin, Axis::YMax];

    /// Attribute key used when bounds travel with the payload.
    #[must_use]
    pub fn attribute(&self) -> &'static str {
        match self {
            Self::XMin => "x_min",
            Self::XMax => "x_max",
            Self::YMin => "y_min",
            Self::YMax => "y_max",
        }
    }
}

/// Axis bounds carried alongside image and array data.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisBounds {
    #[serde(default)]
    pub x_min: f64,
    #[serde(default)]
    pub x_max: f64,
    #[serde(default)]
    pub y_min: f64,
    #[serde(default)]
    pub y_max: f64,
}

impl AxisBounds {
    #[must_use]
    pub fn new(x_min: f64, x_max: f64, y_min: f64, y_max: f64) -> Self {
        Self {
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    #[must_use]
    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::XMin => self.x_min,
            Axis::XMax => self.x_max,
            Axis::YMin => self.y_min,
            Axis::YMax => self.y_max,
        }
    }

    pub fn set(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::XMin => self.x_min = value,
            Axis::XMax => self.x_max = value,
            Axis::YMin => self.y_min = value,
            Axis::YMax => self.y_max = value,
        }
    }
}

/// Row-major `f64` data with an explicit shape.
///
/// # Example
///
/// ```
/// use lume_types::ArrayData;
///
/// let img = ArrayData::zeros(vec![2, 3]);
/// assert_eq!(img.len(), 6);
/// assert!(img.is_consistent());
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArrayData {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
    #[serde(default)]
    pub bounds: AxisBounds,
}

impl ArrayData {
    #[must_use]
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Self {
        Self {
            shape,
            data,
            bounds: AxisBounds::default(),
        }
    }

    /// Zero-filled array of `shape`.
    ///
    /// A shape whose element count overflows `usize` yields an empty,
    /// inconsistent array; use [`try_zeros`](Self::try_zeros) to detect it.
    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        match element_count(&shape) {
            Some(len) => Self::new(shape, vec![0.0; len]),
            None => Self::new(shape, Vec::new()),
        }
    }

    /// Zero-filled array of `shape`, or `None` if its element count
    /// overflows `usize`.
    #[must_use]
    pub fn try_zeros(shape: Vec<usize>) -> Option<Self> {
        let len = element_count(&shape)?;
        Some(Self::new(shape, vec![0.0; len]))
    }

    #[must_use]
    pub fn with_bounds(mut self, bounds: AxisBounds) -> Self {
        self.bounds = bounds;
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// `true` when the element count matches the product of `shape`.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        element_count(&self.shape) == Some(self.data.len())
    }
}

/// Number of elements a `shape` holds; `None` on overflow.
#[must_use]
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |n, d| n.checked_mul(*d))
}

/// Protocol-neutral process variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PvValue {
    Scalar(f64),
    Array(ArrayData),
    Image(ArrayData),
}

impl PvValue {
    #[must_use]
    pub fn kind(&self) -> VariableKind {
        match self {
            Self::Scalar(_) => VariableKind::Scalar,
            Self::Array(_) => VariableKind::Array,
            Self::Image(_) => VariableKind::Image,
        }
    }

    #[must_use]
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// Array data of an array or image value.
    #[must_use]
    pub fn as_array(&self) -> Option<&ArrayData> {
        match self {
            Self::Array(a) | Self::Image(a) => Some(a),
            Self::Scalar(_) => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut ArrayData> {
        match self {
            Self::Array(a) | Self::Image(a) => Some(a),
            Self::Scalar(_) => None,
        }
    }
}

impl From<f64> for PvValue {
    fn from(v: f64) -> Self {
        Self::Scalar(v)
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(v) => write!(f, "{v}"),
            Self::Array(a) => write!(f, "array{:?}", a.shape),
            Self::Image(a) => write!(f, "image{:?}", a.shape),
        }
    }
}
