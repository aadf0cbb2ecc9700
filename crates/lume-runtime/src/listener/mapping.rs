//! Protocol mappings.
//!
//! A [`ProtocolMapping`] translates between registry values and the points
//! a protocol serves. There is one implementation per protocol, selected
//! per variable from its binding:
//!
//! | Value | Channel Access | pvAccess |
//! |-------|----------------|----------|
//! | scalar | `{pv}` double | `{pv}` double |
//! | array | `{pv}:ArrayData_RBV` + dimension points | `{pv}` NDArray |
//! | image | `{pv}:ArrayData_RBV` + size, bound and color points | `{pv}` NDArray with `x_min..y_max` attributes |
//! | structure | unsupported | `{pv}` structure of fields |
//!
//! Every point of one value is returned as one group so the transport can
//! publish payload and bounds atomically.

use crate::config::SummaryRecord;
use crate::registry::{ValidationError, Variable};
use crate::transport::{NdArray, WireValue};
use lume_types::{ArrayData, Axis, AxisBounds, Protocol, PvValue, VariableKind};
use std::collections::BTreeMap;

/// Translation between registry values and protocol points.
pub trait ProtocolMapping: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Every point representing `value` at `pvname`; the primary point
    /// comes first.
    fn encode(&self, pvname: &str, value: &PvValue) -> Vec<(String, WireValue)>;

    /// The point clients write to and monitor.
    fn primary_point(&self, pvname: &str, kind: VariableKind) -> String;

    /// Points a client reads, in order, to rebuild a value.
    fn read_points(&self, pvname: &str, kind: VariableKind) -> Vec<String>;

    /// What a client sends to the primary point to write `value`.
    fn encode_write(&self, value: &PvValue) -> WireValue;

    /// Turns a value written to the primary point into a value of `var`.
    ///
    /// Shape and bounds missing from the wire value are taken from the
    /// variable's current value. The result still has to be validated.
    ///
    /// # Errors
    ///
    /// [`ValidationError::UnsupportedWireValue`] when the wire type cannot
    /// carry a value of this kind.
    fn decode_write(&self, var: &Variable, wire: &WireValue) -> Result<PvValue, ValidationError>;

    /// Rebuilds a value from the points listed by [`read_points`].
    ///
    /// [`read_points`]: ProtocolMapping::read_points
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed point.
    fn decode_read(&self, kind: VariableKind, values: &[WireValue]) -> Result<PvValue, String>;

    /// Structure value combining several variables, if supported.
    fn encode_structure(&self, fields: &[(&str, &PvValue)]) -> Option<WireValue>;

    /// Points describing the summary record.
    fn summary_points(&self, pvname: &str, record: &SummaryRecord) -> Vec<(String, WireValue)>;
}

/// Channel Access mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaMapping;

/// pvAccess mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct PvaMapping;

static CA: CaMapping = CaMapping;
static PVA: PvaMapping = PvaMapping;

/// The mapping for `protocol`.
#[must_use]
pub fn mapping_for(protocol: Protocol) -> &'static dyn ProtocolMapping {
    match protocol {
        Protocol::ChannelAccess => &CA,
        Protocol::PvAccess => &PVA,
    }
}

const ARRAY_DATA: &str = "ArrayData_RBV";
const DIMENSIONS: &str = "Dimensions_RBV";
const N_DIMENSIONS: &str = "NDimensions_RBV";
const ARRAY_SIZE: &str = "ArraySize_RBV";
const ARRAY_SIZE_X: &str = "ArraySizeX_RBV";
const ARRAY_SIZE_Y: &str = "ArraySizeY_RBV";
const COLOR_MODE: &str = "ColorMode_RBV";

fn bound_suffix(axis: Axis) -> &'static str {
    match axis {
        Axis::XMin => "MinX_RBV",
        Axis::XMax => "MaxX_RBV",
        Axis::YMin => "MinY_RBV",
        Axis::YMax => "MaxY_RBV",
    }
}

fn point(pvname: &str, suffix: &str) -> String {
    format!("{pvname}:{suffix}")
}

fn as_int(n: usize) -> WireValue {
    WireValue::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

fn int_array(shape: &[usize]) -> WireValue {
    WireValue::IntArray(
        shape
            .iter()
            .map(|n| i64::try_from(*n).unwrap_or(i64::MAX))
            .collect(),
    )
}

fn wrap(kind: VariableKind, a: ArrayData) -> PvValue {
    if kind == VariableKind::Image {
        PvValue::Image(a)
    } else {
        PvValue::Array(a)
    }
}

fn unsupported(var: &Variable, wire: &WireValue) -> ValidationError {
    ValidationError::UnsupportedWireValue {
        name: var.name.clone(),
        found: wire.type_name(),
    }
}

/// Reshapes flat data to the variable's shape, keeping current bounds.
fn reshape_flat(var: &Variable, data: Vec<f64>) -> PvValue {
    let shape = var.expected_shape().unwrap_or(&[]).to_vec();
    let bounds = var
        .value
        .as_array()
        .map(|a| a.bounds)
        .unwrap_or_default();
    wrap(var.kind, ArrayData::new(shape, data).with_bounds(bounds))
}

impl ProtocolMapping for CaMapping {
    fn protocol(&self) -> Protocol {
        Protocol::ChannelAccess
    }

    fn encode(&self, pvname: &str, value: &PvValue) -> Vec<(String, WireValue)> {
        match value {
            PvValue::Scalar(v) => vec![(pvname.to_string(), WireValue::Double(*v))],
            PvValue::Array(a) => vec![
                (point(pvname, ARRAY_DATA), WireValue::DoubleArray(a.data.clone())),
                (point(pvname, N_DIMENSIONS), as_int(a.ndim())),
                (point(pvname, DIMENSIONS), int_array(&a.shape)),
                (point(pvname, ARRAY_SIZE), as_int(a.len())),
            ],
            PvValue::Image(a) => {
                let mut group = vec![
                    (point(pvname, ARRAY_DATA), WireValue::DoubleArray(a.data.clone())),
                    (point(pvname, N_DIMENSIONS), as_int(a.ndim())),
                    (point(pvname, DIMENSIONS), int_array(&a.shape)),
                    (
                        point(pvname, ARRAY_SIZE_X),
                        as_int(a.shape.first().copied().unwrap_or(0)),
                    ),
                    (
                        point(pvname, ARRAY_SIZE_Y),
                        as_int(a.shape.get(1).copied().unwrap_or(0)),
                    ),
                    (point(pvname, ARRAY_SIZE), as_int(a.len())),
                    (point(pvname, COLOR_MODE), WireValue::Int(0)),
                ];
                for axis in Axis::ALL {
                    group.push((
                        point(pvname, bound_suffix(axis)),
                        WireValue::Double(a.bounds.get(axis)),
                    ));
                }
                group
            }
        }
    }

    fn primary_point(&self, pvname: &str, kind: VariableKind) -> String {
        match kind {
            VariableKind::Scalar => pvname.to_string(),
            VariableKind::Array | VariableKind::Image => point(pvname, ARRAY_DATA),
        }
    }

    fn read_points(&self, pvname: &str, kind: VariableKind) -> Vec<String> {
        match kind {
            VariableKind::Scalar => vec![pvname.to_string()],
            VariableKind::Array => vec![point(pvname, ARRAY_DATA), point(pvname, DIMENSIONS)],
            VariableKind::Image => {
                let mut points = vec![point(pvname, ARRAY_DATA), point(pvname, DIMENSIONS)];
                points.extend(Axis::ALL.iter().map(|a| point(pvname, bound_suffix(*a))));
                points
            }
        }
    }

    fn encode_write(&self, value: &PvValue) -> WireValue {
        match value {
            PvValue::Scalar(v) => WireValue::Double(*v),
            PvValue::Array(a) | PvValue::Image(a) => WireValue::DoubleArray(a.data.clone()),
        }
    }

    fn decode_write(&self, var: &Variable, wire: &WireValue) -> Result<PvValue, ValidationError> {
        match var.kind {
            VariableKind::Scalar => wire
                .as_f64()
                .map(PvValue::Scalar)
                .ok_or_else(|| unsupported(var, wire)),
            VariableKind::Array | VariableKind::Image => wire
                .to_f64_vec()
                .map(|data| reshape_flat(var, data))
                .ok_or_else(|| unsupported(var, wire)),
        }
    }

    fn decode_read(&self, kind: VariableKind, values: &[WireValue]) -> Result<PvValue, String> {
        let first = values.first().ok_or("no points read")?;
        if kind == VariableKind::Scalar {
            return first
                .as_f64()
                .map(PvValue::Scalar)
                .ok_or_else(|| format!("expected a number, got {}", first.type_name()));
        }

        let data = first
            .to_f64_vec()
            .ok_or_else(|| format!("expected array data, got {}", first.type_name()))?;
        let shape = values
            .get(1)
            .and_then(WireValue::to_usize_vec)
            .ok_or("missing or malformed dimensions")?;
        let mut array = ArrayData::new(shape, data);
        if kind == VariableKind::Image {
            let mut bounds = AxisBounds::default();
            for (axis, raw) in Axis::ALL.iter().zip(values.iter().skip(2)) {
                let v = raw
                    .as_f64()
                    .ok_or_else(|| format!("malformed {} bound", axis.attribute()))?;
                bounds.set(*axis, v);
            }
            array.bounds = bounds;
        }
        Ok(wrap(kind, array))
    }

    fn encode_structure(&self, _fields: &[(&str, &PvValue)]) -> Option<WireValue> {
        None
    }

    fn summary_points(&self, pvname: &str, record: &SummaryRecord) -> Vec<(String, WireValue)> {
        summary_fields(record)
            .into_iter()
            .map(|(key, value)| (point(pvname, key), value))
            .collect()
    }
}

fn nd_array(a: &ArrayData, with_bounds: bool) -> WireValue {
    let attributes = if with_bounds {
        Axis::ALL
            .iter()
            .map(|axis| (axis.attribute().to_string(), a.bounds.get(*axis)))
            .collect()
    } else {
        BTreeMap::new()
    };
    WireValue::NdArray(NdArray {
        shape: a.shape.clone(),
        data: a.data.clone(),
        attributes,
    })
}

fn pva_value(value: &PvValue) -> WireValue {
    match value {
        PvValue::Scalar(v) => WireValue::Double(*v),
        PvValue::Array(a) => nd_array(a, false),
        PvValue::Image(a) => nd_array(a, true),
    }
}

fn bounds_from_attributes(attributes: &BTreeMap<String, f64>, base: AxisBounds) -> AxisBounds {
    let mut bounds = base;
    for axis in Axis::ALL {
        if let Some(v) = attributes.get(axis.attribute()) {
            bounds.set(axis, *v);
        }
    }
    bounds
}

impl ProtocolMapping for PvaMapping {
    fn protocol(&self) -> Protocol {
        Protocol::PvAccess
    }

    fn encode(&self, pvname: &str, value: &PvValue) -> Vec<(String, WireValue)> {
        vec![(pvname.to_string(), pva_value(value))]
    }

    fn primary_point(&self, pvname: &str, _kind: VariableKind) -> String {
        pvname.to_string()
    }

    fn read_points(&self, pvname: &str, _kind: VariableKind) -> Vec<String> {
        vec![pvname.to_string()]
    }

    fn encode_write(&self, value: &PvValue) -> WireValue {
        pva_value(value)
    }

    fn decode_write(&self, var: &Variable, wire: &WireValue) -> Result<PvValue, ValidationError> {
        match (var.kind, wire) {
            (VariableKind::Scalar, w) => w
                .as_f64()
                .map(PvValue::Scalar)
                .ok_or_else(|| unsupported(var, wire)),
            (kind, WireValue::NdArray(nd)) => {
                let base = var.value.as_array().map(|a| a.bounds).unwrap_or_default();
                let array = ArrayData::new(nd.shape.clone(), nd.data.clone())
                    .with_bounds(bounds_from_attributes(&nd.attributes, base));
                Ok(wrap(kind, array))
            }
            (_, w) => w
                .to_f64_vec()
                .map(|data| reshape_flat(var, data))
                .ok_or_else(|| unsupported(var, wire)),
        }
    }

    fn decode_read(&self, kind: VariableKind, values: &[WireValue]) -> Result<PvValue, String> {
        let first = values.first().ok_or("no points read")?;
        match (kind, first) {
            (VariableKind::Scalar, w) => w
                .as_f64()
                .map(PvValue::Scalar)
                .ok_or_else(|| format!("expected a number, got {}", w.type_name())),
            (kind, WireValue::NdArray(nd)) => {
                let bounds = bounds_from_attributes(&nd.attributes, AxisBounds::default());
                Ok(wrap(
                    kind,
                    ArrayData::new(nd.shape.clone(), nd.data.clone()).with_bounds(bounds),
                ))
            }
            (_, w) => Err(format!("expected an ndarray, got {}", w.type_name())),
        }
    }

    fn encode_structure(&self, fields: &[(&str, &PvValue)]) -> Option<WireValue> {
        Some(WireValue::Structure(
            fields
                .iter()
                .map(|(name, value)| ((*name).to_string(), pva_value(value)))
                .collect(),
        ))
    }

    fn summary_points(&self, pvname: &str, record: &SummaryRecord) -> Vec<(String, WireValue)> {
        vec![(
            pvname.to_string(),
            WireValue::Structure(
                summary_fields(record)
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            ),
        )]
    }
}

fn summary_fields(record: &SummaryRecord) -> Vec<(&'static str, WireValue)> {
    vec![
        ("owner", WireValue::Text(record.owner.clone())),
        ("description", WireValue::Text(record.description.clone())),
        (
            "id",
            WireValue::Text(record.id.clone().unwrap_or_default()),
        ),
        (
            "timestamp",
            WireValue::Text(
                record
                    .timestamp
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
            ),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::registry::PvAddress;

    fn image_var() -> Variable {
        let default = PvValue::Image(
            ArrayData::zeros(vec![2, 3]).with_bounds(AxisBounds::new(0.0, 1.0, 2.0, 3.0)),
        );
        Variable {
            name: "img".into(),
            kind: VariableKind::Image,
            role: Role::Input,
            value: default.clone(),
            default,
            range: None,
            parent: None,
            units: None,
            precision: None,
            address: PvAddress {
                pvname: "test:img".into(),
                protocol: Protocol::ChannelAccess,
                serve: true,
            },
        }
    }

    fn image_value() -> PvValue {
        PvValue::Image(
            ArrayData::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
                .with_bounds(AxisBounds::new(-1.0, 1.0, -2.0, 2.0)),
        )
    }

    #[test]
    fn ca_image_family() {
        let group = CA.encode("test:img", &image_value());
        let points: BTreeMap<_, _> = group.into_iter().collect();
        assert_eq!(points.len(), 11);
        assert_eq!(
            points["test:img:ArraySizeX_RBV"],
            WireValue::Int(2),
        );
        assert_eq!(points["test:img:ArraySizeY_RBV"], WireValue::Int(3));
        assert_eq!(points["test:img:ArraySize_RBV"], WireValue::Int(6));
        assert_eq!(points["test:img:MaxY_RBV"], WireValue::Double(2.0));
        assert_eq!(
            points["test:img:Dimensions_RBV"],
            WireValue::IntArray(vec![2, 3])
        );
    }

    #[test]
    fn ca_primary_point_comes_first() {
        let group = CA.encode("test:img", &image_value());
        assert_eq!(group[0].0, CA.primary_point("test:img", VariableKind::Image));
        assert_eq!(CA.primary_point("test:x", VariableKind::Scalar), "test:x");
    }

    #[test]
    fn ca_read_rebuilds_image_with_bounds() {
        let value = image_value();
        let points: BTreeMap<_, _> = CA.encode("p", &value).into_iter().collect();
        let read: Vec<WireValue> = CA
            .read_points("p", VariableKind::Image)
            .iter()
            .map(|name| points[name].clone())
            .collect();
        assert_eq!(CA.decode_read(VariableKind::Image, &read).unwrap(), value);
    }

    #[test]
    fn ca_write_reshapes_and_keeps_bounds() {
        let var = image_var();
        let wire = WireValue::DoubleArray(vec![9.0; 6]);
        let value = CA.decode_write(&var, &wire).unwrap();
        let a = value.as_array().unwrap();
        assert_eq!(a.shape, vec![2, 3]);
        assert_eq!(a.bounds.y_max, 3.0);
        assert!(var.validate(&value).is_ok());

        assert!(matches!(
            CA.decode_write(&var, &WireValue::Text("x".into())),
            Err(ValidationError::UnsupportedWireValue { .. })
        ));
    }

    #[test]
    fn pva_image_carries_bound_attributes() {
        let group = PVA.encode("test:img", &image_value());
        assert_eq!(group.len(), 1);
        let WireValue::NdArray(nd) = &group[0].1 else {
            panic!("expected ndarray");
        };
        assert_eq!(nd.attributes["x_min"], -1.0);
        assert_eq!(nd.attributes["y_max"], 2.0);
        assert_eq!(
            PVA.decode_read(VariableKind::Image, &[group[0].1.clone()])
                .unwrap(),
            image_value()
        );
    }

    #[test]
    fn pva_write_without_attributes_keeps_current_bounds() {
        let var = image_var();
        let wire = WireValue::NdArray(NdArray {
            shape: vec![2, 3],
            data: vec![0.5; 6],
            attributes: BTreeMap::from([("x_max".to_string(), 7.0)]),
        });
        let a = PVA.decode_write(&var, &wire).unwrap();
        let a = a.as_array().unwrap();
        assert_eq!(a.bounds.x_max, 7.0);
        assert_eq!(a.bounds.y_min, 2.0);
    }

    #[test]
    fn structures_only_over_pva() {
        let v = PvValue::Scalar(1.0);
        assert!(CA.encode_structure(&[("a", &v)]).is_none());
        let s = PVA.encode_structure(&[("a", &v)]).unwrap();
        assert_eq!(
            s.as_structure().unwrap()["a"],
            WireValue::Double(1.0)
        );
    }

    #[test]
    fn summary_points_per_protocol() {
        let record = SummaryRecord {
            pvname: None,
            protocol: Protocol::ChannelAccess,
            owner: "ops".into(),
            description: "demo".into(),
            id: Some("42".into()),
            timestamp: None,
        };
        let ca: BTreeMap<_, _> = CA.summary_points("s", &record).into_iter().collect();
        assert_eq!(ca["s:owner"], WireValue::Text("ops".into()));
        assert_eq!(ca["s:id"], WireValue::Text("42".into()));

        let pva = PVA.summary_points("s", &record);
        assert_eq!(pva.len(), 1);
        assert_eq!(
            pva[0].1.as_structure().unwrap()["description"],
            WireValue::Text("demo".into())
        );
    }

    #[test]
    fn scalar_ints_are_accepted() {
        let mut var = image_var();
        var.kind = VariableKind::Scalar;
        assert_eq!(
            CA.decode_write(&var, &WireValue::Int(4)).unwrap(),
            PvValue::Scalar(4.0)
        );
        assert_eq!(
            mapping_for(Protocol::PvAccess).protocol(),
            Protocol::PvAccess
        );
    }
}
