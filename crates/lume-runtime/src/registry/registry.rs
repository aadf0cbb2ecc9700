//! The variable registry.

use super::{ParentBinding, PvAddress, ValidationError, Variable};
use crate::config::{ConfigurationError, EpicsConfig, Role, SummaryRecord, VariableDefinition};
use crate::engine::EvaluationError;
use lume_types::{Axis, Protocol, PvValue, VariableKind};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// A structure PV combining several variables (pvAccess only).
#[derive(Debug, Clone, PartialEq)]
pub struct StructureBinding {
    pub name: String,
    pub pvname: String,
    pub protocol: Protocol,
    pub fields: Vec<String>,
}

/// The resolved summary record.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryBinding {
    pub pvname: String,
    pub protocol: Protocol,
    pub record: SummaryRecord,
}

/// Typed descriptors and current values of every model variable.
///
/// Built once from the configuration. Mutation goes through [`set`] and
/// [`apply_outputs`], both of which validate before touching state.
///
/// [`set`]: VariableRegistry::set
/// [`apply_outputs`]: VariableRegistry::apply_outputs
#[derive(Debug, Clone)]
pub struct VariableRegistry {
    variables: BTreeMap<String, Variable>,
    children: BTreeMap<String, Vec<(String, Axis)>>,
    structures: Arc<Vec<StructureBinding>>,
    summary: Option<Arc<SummaryBinding>>,
}

impl VariableRegistry {
    /// Builds the registry from variable definitions and bindings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] for unresolved parents, missing
    /// bindings or ranges, invalid defaults, duplicate pvnames and
    /// malformed structures.
    pub fn build(
        definitions: &BTreeMap<String, VariableDefinition>,
        epics: &EpicsConfig,
    ) -> Result<Self, ConfigurationError> {
        for (name, binding) in &epics.pvs {
            if binding.fields.is_none() && !definitions.contains_key(name) {
                return Err(ConfigurationError::UnknownBindingTarget { name: name.clone() });
            }
        }

        let mut variables = BTreeMap::new();
        for (name, def) in definitions {
            variables.insert(name.clone(), build_variable(name, def, epics)?);
        }

        let mut children: BTreeMap<String, Vec<(String, Axis)>> = BTreeMap::new();
        let links: Vec<(String, ParentBinding)> = variables
            .values()
            .filter_map(|v| v.parent.clone().map(|p| (v.name.clone(), p)))
            .collect();
        for (child, link) in links {
            let child_default = variables
                .get(&child)
                .and_then(|v| v.default.as_scalar())
                .unwrap_or_default();
            let parent = variables.get_mut(&link.name).ok_or_else(|| {
                ConfigurationError::UnresolvedParent {
                    variable: child.clone(),
                    parent: link.name.clone(),
                }
            })?;
            if parent.kind == VariableKind::Scalar {
                return Err(ConfigurationError::InvalidParent {
                    variable: child,
                    parent: link.name,
                    kind: parent.kind,
                });
            }
            for v in [&mut parent.default, &mut parent.value] {
                if let Some(a) = v.as_array_mut() {
                    a.bounds.set(link.axis, child_default);
                }
            }
            children
                .entry(link.name)
                .or_default()
                .push((child, link.axis));
        }

        let structures = build_structures(&variables, epics)?;
        let summary = build_summary(epics)?;
        check_unique_pvnames(&variables, &structures, summary.as_ref())?;

        Ok(Self {
            variables,
            children,
            structures: Arc::new(structures),
            summary: summary.map(Arc::new),
        })
    }

    /// Returns the variable named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::UnknownVariable`] if there is none.
    pub fn get(&self, name: &str) -> Result<&Variable, ValidationError> {
        self.variables
            .get(name)
            .ok_or_else(|| ValidationError::UnknownVariable {
                name: name.to_string(),
            })
    }

    /// Validates and stores `value`.
    ///
    /// Keeps image/array bounds consistent with bound scalars: setting a
    /// bound scalar updates its parent's axis bound, and setting a parent
    /// takes its bounds from its bound scalars. Returns the names of every
    /// variable whose value changed.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] and leaves the registry unchanged if the
    /// value violates the variable's constraints.
    pub fn set(&mut self, name: &str, value: PvValue) -> Result<Vec<String>, ValidationError> {
        self.get(name)?.validate(&value)?;
        Ok(self.store(name, value))
    }

    fn store(&mut self, name: &str, mut value: PvValue) -> Vec<String> {
        if let (Some(kids), Some(a)) = (self.children.get(name), value.as_array_mut()) {
            for (child, axis) in kids {
                if let Some(v) = self.variables.get(child).and_then(|c| c.value.as_scalar()) {
                    a.bounds.set(*axis, v);
                }
            }
        }

        let mut changed = vec![name.to_string()];
        let parent = match self.variables.get_mut(name) {
            Some(var) => {
                var.value = value;
                var.parent.clone().zip(var.value.as_scalar())
            }
            None => None,
        };

        if let Some((link, v)) = parent {
            if let Some(a) = self
                .variables
                .get_mut(&link.name)
                .and_then(|p| p.value.as_array_mut())
            {
                a.bounds.set(link.axis, v);
                changed.push(link.name);
            }
        }
        changed
    }

    /// Commits a model result all-or-nothing.
    ///
    /// Every entry must name an output and pass validation before any of
    /// them is stored. Array and image outputs are stored before scalars so
    /// bound scalars always win over bounds embedded in a payload.
    ///
    /// # Errors
    ///
    /// Returns [`EvaluationError::UnknownOutput`] or
    /// [`EvaluationError::InvalidOutput`]; no output is modified.
    pub fn apply_outputs(
        &mut self,
        outputs: BTreeMap<String, PvValue>,
    ) -> Result<Vec<String>, EvaluationError> {
        for (name, value) in &outputs {
            let var = self
                .variables
                .get(name)
                .filter(|v| v.role == Role::Output)
                .ok_or_else(|| EvaluationError::UnknownOutput { name: name.clone() })?;
            var.validate(value)
                .map_err(|source| EvaluationError::InvalidOutput { source })?;
        }

        let (scalars, payloads): (Vec<_>, Vec<_>) = outputs
            .into_iter()
            .partition(|(_, v)| v.kind() == VariableKind::Scalar);

        let mut changed = BTreeSet::new();
        for (name, value) in payloads.into_iter().chain(scalars) {
            changed.extend(self.store(&name, value));
        }
        Ok(changed.into_iter().collect())
    }

    /// Overwrites current values, payloads before scalars so bound scalars
    /// end up in their parents' bounds.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`]; values stored before it stay.
    pub fn restore(&mut self, values: BTreeMap<String, PvValue>) -> Result<(), ValidationError> {
        let (scalars, payloads): (Vec<_>, Vec<_>) = values
            .into_iter()
            .partition(|(_, v)| v.kind() == VariableKind::Scalar);
        for (name, value) in payloads.into_iter().chain(scalars) {
            self.set(&name, value)?;
        }
        Ok(())
    }

    /// Current values of every input.
    #[must_use]
    pub fn input_values(&self) -> BTreeMap<String, PvValue> {
        self.variables
            .values()
            .filter(|v| v.is_input())
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect()
    }

    /// Immutable point-in-time copy of the whole registry.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            inner: Arc::new(self.clone()),
        }
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    #[must_use]
    pub fn structures(&self) -> &[StructureBinding] {
        &self.structures
    }

    #[must_use]
    pub fn summary(&self) -> Option<&SummaryBinding> {
        self.summary.as_deref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

/// Immutable, cheaply clonable copy of the registry.
///
/// Handed to the model, to listener contexts when they bind, and to
/// status readers. It never observes later mutations.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    inner: Arc<VariableRegistry>,
}

impl RegistrySnapshot {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.inner.variables.get(name)
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<&PvValue> {
        self.get(name).map(|v| &v.value)
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.inner.variables()
    }

    /// Current value of every variable.
    #[must_use]
    pub fn values(&self) -> BTreeMap<String, PvValue> {
        self.variables()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect()
    }

    /// Owned registry seeded from this snapshot, for contexts that keep a
    /// mirror of model state.
    #[must_use]
    pub fn to_registry(&self) -> VariableRegistry {
        self.inner.as_ref().clone()
    }

    #[must_use]
    pub fn structures(&self) -> &[StructureBinding] {
        self.inner.structures()
    }

    #[must_use]
    pub fn summary(&self) -> Option<&SummaryBinding> {
        self.inner.summary()
    }
}

fn build_variable(
    name: &str,
    def: &VariableDefinition,
    epics: &EpicsConfig,
) -> Result<Variable, ConfigurationError> {
    let binding = epics
        .pvs
        .get(name)
        .filter(|b| b.fields.is_none())
        .ok_or_else(|| ConfigurationError::MissingBinding {
            variable: name.to_string(),
        })?;
    let pvname = epics
        .resolve_pvname(name, binding)
        .ok_or_else(|| ConfigurationError::MissingPvName {
            name: name.to_string(),
        })?;

    if let Some(r) = def.range {
        if r.min > r.max || !r.min.is_finite() || !r.max.is_finite() {
            return Err(ConfigurationError::InvalidRange {
                variable: name.to_string(),
                min: r.min,
                max: r.max,
            });
        }
    }
    if def.kind == VariableKind::Scalar && def.role == Role::Input && def.range.is_none() {
        return Err(ConfigurationError::MissingRange {
            variable: name.to_string(),
        });
    }

    let parent = match (&def.parent, def.axis) {
        (None, _) => None,
        (Some(_), _) if def.kind != VariableKind::Scalar => {
            return Err(ConfigurationError::NonScalarChild {
                variable: name.to_string(),
            })
        }
        (Some(_), None) => {
            return Err(ConfigurationError::MissingAxis {
                variable: name.to_string(),
            })
        }
        (Some(p), Some(axis)) => Some(ParentBinding {
            name: p.clone(),
            axis,
        }),
    };

    let default = def
        .default_value()
        .ok_or_else(|| ConfigurationError::MissingDefault {
            variable: name.to_string(),
        })?;

    let var = Variable {
        name: name.to_string(),
        kind: def.kind,
        role: def.role,
        value: default.clone(),
        default,
        range: def.range,
        parent,
        units: def.units.clone(),
        precision: def.precision,
        address: PvAddress {
            pvname,
            protocol: binding.protocol,
            serve: binding.serve,
        },
    };
    var.validate(&var.default)
        .map_err(|source| ConfigurationError::InvalidDefault {
            variable: name.to_string(),
            source,
        })?;
    Ok(var)
}

fn build_structures(
    variables: &BTreeMap<String, Variable>,
    epics: &EpicsConfig,
) -> Result<Vec<StructureBinding>, ConfigurationError> {
    let mut out = Vec::new();
    for (name, binding) in &epics.pvs {
        let Some(fields) = &binding.fields else {
            continue;
        };
        if !binding.protocol.supports_structures() {
            return Err(ConfigurationError::StructureUnsupported {
                structure: name.clone(),
                protocol: binding.protocol,
            });
        }
        if fields.is_empty() {
            return Err(ConfigurationError::EmptyStructure {
                structure: name.clone(),
            });
        }
        if let Some(field) = fields.iter().find(|f| !variables.contains_key(*f)) {
            return Err(ConfigurationError::UnknownField {
                structure: name.clone(),
                field: field.clone(),
            });
        }
        let pvname =
            epics
                .resolve_pvname(name, binding)
                .ok_or_else(|| ConfigurationError::MissingPvName {
                    name: name.clone(),
                })?;
        out.push(StructureBinding {
            name: name.clone(),
            pvname,
            protocol: binding.protocol,
            fields: fields.clone(),
        });
    }
    Ok(out)
}

fn build_summary(epics: &EpicsConfig) -> Result<Option<SummaryBinding>, ConfigurationError> {
    let Some(record) = &epics.summary else {
        return Ok(None);
    };
    let pvname = record
        .pvname
        .clone()
        .or_else(|| epics.prefix.as_ref().map(|p| format!("{p}:summary")))
        .ok_or_else(|| ConfigurationError::MissingPvName {
            name: "summary".to_string(),
        })?;
    Ok(Some(SummaryBinding {
        pvname,
        protocol: record.protocol,
        record: record.clone(),
    }))
}

fn check_unique_pvnames(
    variables: &BTreeMap<String, Variable>,
    structures: &[StructureBinding],
    summary: Option<&SummaryBinding>,
) -> Result<(), ConfigurationError> {
    let served = variables
        .values()
        .filter(|v| v.address.serve)
        .map(|v| (v.address.protocol, v.address.pvname.as_str()))
        .chain(structures.iter().map(|s| (s.protocol, s.pvname.as_str())))
        .chain(summary.map(|s| (s.protocol, s.pvname.as_str())));

    let mut seen = HashSet::new();
    for (protocol, pvname) in served {
        if !seen.insert((protocol, pvname)) {
            return Err(ConfigurationError::DuplicatePvName {
                pvname: pvname.to_string(),
                protocol,
            });
        }
    }
    Ok(())
}
