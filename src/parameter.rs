//! Module parameters.
//!
//! A [`Parameter`] stores its value, default and range as one variant of
//! [`ParamData`]; updates arrive as a [`ParamValue`] plus the [`RangeType`]
//! they target. Applying a value of the wrong kind is a checked
//! [`ParameterError::TypeMismatch`], never a silent no-op.

use serde::{Deserialize, Serialize};

use crate::error::ParameterError;
use crate::id::Id;

/// Maximum number of components of a vector parameter.
pub const MAX_DIMENSION: usize = 4;

/// Declared kind of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamType {
    Unknown,
    Float,
    Integer,
    Vector,
    IntVector,
    String,
    Invalid,
}

impl ParamType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => ParamType::Unknown,
            1 => ParamType::Float,
            2 => ParamType::Integer,
            3 => ParamType::Vector,
            4 => ParamType::IntVector,
            5 => ParamType::String,
            6 => ParamType::Invalid,
            _ => return None,
        })
    }
}

/// How a UI should present a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Presentation {
    #[default]
    Generic,
    Filename,
    ExistingFilename,
    Directory,
    ExistingDirectory,
    NewPathname,
    Boolean,
    Choice,
    Slider,
    Color,
}

impl Presentation {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Presentation::Generic,
            1 => Presentation::Filename,
            2 => Presentation::ExistingFilename,
            3 => Presentation::Directory,
            4 => Presentation::ExistingDirectory,
            5 => Presentation::NewPathname,
            6 => Presentation::Boolean,
            7 => Presentation::Choice,
            8 => Presentation::Slider,
            9 => Presentation::Color,
            _ => return None,
        })
    }
}

/// Which part of a parameter an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RangeType {
    Minimum,
    #[default]
    Value,
    Maximum,
    Other,
}

impl RangeType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => RangeType::Minimum,
            1 => RangeType::Value,
            2 => RangeType::Maximum,
            3 => RangeType::Other,
            _ => return None,
        })
    }
}

/// Fixed-capacity vector of up to [`MAX_DIMENSION`] components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamVector<T> {
    dim: u8,
    values: [T; MAX_DIMENSION],
}

impl<T: Copy + Default> ParamVector<T> {
    /// Build from a slice; components beyond [`MAX_DIMENSION`] are dropped.
    pub fn new(values: &[T]) -> Self {
        let dim = values.len().min(MAX_DIMENSION);
        let mut out = [T::default(); MAX_DIMENSION];
        out[..dim].copy_from_slice(&values[..dim]);
        Self {
            dim: dim as u8,
            values: out,
        }
    }

    fn filled(dim: usize, v: T) -> Self {
        let dim = dim.min(MAX_DIMENSION);
        let mut out = [T::default(); MAX_DIMENSION];
        out[..dim].iter_mut().for_each(|c| *c = v);
        Self {
            dim: dim as u8,
            values: out,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim as usize
    }

    pub fn as_slice(&self) -> &[T] {
        &self.values[..self.dim()]
    }

    /// All components, including unused trailing slots.
    pub fn raw(&self) -> &[T; MAX_DIMENSION] {
        &self.values
    }

    pub(crate) fn from_raw(dim: usize, values: [T; MAX_DIMENSION]) -> Self {
        Self {
            dim: dim.min(MAX_DIMENSION) as u8,
            values,
        }
    }
}

impl<T: PartialOrd + Copy + Default> ParamVector<T> {
    fn within(&self, min: &Self, max: &Self) -> bool {
        self.as_slice().iter().enumerate().all(|(i, v)| {
            let lo = min.as_slice().get(i);
            let hi = max.as_slice().get(i);
            lo.map_or(true, |lo| v >= lo) && hi.map_or(true, |hi| v <= hi)
        })
    }
}

/// A concrete value carried by an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
    Vector(ParamVector<f64>),
    IntVector(ParamVector<i64>),
    String(String),
}

impl ParamValue {
    pub fn param_type(&self) -> ParamType {
        match self {
            ParamValue::Integer(_) => ParamType::Integer,
            ParamValue::Float(_) => ParamType::Float,
            ParamValue::Vector(_) => ParamType::Vector,
            ParamValue::IntVector(_) => ParamType::IntVector,
            ParamValue::String(_) => ParamType::String,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Integer(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::String(v.to_string())
    }
}

/// Value, default and bounds of one numeric kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranged<T> {
    pub value: T,
    pub default: T,
    pub minimum: T,
    pub maximum: T,
}

/// Storage of a parameter, one variant per declared kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamData {
    Integer(Ranged<i64>),
    Float(Ranged<f64>),
    Vector(Ranged<ParamVector<f64>>),
    IntVector(Ranged<ParamVector<i64>>),
    String { value: String, default: String },
}

impl ParamData {
    /// Unbounded storage for `ty`, or `None` for kinds that cannot hold values.
    pub fn for_type(ty: ParamType) -> Option<Self> {
        Some(match ty {
            ParamType::Integer => ParamData::Integer(Ranged {
                value: 0,
                default: 0,
                minimum: i64::MIN,
                maximum: i64::MAX,
            }),
            ParamType::Float => ParamData::Float(Ranged {
                value: 0.0,
                default: 0.0,
                minimum: f64::MIN,
                maximum: f64::MAX,
            }),
            ParamType::Vector => ParamData::Vector(Ranged {
                value: ParamVector::filled(MAX_DIMENSION, 0.0),
                default: ParamVector::filled(MAX_DIMENSION, 0.0),
                minimum: ParamVector::filled(MAX_DIMENSION, f64::MIN),
                maximum: ParamVector::filled(MAX_DIMENSION, f64::MAX),
            }),
            ParamType::IntVector => ParamData::IntVector(Ranged {
                value: ParamVector::filled(MAX_DIMENSION, 0),
                default: ParamVector::filled(MAX_DIMENSION, 0),
                minimum: ParamVector::filled(MAX_DIMENSION, i64::MIN),
                maximum: ParamVector::filled(MAX_DIMENSION, i64::MAX),
            }),
            ParamType::String => ParamData::String {
                value: String::new(),
                default: String::new(),
            },
            ParamType::Unknown | ParamType::Invalid => return None,
        })
    }

    pub fn param_type(&self) -> ParamType {
        match self {
            ParamData::Integer(_) => ParamType::Integer,
            ParamData::Float(_) => ParamType::Float,
            ParamData::Vector(_) => ParamType::Vector,
            ParamData::IntVector(_) => ParamType::IntVector,
            ParamData::String { .. } => ParamType::String,
        }
    }
}

fn set_ranged<T: Clone>(
    r: &mut Ranged<T>,
    v: &T,
    range: RangeType,
    init: bool,
    within: impl Fn(&T, &T, &T) -> bool,
) -> Option<bool> {
    match range {
        RangeType::Value => {
            if init {
                r.default = v.clone();
                r.value = v.clone();
                Some(true)
            } else if within(v, &r.minimum, &r.maximum) {
                r.value = v.clone();
                Some(true)
            } else {
                Some(false)
            }
        }
        RangeType::Minimum => {
            r.minimum = v.clone();
            Some(true)
        }
        RangeType::Maximum => {
            r.maximum = v.clone();
            Some(true)
        }
        RangeType::Other => None,
    }
}

/// A parameter as tracked for one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub module: Id,
    pub name: String,
    pub description: String,
    pub group: String,
    pub presentation: Presentation,
    pub choices: Vec<String>,
    pub read_only: bool,
    data: ParamData,
}

impl Parameter {
    pub fn new(
        module: Id,
        name: impl Into<String>,
        ty: ParamType,
        presentation: Presentation,
    ) -> Option<Self> {
        Some(Self {
            module,
            name: name.into(),
            description: String::new(),
            group: String::new(),
            presentation,
            choices: Vec::new(),
            read_only: false,
            data: ParamData::for_type(ty)?,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn param_type(&self) -> ParamType {
        self.data.param_type()
    }

    pub fn data(&self) -> &ParamData {
        &self.data
    }

    pub fn value(&self) -> ParamValue {
        match &self.data {
            ParamData::Integer(r) => ParamValue::Integer(r.value),
            ParamData::Float(r) => ParamValue::Float(r.value),
            ParamData::Vector(r) => ParamValue::Vector(r.value),
            ParamData::IntVector(r) => ParamValue::IntVector(r.value),
            ParamData::String { value, .. } => ParamValue::String(value.clone()),
        }
    }

    pub fn default_value(&self) -> ParamValue {
        match &self.data {
            ParamData::Integer(r) => ParamValue::Integer(r.default),
            ParamData::Float(r) => ParamValue::Float(r.default),
            ParamData::Vector(r) => ParamValue::Vector(r.default),
            ParamData::IntVector(r) => ParamValue::IntVector(r.default),
            ParamData::String { default, .. } => ParamValue::String(default.clone()),
        }
    }

    /// Lower bound, for kinds that have one.
    pub fn minimum(&self) -> Option<ParamValue> {
        match &self.data {
            ParamData::Integer(r) => Some(ParamValue::Integer(r.minimum)),
            ParamData::Float(r) => Some(ParamValue::Float(r.minimum)),
            ParamData::Vector(r) => Some(ParamValue::Vector(r.minimum)),
            ParamData::IntVector(r) => Some(ParamValue::IntVector(r.minimum)),
            ParamData::String { .. } => None,
        }
    }

    /// Upper bound, for kinds that have one.
    pub fn maximum(&self) -> Option<ParamValue> {
        match &self.data {
            ParamData::Integer(r) => Some(ParamValue::Integer(r.maximum)),
            ParamData::Float(r) => Some(ParamValue::Float(r.maximum)),
            ParamData::Vector(r) => Some(ParamValue::Vector(r.maximum)),
            ParamData::IntVector(r) => Some(ParamValue::IntVector(r.maximum)),
            ParamData::String { .. } => None,
        }
    }

    pub fn is_default(&self) -> bool {
        self.value() == self.default_value()
    }

    /// Apply an update. `init` sets the default along with the value and
    /// bypasses the range check. Out-of-range values are rejected without
    /// changing the stored value.
    pub fn apply(
        &mut self,
        value: &ParamValue,
        range: RangeType,
        init: bool,
    ) -> Result<(), ParameterError> {
        let name = self.name.clone();
        let stored = self.param_type();
        let applied = match (&mut self.data, value) {
            (ParamData::Integer(r), ParamValue::Integer(v)) => {
                set_ranged(r, v, range, init, |v, lo, hi| v >= lo && v <= hi)
            }
            (ParamData::Float(r), ParamValue::Float(v)) => {
                set_ranged(r, v, range, init, |v, lo, hi| v >= lo && v <= hi)
            }
            (ParamData::Vector(r), ParamValue::Vector(v)) => {
                set_ranged(r, v, range, init, |v, lo, hi| v.within(lo, hi))
            }
            (ParamData::IntVector(r), ParamValue::IntVector(v)) => {
                set_ranged(r, v, range, init, |v, lo, hi| v.within(lo, hi))
            }
            (ParamData::String { value: cur, default }, ParamValue::String(v)) => match range {
                RangeType::Value => {
                    if init {
                        *default = v.clone();
                    }
                    *cur = v.clone();
                    Some(true)
                }
                _ => None,
            },
            (_, other) => {
                return Err(ParameterError::TypeMismatch {
                    name,
                    stored,
                    declared: other.param_type(),
                })
            }
        };
        match applied {
            Some(true) => Ok(()),
            Some(false) => Err(ParameterError::OutOfRange(name)),
            None => Err(ParameterError::UnsupportedRange { name, range }),
        }
    }

    /// Replace the choice labels. Only integer and string parameters
    /// presented as a choice accept them.
    pub fn set_choices(&mut self, choices: Vec<String>) -> Result<(), ParameterError> {
        let choosable = matches!(self.param_type(), ParamType::Integer | ParamType::String);
        if !choosable || self.presentation != Presentation::Choice {
            return Err(ParameterError::NotAChoice(self.name.clone()));
        }
        self.choices = choices;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_param() -> Parameter {
        Parameter::new(Id(7), "x", ParamType::Integer, Presentation::Generic).unwrap()
    }

    #[test]
    fn test_unknown_kinds_have_no_storage() {
        assert!(Parameter::new(Id(1), "p", ParamType::Unknown, Presentation::Generic).is_none());
        assert!(Parameter::new(Id(1), "p", ParamType::Invalid, Presentation::Generic).is_none());
    }

    #[test]
    fn test_integer_value_and_range() {
        let mut p = int_param();
        p.apply(&ParamValue::Integer(5), RangeType::Value, true).unwrap();
        assert_eq!(p.default_value(), ParamValue::Integer(5));
        p.apply(&ParamValue::Integer(0), RangeType::Minimum, false).unwrap();
        p.apply(&ParamValue::Integer(10), RangeType::Maximum, false).unwrap();
        p.apply(&ParamValue::Integer(42), RangeType::Value, false)
            .unwrap_err();
        assert_eq!(p.value().as_int(), Some(5));
        p.apply(&ParamValue::Integer(9), RangeType::Value, false).unwrap();
        assert_eq!(p.value().as_int(), Some(9));
        assert!(!p.is_default());
    }

    #[test]
    fn test_type_mismatch_leaves_value() {
        let mut p = int_param();
        p.apply(&ParamValue::Integer(3), RangeType::Value, false).unwrap();
        let err = p
            .apply(&ParamValue::Float(3.5), RangeType::Value, false)
            .unwrap_err();
        assert_eq!(
            err,
            ParameterError::TypeMismatch {
                name: "x".into(),
                stored: ParamType::Integer,
                declared: ParamType::Float,
            }
        );
        assert_eq!(p.value(), ParamValue::Integer(3));
    }

    #[test]
    fn test_strings_only_take_values() {
        let mut p = Parameter::new(Id(1), "file", ParamType::String, Presentation::Filename).unwrap();
        p.apply(&"a.vtk".into(), RangeType::Value, false).unwrap();
        assert_eq!(p.value().as_str(), Some("a.vtk"));
        assert!(matches!(
            p.apply(&"z".into(), RangeType::Maximum, false),
            Err(ParameterError::UnsupportedRange { .. })
        ));
        assert!(p.minimum().is_none());
    }

    #[test]
    fn test_vector_components_checked() {
        let mut p = Parameter::new(Id(1), "origin", ParamType::Vector, Presentation::Generic).unwrap();
        let lo = ParamVector::new(&[0.0, 0.0, 0.0]);
        p.apply(&ParamValue::Vector(lo), RangeType::Minimum, false).unwrap();
        let ok = ParamVector::new(&[1.0, 2.0, 3.0]);
        p.apply(&ParamValue::Vector(ok), RangeType::Value, false).unwrap();
        let bad = ParamVector::new(&[1.0, -2.0, 3.0]);
        assert!(p.apply(&ParamValue::Vector(bad), RangeType::Value, false).is_err());
        assert_eq!(p.value(), ParamValue::Vector(ok));
    }

    #[test]
    fn test_choices_need_choice_presentation() {
        let mut p = int_param();
        assert!(p.set_choices(vec!["a".into()]).is_err());
        p.presentation = Presentation::Choice;
        p.set_choices(vec!["a".into(), "b".into()]).unwrap();
        assert_eq!(p.choices.len(), 2);
        let mut f = Parameter::new(Id(1), "f", ParamType::Float, Presentation::Choice).unwrap();
        assert!(f.set_choices(vec![]).is_err());
    }

    #[test]
    fn test_vector_truncates_dimension() {
        let v = ParamVector::new(&[1i64, 2, 3, 4, 5, 6]);
        assert_eq!(v.dim(), MAX_DIMENSION);
        assert_eq!(v.as_slice(), &[1, 2, 3, 4]);
    }
}
