//! Field descriptor table.
//!
//! Entities declare their persistent shape once, as a list of [`FieldDef`]s:
//! name, semantic [`FieldType`], optional validator and optional index
//! declaration. Nothing downstream inspects Rust types at runtime.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::uom::Unit;
use crate::value::{FromPrimitive, OpaqueValue, PersistEnum, ToPrimitive};

/// Semantic type of a field, the target of coercion.
#[derive(Debug, Clone)]
pub enum FieldType {
    Text,
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// Any number; integral values stay integral.
    Number,
    Decimal,
    BigInteger,
    Enum(EnumType),
    Locale,
    TimeZone,
    Currency,
    Uuid,
    Timestamp,
    /// Quantity in the declared unit.
    Measured(Unit),
    Array(Box<FieldType>),
    Object(ObjectType),
    /// Boxed form of the inner type: `null` stays `null` instead of
    /// collapsing to the inner type's zero value.
    Nullable(Box<FieldType>),
}

impl FieldType {
    pub fn enumeration<E: PersistEnum>() -> Self {
        FieldType::Enum(EnumType {
            name: E::TYPE_NAME,
            variants: E::variants(),
        })
    }

    pub fn array(element: FieldType) -> Self {
        FieldType::Array(Box::new(element))
    }

    pub fn nullable(inner: FieldType) -> Self {
        FieldType::Nullable(Box::new(inner))
    }

    /// Human readable type name used in coercion errors.
    pub fn type_name(&self) -> String {
        match self {
            FieldType::Text => "text".to_string(),
            FieldType::Bool => "boolean".to_string(),
            FieldType::Byte => "byte".to_string(),
            FieldType::Short => "short".to_string(),
            FieldType::Int => "int".to_string(),
            FieldType::Long => "long".to_string(),
            FieldType::Float => "float".to_string(),
            FieldType::Double => "double".to_string(),
            FieldType::Number => "number".to_string(),
            FieldType::Decimal => "decimal".to_string(),
            FieldType::BigInteger => "big integer".to_string(),
            FieldType::Enum(e) => e.name.to_string(),
            FieldType::Locale => "locale".to_string(),
            FieldType::TimeZone => "time zone".to_string(),
            FieldType::Currency => "currency".to_string(),
            FieldType::Uuid => "uuid".to_string(),
            FieldType::Timestamp => "timestamp".to_string(),
            FieldType::Measured(unit) => format!("measured<{unit}>"),
            FieldType::Array(element) => format!("{}[]", element.type_name()),
            FieldType::Object(object) => object.name.clone(),
            FieldType::Nullable(inner) => format!("{}?", inner.type_name()),
        }
    }
}

/// Declared variants of an enum field.
#[derive(Debug, Clone, Copy)]
pub struct EnumType {
    pub name: &'static str,
    pub variants: &'static [&'static str],
}

impl EnumType {
    pub fn contains(&self, name: &str) -> bool {
        self.variants.contains(&name)
    }
}

/// Parses an opaque object from its storage primitive.
pub type ParseFn = fn(&Value) -> Result<OpaqueValue, String>;

/// How an object-typed field converts from the storage primitive.
#[derive(Debug, Clone)]
pub enum ObjectCodec {
    /// Rebuilt field by field from a JSON object into a nested state.
    Structural(Vec<FieldDef>),
    /// Parsed from a single primitive by the type's own capability.
    Parse(ParseFn),
    /// No conversion capability; coercing a stored value is a configuration error.
    None,
}

/// An object-typed field's type and its conversion capability.
#[derive(Debug, Clone)]
pub struct ObjectType {
    pub name: String,
    pub codec: ObjectCodec,
}

fn parse_opaque<T>(raw: &Value) -> Result<OpaqueValue, String>
where
    T: FromPrimitive + ToPrimitive + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    T::from_primitive(raw).map(OpaqueValue::new)
}

impl ObjectType {
    pub fn structural(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            codec: ObjectCodec::Structural(fields),
        }
    }

    pub fn parsed<T>(name: impl Into<String>) -> Self
    where
        T: FromPrimitive + ToPrimitive + PartialEq + fmt::Debug + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            codec: ObjectCodec::Parse(parse_opaque::<T>),
        }
    }

    pub fn opaque(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            codec: ObjectCodec::None,
        }
    }
}

/// Field-level validation of stored values.
///
/// Validators see the textual form of a non-null stored value.
pub trait FieldValidator: Send + Sync {
    fn validate(&self, value: &str) -> bool;
}

impl<F> FieldValidator for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn validate(&self, value: &str) -> bool {
        self(value)
    }
}

/// Shared handle to a field validator.
#[derive(Clone)]
pub struct Validator(Arc<dyn FieldValidator>);

impl Validator {
    pub fn new(validator: impl FieldValidator + 'static) -> Self {
        Self(Arc::new(validator))
    }

    pub fn validate(&self, value: &str) -> bool {
        self.0.validate(value)
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Validator")
    }
}

/// Kind of index declared on a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKind {
    Primary,
    Secondary,
    /// Secondary index referencing another entity type.
    Foreign { identifies: Option<String> },
}

/// Index declaration attached to a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDecl {
    pub kind: IndexKind,
    /// Additional fields following the declaring field.
    pub multi: Vec<String>,
    /// Generate one index per prefix of `multi` instead of one composite.
    pub cascade: bool,
}

/// One declared field of an entity.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    /// Transient fields are never persisted or coerced.
    pub transient: bool,
    pub index: Option<IndexDecl>,
    pub validator: Option<Validator>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            transient: false,
            index: None,
            validator: None,
        }
    }

    pub fn primary(mut self) -> Self {
        self.index = Some(IndexDecl {
            kind: IndexKind::Primary,
            multi: Vec::new(),
            cascade: false,
        });
        self
    }

    pub fn secondary(mut self) -> Self {
        self.index = Some(IndexDecl {
            kind: IndexKind::Secondary,
            multi: Vec::new(),
            cascade: false,
        });
        self
    }

    /// Composite secondary index over this field followed by `others`.
    pub fn composite(mut self, others: &[&str], cascade: bool) -> Self {
        let kind = self
            .index
            .take()
            .map(|decl| decl.kind)
            .filter(|kind| *kind != IndexKind::Primary)
            .unwrap_or(IndexKind::Secondary);
        self.index = Some(IndexDecl {
            kind,
            multi: others.iter().map(|s| s.to_string()).collect(),
            cascade,
        });
        self
    }

    pub fn foreign(mut self, identifies: Option<&str>) -> Self {
        self.index = Some(IndexDecl {
            kind: IndexKind::Foreign {
                identifies: identifies.map(str::to_string),
            },
            multi: Vec::new(),
            cascade: false,
        });
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub fn validated_by(mut self, validator: impl FieldValidator + 'static) -> Self {
        self.validator = Some(Validator::new(validator));
        self
    }

    pub fn is_primary(&self) -> bool {
        matches!(
            self.index,
            Some(IndexDecl {
                kind: IndexKind::Primary,
                ..
            })
        )
    }
}
