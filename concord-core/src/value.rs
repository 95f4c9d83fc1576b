//! Typed field values.
//!
//! [`FieldValue`] is the closed set of semantic values an entity field can
//! hold once coerced out of the storage primitive. [`State`] is a field-name
//! keyed map of them and is the only thing an [`Entity`](crate::Entity)
//! builds itself from.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{PersistResult, ValidationError};
use crate::uom::Measured;

// ============================================================================
// LOCALE / TIMEZONE / CURRENCY
// ============================================================================

/// A language with an optional country, stored as `language_COUNTRY`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locale {
    language: String,
    country: Option<String>,
}

impl Locale {
    pub fn new(language: impl Into<String>, country: Option<&str>) -> Self {
        Self {
            language: language.into().to_ascii_lowercase(),
            country: country
                .filter(|c| !c.is_empty())
                .map(|c| c.to_ascii_uppercase()),
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn country(&self) -> Option<&str> {
        self.country.as_deref()
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.country {
            Some(country) => write!(f, "{}_{}", self.language, country),
            None => f.write_str(&self.language),
        }
    }
}

impl FromStr for Locale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('_');
        let language = parts.next().unwrap_or_default();
        if language.is_empty() || !language.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!("invalid language in locale {s:?}"));
        }
        Ok(Locale::new(language, parts.next()))
    }
}

/// A time zone identifier such as `UTC` or `America/Chicago`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeZoneId(String);

impl TimeZoneId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TimeZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TimeZoneId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let valid = !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '+' | ':'));
        if valid {
            Ok(TimeZoneId(s.to_string()))
        } else {
            Err(format!("invalid time zone id {s:?}"))
        }
    }
}

/// An ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CurrencyCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() == 3 && s.chars().all(|c| c.is_ascii_uppercase()) {
            Ok(CurrencyCode(s.to_string()))
        } else {
            Err(format!("invalid currency code {s:?}"))
        }
    }
}

// ============================================================================
// ENUM AND OPAQUE CAPABILITIES
// ============================================================================

/// Enums persisted by variant name.
pub trait PersistEnum: Sized + Send + Sync + 'static {
    /// Name of the enum type, used in error messages.
    const TYPE_NAME: &'static str;

    /// Declared variant names, in declaration order.
    fn variants() -> &'static [&'static str];

    fn from_name(name: &str) -> Option<Self>;

    fn name(&self) -> &'static str;
}

/// Renders a domain object to its storage primitive.
///
/// Types without a native primitive form keep the default, which makes the
/// coercion engine fall back to the `Display` text.
pub trait ToPrimitive: fmt::Display {
    fn to_primitive(&self) -> Option<Value> {
        None
    }
}

/// Reconstructs a domain object from a single storage primitive.
pub trait FromPrimitive: Sized {
    fn from_primitive(raw: &Value) -> Result<Self, String>;
}

trait DynOpaque: Any + Send + Sync + fmt::Debug {
    fn primitive(&self) -> Value;
    fn text(&self) -> String;
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn DynOpaque) -> bool;
}

impl<T> DynOpaque for T
where
    T: ToPrimitive + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    fn primitive(&self) -> Value {
        self.to_primitive()
            .unwrap_or_else(|| Value::String(self.to_string()))
    }

    fn text(&self) -> String {
        self.to_string()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn DynOpaque) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }
}

/// A domain object held behind its primitive conversion capability.
#[derive(Clone)]
pub struct OpaqueValue {
    type_name: &'static str,
    inner: Arc<dyn DynOpaque>,
}

impl OpaqueValue {
    pub fn new<T>(value: T) -> Self
    where
        T: ToPrimitive + PartialEq + fmt::Debug + Send + Sync + 'static,
    {
        Self {
            type_name: std::any::type_name::<T>(),
            inner: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref::<T>()
    }

    pub fn to_primitive(&self) -> Value {
        self.inner.primitive()
    }
}

impl fmt::Debug for OpaqueValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl fmt::Display for OpaqueValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.text())
    }
}

impl PartialEq for OpaqueValue {
    fn eq(&self, other: &Self) -> bool {
        self.inner.dyn_eq(other.inner.as_ref())
    }
}

// ============================================================================
// FIELD VALUE
// ============================================================================

/// A coerced, strongly typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Decimal(BigDecimal),
    BigInteger(BigInt),
    Enum {
        type_name: &'static str,
        name: String,
    },
    Locale(Locale),
    TimeZone(TimeZoneId),
    Currency(CurrencyCode),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Measured(Measured),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    BoolArray(Vec<bool>),
    Array(Vec<FieldValue>),
    Record(State),
    Opaque(OpaqueValue),
}

impl FieldValue {
    pub fn enumeration<E: PersistEnum>(value: &E) -> Self {
        FieldValue::Enum {
            type_name: E::TYPE_NAME,
            name: value.name().to_string(),
        }
    }

    pub fn opaque<T>(value: T) -> Self
    where
        T: ToPrimitive + PartialEq + fmt::Debug + Send + Sync + 'static,
    {
        FieldValue::Opaque(OpaqueValue::new(value))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Text(_) => "text",
            FieldValue::Bool(_) => "boolean",
            FieldValue::Byte(_) => "byte",
            FieldValue::Short(_) => "short",
            FieldValue::Int(_) => "int",
            FieldValue::Long(_) => "long",
            FieldValue::Float(_) => "float",
            FieldValue::Double(_) => "double",
            FieldValue::Decimal(_) => "decimal",
            FieldValue::BigInteger(_) => "big integer",
            FieldValue::Enum { .. } => "enum",
            FieldValue::Locale(_) => "locale",
            FieldValue::TimeZone(_) => "time zone",
            FieldValue::Currency(_) => "currency",
            FieldValue::Uuid(_) => "uuid",
            FieldValue::Timestamp(_) => "timestamp",
            FieldValue::Measured(_) => "measured",
            FieldValue::IntArray(_) => "int[]",
            FieldValue::LongArray(_) => "long[]",
            FieldValue::FloatArray(_) => "float[]",
            FieldValue::DoubleArray(_) => "double[]",
            FieldValue::BoolArray(_) => "boolean[]",
            FieldValue::Array(_) => "array",
            FieldValue::Record(_) => "record",
            FieldValue::Opaque(_) => "object",
        }
    }
}

macro_rules! field_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(value: $ty) -> Self {
                    FieldValue::$variant(value)
                }
            }
        )*
    };
}

field_value_from! {
    String => Text,
    bool => Bool,
    i8 => Byte,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    BigDecimal => Decimal,
    BigInt => BigInteger,
    Locale => Locale,
    TimeZoneId => TimeZone,
    CurrencyCode => Currency,
    Uuid => Uuid,
    DateTime<Utc> => Timestamp,
    Measured => Measured,
    Vec<i32> => IntArray,
    Vec<i64> => LongArray,
    Vec<f32> => FloatArray,
    Vec<f64> => DoubleArray,
    Vec<bool> => BoolArray,
    State => Record,
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(values: Vec<String>) -> Self {
        FieldValue::Array(values.into_iter().map(FieldValue::Text).collect())
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

/// Extraction of a Rust value out of a [`FieldValue`].
pub trait FromFieldValue: Sized {
    const EXPECTED: &'static str;

    fn from_field_value(value: FieldValue) -> Result<Self, FieldValue>;
}

macro_rules! from_field_value {
    ($($ty:ty => $variant:ident : $expected:literal),* $(,)?) => {
        $(
            impl FromFieldValue for $ty {
                const EXPECTED: &'static str = $expected;

                fn from_field_value(value: FieldValue) -> Result<Self, FieldValue> {
                    match value {
                        FieldValue::$variant(v) => Ok(v),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

from_field_value! {
    String => Text: "text",
    bool => Bool: "boolean",
    i8 => Byte: "byte",
    i16 => Short: "short",
    i32 => Int: "int",
    i64 => Long: "long",
    f32 => Float: "float",
    f64 => Double: "double",
    BigDecimal => Decimal: "decimal",
    BigInt => BigInteger: "big integer",
    Locale => Locale: "locale",
    TimeZoneId => TimeZone: "time zone",
    CurrencyCode => Currency: "currency",
    Uuid => Uuid: "uuid",
    DateTime<Utc> => Timestamp: "timestamp",
    Measured => Measured: "measured",
    Vec<i32> => IntArray: "int[]",
    Vec<i64> => LongArray: "long[]",
    Vec<f32> => FloatArray: "float[]",
    Vec<f64> => DoubleArray: "double[]",
    Vec<bool> => BoolArray: "boolean[]",
    State => Record: "record",
    OpaqueValue => Opaque: "object",
}

impl FromFieldValue for Vec<String> {
    const EXPECTED: &'static str = "text[]";

    fn from_field_value(value: FieldValue) -> Result<Self, FieldValue> {
        match value {
            FieldValue::Array(items) => {
                if !items.iter().all(|i| matches!(i, FieldValue::Text(_))) {
                    return Err(FieldValue::Array(items));
                }
                Ok(items
                    .into_iter()
                    .filter_map(|i| match i {
                        FieldValue::Text(s) => Some(s),
                        _ => None,
                    })
                    .collect())
            }
            other => Err(other),
        }
    }
}

impl<T: FromFieldValue> FromFieldValue for Option<T> {
    const EXPECTED: &'static str = T::EXPECTED;

    fn from_field_value(value: FieldValue) -> Result<Self, FieldValue> {
        match value {
            FieldValue::Null => Ok(None),
            other => T::from_field_value(other).map(Some),
        }
    }
}

// ============================================================================
// STATE
// ============================================================================

/// Field-name keyed typed values of one entity instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    values: BTreeMap<String, FieldValue>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.values.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
        self.values.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.values.iter()
    }

    /// Overlay every value of `other` onto this state.
    pub fn merge(&mut self, other: State) {
        self.values.extend(other.values);
    }

    /// Take a typed value out of the state.
    ///
    /// A missing field reads as `Null`, so optional targets yield `None`.
    pub fn take<T: FromFieldValue>(&mut self, field: &str) -> PersistResult<T> {
        let value = self.values.remove(field).unwrap_or(FieldValue::Null);
        T::from_field_value(value).map_err(|found| {
            if found.is_null() {
                ValidationError::RequiredFieldMissing {
                    field: field.to_string(),
                }
                .into()
            } else {
                ValidationError::TypeMismatch {
                    field: field.to_string(),
                    expected: T::EXPECTED.to_string(),
                    found: found.kind().to_string(),
                }
                .into()
            }
        })
    }

    /// Take an enum value out of the state by variant name.
    pub fn take_enum<E: PersistEnum>(&mut self, field: &str) -> PersistResult<E> {
        self.take_optional_enum(field)?.ok_or_else(|| {
            ValidationError::RequiredFieldMissing {
                field: field.to_string(),
            }
            .into()
        })
    }

    pub fn take_optional_enum<E: PersistEnum>(&mut self, field: &str) -> PersistResult<Option<E>> {
        match self.values.remove(field).unwrap_or(FieldValue::Null) {
            FieldValue::Null => Ok(None),
            FieldValue::Enum { name, .. } | FieldValue::Text(name) => E::from_name(&name)
                .map(Some)
                .ok_or_else(|| {
                    ValidationError::TypeMismatch {
                        field: field.to_string(),
                        expected: E::TYPE_NAME.to_string(),
                        found: name,
                    }
                    .into()
                }),
            other => Err(ValidationError::TypeMismatch {
                field: field.to_string(),
                expected: E::TYPE_NAME.to_string(),
                found: other.kind().to_string(),
            }
            .into()),
        }
    }

    /// Take a domain object reconstructed through its parse capability.
    pub fn take_opaque<T: Clone + 'static>(&mut self, field: &str) -> PersistResult<Option<T>> {
        let opaque: Option<OpaqueValue> = self.take(field)?;
        match opaque {
            None => Ok(None),
            Some(value) => value.downcast_ref::<T>().cloned().map(Some).ok_or_else(|| {
                ValidationError::TypeMismatch {
                    field: field.to_string(),
                    expected: std::any::type_name::<T>().to_string(),
                    found: value.type_name().to_string(),
                }
                .into()
            }),
        }
    }
}

impl FromIterator<(String, FieldValue)> for State {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for State {
    type Item = (String, FieldValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, FieldValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistError;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Color {
        Red,
        Green,
    }

    impl PersistEnum for Color {
        const TYPE_NAME: &'static str = "Color";

        fn variants() -> &'static [&'static str] {
            &["RED", "GREEN"]
        }

        fn from_name(name: &str) -> Option<Self> {
            match name {
                "RED" => Some(Color::Red),
                "GREEN" => Some(Color::Green),
                _ => None,
            }
        }

        fn name(&self) -> &'static str {
            match self {
                Color::Red => "RED",
                Color::Green => "GREEN",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Cidr(String);

    impl fmt::Display for Cidr {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl ToPrimitive for Cidr {}

    #[test]
    fn test_locale_parse_and_display() {
        let locale: Locale = "en_us".parse().unwrap();
        assert_eq!(locale.language(), "en");
        assert_eq!(locale.country(), Some("US"));
        assert_eq!(locale.to_string(), "en_US");

        let bare: Locale = "fr".parse().unwrap();
        assert_eq!(bare.to_string(), "fr");
        assert!("".parse::<Locale>().is_err());
    }

    #[test]
    fn test_currency_code_validation() {
        assert!("USD".parse::<CurrencyCode>().is_ok());
        assert!("usd".parse::<CurrencyCode>().is_err());
        assert!("DOLLARS".parse::<CurrencyCode>().is_err());
    }

    #[test]
    fn test_state_take_typed_values() {
        let mut state = State::new()
            .with("name", "web-1")
            .with("cpus", 4i32)
            .with("owner", FieldValue::Null)
            .with("color", FieldValue::enumeration(&Color::Green));

        let name: String = state.take("name").unwrap();
        let cpus: i32 = state.take("cpus").unwrap();
        let owner: Option<String> = state.take("owner").unwrap();
        let color: Color = state.take_enum("color").unwrap();

        assert_eq!(name, "web-1");
        assert_eq!(cpus, 4);
        assert_eq!(owner, None);
        assert_eq!(color, Color::Green);
    }

    #[test]
    fn test_state_take_reports_type_mismatch_and_missing() {
        let mut state = State::new().with("cpus", "four");
        let err = state.take::<i32>("cpus").unwrap_err();
        assert!(matches!(
            err,
            PersistError::Validation(ValidationError::TypeMismatch { .. })
        ));

        let err = state.take::<String>("absent").unwrap_err();
        assert!(matches!(
            err,
            PersistError::Validation(ValidationError::RequiredFieldMissing { .. })
        ));
    }

    #[test]
    fn test_opaque_equality_and_text_fallback() {
        let a = OpaqueValue::new(Cidr("10.0.0.0/8".to_string()));
        let b = OpaqueValue::new(Cidr("10.0.0.0/8".to_string()));
        let c = OpaqueValue::new(Cidr("192.168.0.0/16".to_string()));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_primitive(), Value::String("10.0.0.0/8".to_string()));
        assert_eq!(
            a.downcast_ref::<Cidr>(),
            Some(&Cidr("10.0.0.0/8".to_string()))
        );
    }
}
