//! Value coercion engine.
//!
//! [`coerce`] converts a storage primitive into the typed value of a field
//! and [`to_primitive`] performs the inverse. Both are pure and
//! deterministic. Unmappable input is always an error, never a silent
//! default; the one exception is `null` for a non-nullable numeric or
//! boolean target, which becomes that type's zero value.

use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, SecondsFormat, Utc};
use num_bigint::BigInt;
use serde_json::{Number, Value};
use uuid::Uuid;

use crate::error::{CoercionError, ConfigError, PersistResult};
use crate::field::{FieldType, ObjectCodec, ObjectType};
use crate::uom::{Measured, Unit};
use crate::value::{CurrencyCode, FieldValue, Locale, State, TimeZoneId};

/// Convert a stored value into the typed value of `field`.
pub fn coerce(field: &str, raw: &Value, target: &FieldType) -> PersistResult<FieldValue> {
    let value = match target {
        FieldType::Nullable(inner) => {
            if raw.is_null() {
                FieldValue::Null
            } else {
                coerce(field, raw, inner)?
            }
        }
        FieldType::Text => match raw {
            Value::Null => FieldValue::Null,
            other => FieldValue::Text(raw_text(other)),
        },
        FieldType::Enum(enum_type) => match raw {
            Value::Null => FieldValue::Null,
            other => {
                let name = raw_text(other);
                if !enum_type.contains(&name) {
                    return Err(CoercionError::UnknownEnumName {
                        field: field.to_string(),
                        target: enum_type.name.to_string(),
                        value: name,
                    }
                    .into());
                }
                FieldValue::Enum {
                    type_name: enum_type.name,
                    name,
                }
            }
        },
        FieldType::Bool => FieldValue::Bool(to_bool(field, raw, target)?),
        FieldType::Byte => FieldValue::Byte(narrow(field, raw, target)?),
        FieldType::Short => FieldValue::Short(narrow(field, raw, target)?),
        FieldType::Int => FieldValue::Int(narrow(field, raw, target)?),
        FieldType::Long => FieldValue::Long(to_i64(field, raw, target)?.unwrap_or(0)),
        FieldType::Float => FieldValue::Float(to_f64(field, raw, target)?.unwrap_or(0.0) as f32),
        FieldType::Double => FieldValue::Double(to_f64(field, raw, target)?.unwrap_or(0.0)),
        FieldType::Number => to_number(field, raw, target)?,
        FieldType::Decimal => to_decimal(field, raw, target)?.map_or(FieldValue::Null, FieldValue::Decimal),
        FieldType::BigInteger => {
            to_big_integer(field, raw, target)?.map_or(FieldValue::Null, FieldValue::BigInteger)
        }
        FieldType::Locale => {
            parse_text::<Locale>(field, raw, target)?.map_or(FieldValue::Null, FieldValue::Locale)
        }
        FieldType::TimeZone => {
            parse_text::<TimeZoneId>(field, raw, target)?.map_or(FieldValue::Null, FieldValue::TimeZone)
        }
        FieldType::Currency => {
            parse_text::<CurrencyCode>(field, raw, target)?.map_or(FieldValue::Null, FieldValue::Currency)
        }
        FieldType::Uuid => parse_text::<Uuid>(field, raw, target)?.map_or(FieldValue::Null, FieldValue::Uuid),
        FieldType::Timestamp => {
            to_timestamp(field, raw, target)?.map_or(FieldValue::Null, FieldValue::Timestamp)
        }
        FieldType::Measured(unit) => {
            to_measured(field, raw, *unit, target)?.map_or(FieldValue::Null, FieldValue::Measured)
        }
        FieldType::Array(element) => to_array(field, raw, element, target)?,
        FieldType::Object(object) => to_object(field, raw, object, target)?,
    };
    Ok(value)
}

/// Render a typed value as its storage primitive.
///
/// Arbitrary precision numbers and identifier types render as strings,
/// enums by name, measured quantities as the bare number in their own unit,
/// collections as arrays and records as objects. Non-finite floats render
/// as `null`.
pub fn to_primitive(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Text(s) => Value::String(s.clone()),
        FieldValue::Bool(b) => Value::Bool(*b),
        FieldValue::Byte(v) => Value::from(*v),
        FieldValue::Short(v) => Value::from(*v),
        FieldValue::Int(v) => Value::from(*v),
        FieldValue::Long(v) => Value::from(*v),
        FieldValue::Float(v) => float(f64::from(*v)),
        FieldValue::Double(v) => float(*v),
        FieldValue::Decimal(d) => Value::String(d.to_string()),
        FieldValue::BigInteger(i) => Value::String(i.to_string()),
        FieldValue::Enum { name, .. } => Value::String(name.clone()),
        FieldValue::Locale(l) => Value::String(l.to_string()),
        FieldValue::TimeZone(tz) => Value::String(tz.to_string()),
        FieldValue::Currency(c) => Value::String(c.to_string()),
        FieldValue::Uuid(u) => Value::String(u.to_string()),
        FieldValue::Timestamp(t) => Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        FieldValue::Measured(m) => float(m.value()),
        FieldValue::IntArray(v) => Value::Array(v.iter().map(|i| Value::from(*i)).collect()),
        FieldValue::LongArray(v) => Value::Array(v.iter().map(|i| Value::from(*i)).collect()),
        FieldValue::FloatArray(v) => Value::Array(v.iter().map(|f| float(f64::from(*f))).collect()),
        FieldValue::DoubleArray(v) => Value::Array(v.iter().map(|f| float(*f)).collect()),
        FieldValue::BoolArray(v) => Value::Array(v.iter().map(|b| Value::Bool(*b)).collect()),
        FieldValue::Array(items) => Value::Array(items.iter().map(to_primitive).collect()),
        FieldValue::Record(state) => Value::Object(
            state
                .iter()
                .map(|(name, v)| (name.clone(), to_primitive(v)))
                .collect(),
        ),
        FieldValue::Opaque(o) => o.to_primitive(),
    }
}

/// Re-express a typed value the way `target` holds it.
///
/// Measured quantities convert into the target unit; everything else goes
/// through its storage primitive and back. `null` stays `null`.
pub fn normalize(field: &str, value: &FieldValue, target: &FieldType) -> PersistResult<FieldValue> {
    match (value, target) {
        (FieldValue::Null, _) => Ok(FieldValue::Null),
        (_, FieldType::Nullable(inner)) => normalize(field, value, inner),
        (FieldValue::Measured(m), FieldType::Measured(unit)) => m
            .convert_to(*unit)
            .map(FieldValue::Measured)
            .ok_or_else(|| {
                CoercionError::UnitMismatch {
                    field: field.to_string(),
                    from: m.unit().to_string(),
                    to: unit.to_string(),
                }
                .into()
            }),
        (
            FieldValue::Opaque(_),
            FieldType::Object(ObjectType {
                codec: ObjectCodec::None,
                ..
            }),
        ) => Ok(value.clone()),
        _ => coerce(field, &to_primitive(value), target),
    }
}

/// Text of a typed value as it appears in an index key value.
///
/// `None` for `null`: a record with a null index field has no value under
/// that index.
pub fn key_text(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Null => None,
        FieldValue::Text(s) => Some(s.clone()),
        FieldValue::Enum { name, .. } => Some(name.clone()),
        // Scale must not split one number across key values.
        FieldValue::Decimal(d) => Some(d.normalized().to_string()),
        other => match to_primitive(other) {
            Value::Null => None,
            Value::String(s) => Some(s),
            primitive => Some(primitive.to_string()),
        },
    }
}

/// Textual form of a stored value: strings unquoted, everything else as JSON.
pub fn raw_text(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn float(v: f64) -> Value {
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

fn unmappable(field: &str, target: &FieldType, raw: &Value) -> CoercionError {
    CoercionError::Unmappable {
        field: field.to_string(),
        target: target.type_name(),
        value: raw_text(raw),
    }
}

fn parse_error(field: &str, target: &FieldType, raw: &Value, reason: impl fmt::Display) -> CoercionError {
    CoercionError::Parse {
        field: field.to_string(),
        target: target.type_name(),
        value: raw_text(raw),
        reason: reason.to_string(),
    }
}

fn to_bool(field: &str, raw: &Value, target: &FieldType) -> PersistResult<bool> {
    match raw {
        Value::Null => Ok(false),
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f.trunc() != 0.0)),
        Value::String(s) => {
            let s = s.trim();
            Ok(s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("y"))
        }
        _ => Err(unmappable(field, target, raw).into()),
    }
}

/// Integral value of a stored primitive; fractional numbers truncate.
fn to_i64(field: &str, raw: &Value, target: &FieldType) -> PersistResult<Option<i64>> {
    match raw {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(i64::from(*b))),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                return Ok(Some(v));
            }
            match n.as_f64().map(f64::trunc) {
                Some(f) if f >= i64::MIN as f64 && f < i64::MAX as f64 => Ok(Some(f as i64)),
                _ => Err(unmappable(field, target, raw).into()),
            }
        }
        Value::String(s) => {
            let v = s
                .trim()
                .parse::<i64>()
                .map_err(|e| parse_error(field, target, raw, e))?;
            Ok(Some(v))
        }
        _ => Err(unmappable(field, target, raw).into()),
    }
}

fn narrow<T>(field: &str, raw: &Value, target: &FieldType) -> PersistResult<T>
where
    T: TryFrom<i64> + Default,
{
    match to_i64(field, raw, target)? {
        None => Ok(T::default()),
        Some(v) => Ok(T::try_from(v).map_err(|_| unmappable(field, target, raw))?),
    }
}

fn to_f64(field: &str, raw: &Value, target: &FieldType) -> PersistResult<Option<f64>> {
    match raw {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(if *b { 1.0 } else { 0.0 })),
        Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| unmappable(field, target, raw).into()),
        Value::String(s) => {
            let v = s
                .trim()
                .parse::<f64>()
                .map_err(|e| parse_error(field, target, raw, e))?;
            Ok(Some(v))
        }
        _ => Err(unmappable(field, target, raw).into()),
    }
}

/// Untyped numbers keep integral values integral.
fn to_number(field: &str, raw: &Value, target: &FieldType) -> PersistResult<FieldValue> {
    match raw {
        Value::Null => Ok(FieldValue::Null),
        Value::Bool(b) => Ok(FieldValue::Long(i64::from(*b))),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(v), _) => Ok(FieldValue::Long(v)),
            (None, Some(f)) => Ok(FieldValue::Double(f)),
            (None, None) => Err(unmappable(field, target, raw).into()),
        },
        Value::String(s) => {
            let s = s.trim();
            if let Ok(v) = s.parse::<i64>() {
                return Ok(FieldValue::Long(v));
            }
            let f = s
                .parse::<f64>()
                .map_err(|e| parse_error(field, target, raw, e))?;
            Ok(FieldValue::Double(f))
        }
        _ => Err(unmappable(field, target, raw).into()),
    }
}

fn to_decimal(field: &str, raw: &Value, target: &FieldType) -> PersistResult<Option<BigDecimal>> {
    let text = match raw {
        Value::Null => return Ok(None),
        Value::Bool(b) => return Ok(Some(BigDecimal::from(i64::from(*b)))),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return Err(unmappable(field, target, raw).into()),
    };
    let decimal = BigDecimal::from_str(&text).map_err(|e| parse_error(field, target, raw, e))?;
    Ok(Some(decimal))
}

fn to_big_integer(field: &str, raw: &Value, target: &FieldType) -> PersistResult<Option<BigInt>> {
    match raw {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(BigInt::from(i64::from(*b)))),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                return Ok(Some(BigInt::from(v)));
            }
            if let Some(v) = n.as_u64() {
                return Ok(Some(BigInt::from(v)));
            }
            // Fractional: truncate toward zero.
            let decimal = BigDecimal::from_str(&n.to_string())
                .map_err(|e| parse_error(field, target, raw, e))?;
            let (integer, _) = decimal.with_scale(0).into_bigint_and_exponent();
            Ok(Some(integer))
        }
        Value::String(s) => {
            let v = BigInt::from_str(s.trim()).map_err(|e| parse_error(field, target, raw, e))?;
            Ok(Some(v))
        }
        _ => Err(unmappable(field, target, raw).into()),
    }
}

/// Identifier types parse from their canonical string form only.
fn parse_text<T>(field: &str, raw: &Value, target: &FieldType) -> PersistResult<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(
            s.parse::<T>().map_err(|e| parse_error(field, target, raw, e))?,
        )),
        _ => Err(unmappable(field, target, raw).into()),
    }
}

/// Strings are RFC 3339; numbers are milliseconds since the epoch.
fn to_timestamp(field: &str, raw: &Value, target: &FieldType) -> PersistResult<Option<DateTime<Utc>>> {
    match raw {
        Value::Null => Ok(None),
        Value::String(s) => {
            let parsed =
                DateTime::parse_from_rfc3339(s.trim()).map_err(|e| parse_error(field, target, raw, e))?;
            Ok(Some(parsed.with_timezone(&Utc)))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(Some)
            .ok_or_else(|| unmappable(field, target, raw).into()),
        _ => Err(unmappable(field, target, raw).into()),
    }
}

/// A bare number is taken in the declared unit. A quantity carrying its own
/// unit, as text (`"2GB"`) or as `{"value": 2, "unit": "GB"}`, converts into
/// the declared unit.
fn to_measured(field: &str, raw: &Value, unit: Unit, target: &FieldType) -> PersistResult<Option<Measured>> {
    let stored = match raw {
        Value::Null => return Ok(None),
        Value::Number(n) => {
            let v = n
                .as_f64()
                .ok_or_else(|| unmappable(field, target, raw))?;
            return Ok(Some(Measured::new(v, unit)));
        }
        Value::String(s) => {
            if let Ok(v) = s.trim().parse::<f64>() {
                return Ok(Some(Measured::new(v, unit)));
            }
            s.parse::<Measured>()
                .map_err(|e| parse_error(field, target, raw, e))?
        }
        Value::Object(map) => {
            let value = map.get("value").and_then(Value::as_f64);
            let stored_unit = map
                .get("unit")
                .and_then(Value::as_str)
                .and_then(Unit::from_symbol);
            match (value, stored_unit) {
                (Some(v), Some(u)) => Measured::new(v, u),
                _ => return Err(unmappable(field, target, raw).into()),
            }
        }
        _ => return Err(unmappable(field, target, raw).into()),
    };
    let converted = stored
        .convert_to(unit)
        .ok_or_else(|| CoercionError::UnitMismatch {
            field: field.to_string(),
            from: stored.unit().to_string(),
            to: unit.to_string(),
        })?;
    Ok(Some(converted))
}

/// Element-wise; primitive element types keep their specialized arrays.
fn to_array(field: &str, raw: &Value, element: &FieldType, target: &FieldType) -> PersistResult<FieldValue> {
    let items: &[Value] = match raw {
        Value::Null => &[],
        Value::Array(items) => items,
        _ => return Err(unmappable(field, target, raw).into()),
    };
    let value = match element {
        FieldType::Int => FieldValue::IntArray(
            items
                .iter()
                .map(|item| narrow::<i32>(field, item, element))
                .collect::<PersistResult<_>>()?,
        ),
        FieldType::Long => FieldValue::LongArray(
            items
                .iter()
                .map(|item| to_i64(field, item, element).map(|v| v.unwrap_or(0)))
                .collect::<PersistResult<_>>()?,
        ),
        FieldType::Float => FieldValue::FloatArray(
            items
                .iter()
                .map(|item| to_f64(field, item, element).map(|v| v.unwrap_or(0.0) as f32))
                .collect::<PersistResult<_>>()?,
        ),
        FieldType::Double => FieldValue::DoubleArray(
            items
                .iter()
                .map(|item| to_f64(field, item, element).map(|v| v.unwrap_or(0.0)))
                .collect::<PersistResult<_>>()?,
        ),
        FieldType::Bool => FieldValue::BoolArray(
            items
                .iter()
                .map(|item| to_bool(field, item, element))
                .collect::<PersistResult<_>>()?,
        ),
        _ => FieldValue::Array(
            items
                .iter()
                .map(|item| coerce(field, item, element))
                .collect::<PersistResult<_>>()?,
        ),
    };
    Ok(value)
}

fn to_object(field: &str, raw: &Value, object: &ObjectType, target: &FieldType) -> PersistResult<FieldValue> {
    if raw.is_null() {
        return Ok(FieldValue::Null);
    }
    match &object.codec {
        ObjectCodec::Structural(fields) => {
            let Value::Object(map) = raw else {
                return Err(unmappable(field, target, raw).into());
            };
            let mut state = State::new();
            for def in fields.iter().filter(|def| !def.transient) {
                let nested = format!("{field}.{}", def.name);
                let stored = map.get(&def.name).unwrap_or(&Value::Null);
                state.insert(def.name.clone(), coerce(&nested, stored, &def.field_type)?);
            }
            Ok(FieldValue::Record(state))
        }
        ObjectCodec::Parse(parse) => {
            let opaque = parse(raw).map_err(|reason| parse_error(field, target, raw, reason))?;
            Ok(FieldValue::Opaque(opaque))
        }
        ObjectCodec::None => Err(ConfigError::NoConversion {
            field: field.to_string(),
            target: object.name.clone(),
        }
        .into()),
    }
}
