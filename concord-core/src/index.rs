//! Index model.
//!
//! An entity has exactly one primary [`Key`] and any number of secondary
//! keys derived from its field declarations. A query, expressed as
//! [`SearchTerm`]s, is answered by at most one key: see
//! [`IndexModel::match_index`].

use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;

use crate::error::{ConfigError, PersistResult};
use crate::field::{FieldDef, IndexKind};
use crate::value::FieldValue;

/// Separator between field values in a composite key value.
pub const KEY_SEPARATOR: &str = ":";

// ============================================================================
// KEY
// ============================================================================

/// An ordered, non-empty list of fields identifying a lookup path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    fields: Vec<String>,
    identifies: Option<String>,
}

impl Key {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            identifies: None,
        }
    }

    /// Tag the key with the entity type it references.
    pub fn identifying(mut self, entity: impl Into<String>) -> Self {
        self.identifies = Some(entity.into());
        self
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn identifies(&self) -> Option<&str> {
        self.identifies.as_deref()
    }

    /// True when the terms name exactly this key's fields, in any order.
    pub fn matches(&self, terms: &[SearchTerm]) -> bool {
        if terms.len() != self.fields.len() {
            return false;
        }
        let wanted: BTreeSet<&str> = terms.iter().map(|t| t.field.as_str()).collect();
        let have: BTreeSet<&str> = self.fields.iter().map(String::as_str).collect();
        wanted == have
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fields.join(KEY_SEPARATOR))
    }
}

// ============================================================================
// SEARCH TERMS
// ============================================================================

/// Comparison applied by a search term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    /// SQL-style pattern with `%` wildcards.
    Like,
}

/// Value side of a search term.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchValue {
    Value(FieldValue),
    /// Discrete domain; each member is a separate key value.
    Range(RangeInclusive<i64>),
}

/// A (field, operator, value) query triple.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchTerm {
    pub field: String,
    pub operator: Operator,
    pub value: SearchValue,
    /// Entity the field belongs to, when it is resolved through a join.
    pub join_entity: Option<String>,
}

impl SearchTerm {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<FieldValue>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: SearchValue::Value(value.into()),
            join_entity: None,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::new(field, Operator::Equals, value)
    }

    pub fn range(field: impl Into<String>, range: RangeInclusive<i64>) -> Self {
        Self {
            field: field.into(),
            operator: Operator::Equals,
            value: SearchValue::Range(range),
            join_entity: None,
        }
    }

    pub fn joined(mut self, entity: impl Into<String>) -> Self {
        self.join_entity = Some(entity.into());
        self
    }
}

// ============================================================================
// INDEX MODEL
// ============================================================================

/// Primary and secondary keys of one entity type.
#[derive(Debug, Clone)]
pub struct IndexModel {
    entity: String,
    primary: Key,
    secondary: Vec<Key>,
}

impl IndexModel {
    /// Derive the keys of `entity` from its field declarations.
    ///
    /// Secondary keys come out in declaration order, lexically ordered
    /// within one declaration, without structural duplicates. A cascading
    /// declaration on `a` with `[b, c]` yields `{a}`, `{a,b}` and `{a,b,c}`.
    pub fn derive(entity: &str, fields: &[FieldDef]) -> PersistResult<Self> {
        let known: BTreeSet<&str> = fields
            .iter()
            .filter(|f| !f.transient)
            .map(|f| f.name.as_str())
            .collect();

        let primaries: Vec<&FieldDef> = fields.iter().filter(|f| f.is_primary()).collect();
        let primary = match primaries.as_slice() {
            [] => {
                return Err(ConfigError::NoPrimaryIndex {
                    entity: entity.to_string(),
                }
                .into())
            }
            [only] => Key::new([only.name.clone()]),
            many => {
                return Err(ConfigError::MultiplePrimaryIndexes {
                    entity: entity.to_string(),
                    fields: many.iter().map(|f| f.name.clone()).collect(),
                }
                .into())
            }
        };
        if !known.contains(primary.fields[0].as_str()) {
            return Err(ConfigError::UnknownIndexField {
                entity: entity.to_string(),
                field: primary.fields[0].clone(),
            }
            .into());
        }

        let mut secondary: Vec<Key> = Vec::new();
        for def in fields {
            let Some(decl) = &def.index else {
                continue;
            };
            let identifies = match &decl.kind {
                IndexKind::Primary => continue,
                IndexKind::Secondary => None,
                IndexKind::Foreign { identifies } => identifies.clone(),
            };

            let base = std::iter::once(def.name.as_str());
            let mut generated: Vec<Key> = if decl.multi.is_empty() {
                vec![Key::new(base)]
            } else if decl.cascade {
                (0..=decl.multi.len())
                    .map(|len| Key::new(base.clone().chain(decl.multi[..len].iter().map(String::as_str))))
                    .collect()
            } else {
                vec![Key::new(base.chain(decl.multi.iter().map(String::as_str)))]
            };
            generated.sort();

            for mut key in generated {
                if let Some(unknown) = key.fields.iter().find(|f| !known.contains(f.as_str())) {
                    return Err(ConfigError::UnknownIndexField {
                        entity: entity.to_string(),
                        field: unknown.clone(),
                    }
                    .into());
                }
                key.identifies = identifies.clone();
                if !secondary.iter().any(|k| k.fields == key.fields) {
                    secondary.push(key);
                }
            }
        }

        Ok(Self {
            entity: entity.to_string(),
            primary,
            secondary,
        })
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn primary(&self) -> &Key {
        &self.primary
    }

    pub fn primary_field(&self) -> &str {
        &self.primary.fields[0]
    }

    pub fn secondary(&self) -> &[Key] {
        &self.secondary
    }

    /// Primary key first, then every secondary key.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        std::iter::once(&self.primary).chain(self.secondary.iter())
    }

    /// Pick the one key that answers `terms`.
    ///
    /// A single term on the primary field always selects the primary key,
    /// even when a secondary key covers the same field. Otherwise the
    /// secondary key whose field set equals the terms' field set wins.
    /// `None` means the query needs an unindexed scan.
    pub fn match_index(&self, terms: &[SearchTerm]) -> Option<&Key> {
        if terms.len() == 1 && terms[0].field == self.primary_field() {
            return Some(&self.primary);
        }
        self.secondary.iter().find(|key| key.matches(terms))
    }

    /// Look up a declared key by its exact field list.
    pub fn key(&self, fields: &[&str]) -> PersistResult<&Key> {
        self.keys()
            .find(|key| key.fields.iter().map(String::as_str).eq(fields.iter().copied()))
            .ok_or_else(|| {
                ConfigError::UnknownIndex {
                    entity: self.entity.clone(),
                    index: fields.join(KEY_SEPARATOR),
                }
                .into()
            })
    }
}

/// Every key value of `key` selected by `terms`, at most `limit` of them.
///
/// Terms are taken in key field order; ranges expand into one value per
/// member and combine cartesian-wise with the other terms. Expansion stops
/// once `limit` distinct values exist, so a caller that only needs to tell
/// one value from many never walks a whole range. `render` turns one typed
/// term value into its key text and returns `None` for null, in which case
/// nothing can match and the result is empty.
pub fn expand_key_values<F>(
    key: &Key,
    terms: &[SearchTerm],
    limit: Option<usize>,
    render: F,
) -> PersistResult<BTreeSet<String>>
where
    F: Fn(&str, &FieldValue) -> PersistResult<Option<String>>,
{
    let cap = limit.unwrap_or(usize::MAX);
    let mut combos: Vec<Vec<String>> = vec![Vec::new()];
    for field in key.fields() {
        let Some(term) = terms.iter().find(|t| &t.field == field) else {
            return Ok(BTreeSet::new());
        };
        let parts: BTreeSet<String> = match &term.value {
            SearchValue::Value(value) => render(field, value)?.into_iter().collect(),
            SearchValue::Range(range) => {
                let mut parts = BTreeSet::new();
                for member in range.clone() {
                    if parts.len() >= cap {
                        break;
                    }
                    parts.extend(render(field, &FieldValue::Long(member))?);
                }
                parts
            }
        };
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                parts.iter().map(move |part| {
                    let mut next = prefix.clone();
                    next.push(part.clone());
                    next
                })
            })
            .take(cap)
            .collect();
    }
    Ok(combos.into_iter().map(|c| c.join(KEY_SEPARATOR)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coerce::key_text;
    use crate::error::PersistError;
    use crate::field::FieldType;
    use proptest::prelude::*;

    fn render(_field: &str, value: &FieldValue) -> PersistResult<Option<String>> {
        Ok(key_text(value))
    }

    fn server_fields() -> Vec<FieldDef> {
        vec![
            FieldDef::new("serverId", FieldType::Long).primary(),
            FieldDef::new("name", FieldType::Text).secondary(),
            FieldDef::new("regionId", FieldType::Text)
                .foreign(Some("Region"))
                .composite(&["zone", "rack"], true),
            FieldDef::new("ownerId", FieldType::Text).composite(&["project"], false),
            FieldDef::new("zone", FieldType::Text),
            FieldDef::new("rack", FieldType::Int),
            FieldDef::new("project", FieldType::Text),
            FieldDef::new("scratch", FieldType::Text).transient(),
        ]
    }

    fn field_lists(model: &IndexModel) -> Vec<Vec<&str>> {
        model
            .secondary()
            .iter()
            .map(|k| k.fields().iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn test_cascade_generates_every_prefix() {
        let model = IndexModel::derive("Server", &server_fields()).unwrap();
        assert_eq!(
            field_lists(&model),
            vec![
                vec!["name"],
                vec!["regionId"],
                vec!["regionId", "zone"],
                vec!["regionId", "zone", "rack"],
                vec!["ownerId", "project"],
            ]
        );
        assert_eq!(model.secondary()[1].identifies(), Some("Region"));
        assert_eq!(model.secondary()[0].identifies(), None);
    }

    #[test]
    fn test_secondary_order_and_dedup() {
        let fields = vec![
            FieldDef::new("id", FieldType::Long).primary(),
            FieldDef::new("a", FieldType::Text).composite(&["b"], true),
            FieldDef::new("b", FieldType::Text).composite(&["a"], false),
            FieldDef::new("c", FieldType::Text).composite(&["b", "a"], true),
        ];
        let model = IndexModel::derive("Thing", &fields).unwrap();
        // {b,a} and {a,b} differ in order and both stay.
        assert_eq!(
            field_lists(&model),
            vec![
                vec!["a"],
                vec!["a", "b"],
                vec!["b", "a"],
                vec!["c"],
                vec!["c", "b"],
                vec!["c", "b", "a"],
            ]
        );

        let twice = vec![
            FieldDef::new("id", FieldType::Long).primary(),
            FieldDef::new("a", FieldType::Text).composite(&["b"], true),
            FieldDef::new("b", FieldType::Text),
            FieldDef::new("a", FieldType::Text).secondary(),
        ];
        let model = IndexModel::derive("Thing", &twice).unwrap();
        assert_eq!(field_lists(&model), vec![vec!["a"], vec!["a", "b"]]);
    }

    #[test]
    fn test_primary_index_required_and_unique() {
        let none = vec![FieldDef::new("name", FieldType::Text).secondary()];
        let err = IndexModel::derive("Server", &none).unwrap_err();
        assert!(matches!(err, PersistError::Config(ConfigError::NoPrimaryIndex { .. })));

        let two = vec![
            FieldDef::new("a", FieldType::Long).primary(),
            FieldDef::new("b", FieldType::Long).primary(),
        ];
        let err = IndexModel::derive("Server", &two).unwrap_err();
        assert!(matches!(
            err,
            PersistError::Config(ConfigError::MultiplePrimaryIndexes { .. })
        ));
    }

    #[test]
    fn test_unknown_index_field_rejected() {
        let fields = vec![
            FieldDef::new("id", FieldType::Long).primary(),
            FieldDef::new("a", FieldType::Text).composite(&["missing"], false),
        ];
        let err = IndexModel::derive("Thing", &fields).unwrap_err();
        assert_eq!(
            err,
            PersistError::Config(ConfigError::UnknownIndexField {
                entity: "Thing".to_string(),
                field: "missing".to_string(),
            })
        );
    }

    #[test]
    fn test_match_prefers_primary_for_single_primary_term() {
        let fields = vec![
            FieldDef::new("x", FieldType::Text).primary(),
            FieldDef::new("y", FieldType::Text).composite(&["x"], false),
        ];
        let model = IndexModel::derive("Thing", &fields).unwrap();

        let key = model.match_index(&[SearchTerm::eq("x", "1")]).unwrap();
        assert_eq!(key, model.primary());

        let wide = model
            .match_index(&[SearchTerm::eq("x", "1"), SearchTerm::eq("y", "2")])
            .unwrap();
        assert_eq!(wide.fields(), &["y".to_string(), "x".to_string()]);
    }

    #[test]
    fn test_match_none_without_exact_field_set() {
        let model = IndexModel::derive("Server", &server_fields()).unwrap();
        assert!(model.match_index(&[]).is_none());
        assert!(model.match_index(&[SearchTerm::eq("zone", "a")]).is_none());
        assert!(model
            .match_index(&[SearchTerm::eq("ownerId", "u1")])
            .is_none());
        let key = model
            .match_index(&[SearchTerm::eq("zone", "a"), SearchTerm::eq("regionId", "r")])
            .unwrap();
        assert_eq!(key.to_string(), "regionId:zone");
    }

    #[test]
    fn test_key_lookup_by_fields() {
        let model = IndexModel::derive("Server", &server_fields()).unwrap();
        assert!(model.key(&["regionId", "zone"]).is_ok());
        assert!(model.key(&["serverId"]).is_ok());
        let err = model.key(&["zone", "regionId"]).unwrap_err();
        assert!(matches!(err, PersistError::Config(ConfigError::UnknownIndex { .. })));
    }

    #[test]
    fn test_expand_key_values_follows_key_order() {
        let key = Key::new(["regionId", "zone"]);
        let terms = [SearchTerm::eq("zone", "b"), SearchTerm::eq("regionId", "us")];
        let values = expand_key_values(&key, &terms, None, render).unwrap();
        assert_eq!(values.into_iter().collect::<Vec<_>>(), vec!["us:b".to_string()]);
    }

    #[test]
    fn test_expand_key_values_with_null_is_empty() {
        let key = Key::new(["a"]);
        let terms = [SearchTerm::eq("a", FieldValue::Null)];
        assert!(expand_key_values(&key, &terms, None, render).unwrap().is_empty());
    }

    #[test]
    fn test_expand_key_values_stops_at_limit() {
        let key = Key::new(["a", "b"]);
        let terms = [
            SearchTerm::range("a", 0..=i64::MAX),
            SearchTerm::range("b", i64::MIN..=i64::MAX),
        ];
        let values = expand_key_values(&key, &terms, Some(2), render).unwrap();
        assert_eq!(values.len(), 2);
        assert!(values.contains("0:-9223372036854775808"));

        let single = [SearchTerm::range("a", 7..=7), SearchTerm::eq("b", 1i64)];
        let values = expand_key_values(&key, &single, Some(2), render).unwrap();
        assert_eq!(values.into_iter().collect::<Vec<_>>(), vec!["7:1".to_string()]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_cascade_yields_one_key_per_prefix(extra in 0usize..6) {
            let names: Vec<String> = (0..extra).map(|i| format!("f{i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut fields = vec![
                FieldDef::new("id", FieldType::Long).primary(),
                FieldDef::new("base", FieldType::Text).composite(&refs, true),
            ];
            fields.extend(names.iter().map(|n| FieldDef::new(n.clone(), FieldType::Text)));
            let model = IndexModel::derive("Thing", &fields).unwrap();

            prop_assert_eq!(model.secondary().len(), extra + 1);
            for (len, key) in model.secondary().iter().enumerate() {
                prop_assert_eq!(key.fields().len(), len + 1);
                prop_assert_eq!(key.fields()[0].as_str(), "base");
            }
        }

        #[test]
        fn prop_range_expansion_is_cartesian(a in 0i64..5, b in 0i64..5, len_a in 0i64..4, len_b in 0i64..4) {
            let key = Key::new(["x", "y"]);
            let terms = [
                SearchTerm::range("x", a..=a + len_a),
                SearchTerm::range("y", b..=b + len_b),
            ];
            let values = expand_key_values(&key, &terms, None, render).unwrap();
            prop_assert_eq!(values.len() as i64, (len_a + 1) * (len_b + 1));
            let first = format!("{}:{}", a, b);
            prop_assert!(values.contains(&first));
        }
    }
}
