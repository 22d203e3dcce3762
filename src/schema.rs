use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use crate::document::{ID_FIELD, ObjectId, as_object_mut};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldType {
    #[default]
    Any,
    String,
    Int,
    Float,
    Bool,
    Array,
    Object,
    DateTime,
    ObjectId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    /// Numeric form used in `$sort` documents and index keys.
    pub fn as_i32(self) -> i32 {
        match self {
            SortOrder::Asc => 1,
            SortOrder::Desc => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexOptions {
    pub unique: bool,
    pub name: Option<String>,
    /// Key direction; descending when unset.
    pub order: Option<SortOrder>,
}

/// One field definition. Type and required-ness are declarative only.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Field {
    pub field_type: FieldType,
    pub required: bool,
    pub default: Option<Value>,
    pub index: Option<IndexOptions>,
}

impl Field {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            ..Self::default()
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn index(mut self, options: IndexOptions) -> Self {
        self.index = Some(options);
        self
    }

    pub fn unique(self) -> Self {
        self.index(IndexOptions {
            unique: true,
            ..IndexOptions::default()
        })
    }
}

/// A single-field index as handed to the data source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexSpec {
    pub name: String,
    pub field: String,
    pub order: SortOrder,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamps {
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Default for Timestamps {
    fn default() -> Self {
        Self {
            enabled: false,
            created_at: "created_at".to_string(),
            updated_at: "updated_at".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaOptions {
    /// Collection name; derived from the model name when unset.
    pub collection: Option<String>,
    pub database: Option<String>,
    pub connection: Option<String>,
    pub timestamps: Timestamps,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    pub definitions: BTreeMap<String, Field>,
    pub options: SchemaOptions,
}

impl Schema {
    pub fn new<I, K>(definitions: I, options: SchemaOptions) -> Self
    where
        I: IntoIterator<Item = (K, Field)>,
        K: Into<String>,
    {
        Self {
            definitions: definitions
                .into_iter()
                .map(|(name, field)| (name.into(), field))
                .collect(),
            options,
        }
    }

    /// Enable timestamps with the default `created_at`/`updated_at` names.
    pub fn with_default_timestamps(self) -> Self {
        self.with_timestamps(None, None)
    }

    /// Enable timestamps, overriding the field names that are given.
    pub fn with_timestamps(mut self, created_at: Option<&str>, updated_at: Option<&str>) -> Self {
        let ts = &mut self.options.timestamps;
        ts.enabled = true;
        if let Some(name) = created_at.filter(|n| !n.is_empty()) {
            ts.created_at = name.to_string();
        }
        if let Some(name) = updated_at.filter(|n| !n.is_empty()) {
            ts.updated_at = name.to_string();
        }
        self
    }

    /// Configured collection, or the lowercased plural of `model_name`.
    pub fn collection_name(&self, model_name: &str) -> String {
        match &self.options.collection {
            Some(name) if !name.is_empty() => name.clone(),
            _ => pluralize(&model_name.to_lowercase()),
        }
    }

    pub fn index_specs(&self) -> Vec<IndexSpec> {
        self.definitions
            .iter()
            .filter_map(|(field, def)| {
                let options = def.index.as_ref()?;
                let order = options.order.unwrap_or(SortOrder::Desc);
                Some(IndexSpec {
                    name: options
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("{field}_{}", order.as_i32())),
                    field: field.clone(),
                    order,
                    unique: options.unique,
                })
            })
            .collect()
    }

    /// Prepare a document for insertion: assign `_id`, fill defaults for
    /// absent or null fields and stamp timestamps when enabled.
    pub fn enforce(&self, mut doc: Value) -> Result<Value> {
        let map = as_object_mut(&mut doc)?;

        let id_missing = match map.get(ID_FIELD) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty() || s.bytes().all(|b| b == b'0'),
            _ => false,
        };
        if id_missing {
            map.insert(ID_FIELD.to_string(), json!(ObjectId::new()));
        }

        for (field, def) in &self.definitions {
            let Some(default) = &def.default else {
                continue;
            };
            if map.get(field).is_none_or(Value::is_null) {
                map.insert(field.clone(), default.clone());
            }
        }

        let ts = &self.options.timestamps;
        if ts.enabled {
            let now = json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
            let unset = map
                .get(&ts.created_at)
                .is_none_or(|v| v.is_null() || is_zero_time(v));
            if unset {
                map.insert(ts.created_at.clone(), now.clone());
            }
            map.insert(ts.updated_at.clone(), now);
        }

        Ok(doc)
    }
}

/// Zero values produced by serializing a defaulted timestamp field.
fn is_zero_time(v: &Value) -> bool {
    v.as_str()
        .is_some_and(|s| s.is_empty() || s.starts_with("0001-01-01") || s.starts_with("1970-01-01T00:00:00"))
}

/// English plural for collection names: "user" → "users", "bestiary" →
/// "bestiaries", "match" → "matches".
pub fn pluralize(word: &str) -> String {
    const SUFFIX_ES: [&str; 5] = ["s", "x", "z", "ch", "sh"];
    if word.is_empty() {
        return String::new();
    }
    if let Some(stem) = word.strip_suffix('y') {
        if !stem.ends_with(['a', 'e', 'i', 'o', 'u']) && !stem.is_empty() {
            return format!("{stem}ies");
        }
    }
    if SUFFIX_ES.iter().any(|s| word.ends_with(s)) {
        return format!("{word}es");
    }
    format!("{word}s")
}
