use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::document::{ID_FIELD, ObjectId};
use crate::error::{Error, Result};
use crate::executor::{Count, Distinct, Many, One};
use crate::model::Model;
use crate::schema::SortOrder;
use crate::stage::{Combine, Pipeline, Stage, StageKind};

/// Field name `$count` writes its result to.
pub const COUNT_FIELD: &str = "count";

type FailWith = Arc<dyn Fn() -> Error + Send + Sync>;

// ---------------------------------------------------------------------------
// Sort and projection inputs
// ---------------------------------------------------------------------------

/// Sort input: a field → direction map, or a flat `[field, dir, field, dir]`
/// list.
#[derive(Debug, Clone, PartialEq)]
pub enum SortSpec {
    Map(Map<String, Value>),
    Pairs(Vec<Value>),
}

impl From<Map<String, Value>> for SortSpec {
    fn from(map: Map<String, Value>) -> Self {
        SortSpec::Map(map)
    }
}

impl From<Vec<Value>> for SortSpec {
    fn from(pairs: Vec<Value>) -> Self {
        SortSpec::Pairs(pairs)
    }
}

impl<const N: usize> From<[(&str, SortOrder); N]> for SortSpec {
    fn from(pairs: [(&str, SortOrder); N]) -> Self {
        SortSpec::Map(
            pairs
                .into_iter()
                .map(|(field, order)| (field.to_string(), json!(order.as_i32())))
                .collect(),
        )
    }
}

impl SortSpec {
    /// Validated `(field, order)` pairs in input order.
    fn into_pairs(self) -> Result<Vec<(String, SortOrder)>> {
        match self {
            SortSpec::Map(map) => map
                .into_iter()
                .map(|(field, dir)| Ok((field, parse_direction(&dir)?)))
                .collect(),
            SortSpec::Pairs(list) => {
                if list.len() % 2 != 0 {
                    return Err(Error::UnpairedSortArguments);
                }
                list.chunks(2)
                    .map(|pair| {
                        let field = pair[0].as_str().ok_or_else(|| {
                            Error::InvalidQuery(format!("sort field must be a string, got {}", pair[0]))
                        })?;
                        Ok((field.to_string(), parse_direction(&pair[1])?))
                    })
                    .collect()
            }
        }
    }
}

fn parse_direction(dir: &Value) -> Result<SortOrder> {
    match dir {
        Value::Number(n) if n.as_i64() == Some(1) => Ok(SortOrder::Asc),
        Value::Number(n) if n.as_i64() == Some(-1) => Ok(SortOrder::Desc),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortOrder::Asc),
            "desc" | "descending" => Ok(SortOrder::Desc),
            _ => Err(Error::InvalidSortOrder(s.clone())),
        },
        other => Err(Error::InvalidSortOrder(other.to_string())),
    }
}

/// Projection input: field names (a leading `-` excludes) or a raw
/// field → value map.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Names(Vec<String>),
    Map(Map<String, Value>),
}

impl From<&str> for Selection {
    /// `"name age -_id"` or `"name,age"`.
    fn from(fields: &str) -> Self {
        Selection::Names(
            fields
                .split([',', ' '])
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

impl From<Vec<String>> for Selection {
    fn from(fields: Vec<String>) -> Self {
        Selection::Names(fields)
    }
}

impl From<&[&str]> for Selection {
    fn from(fields: &[&str]) -> Self {
        Selection::Names(fields.iter().map(|f| f.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Selection {
    fn from(fields: [&str; N]) -> Self {
        Selection::from(&fields[..])
    }
}

impl From<Map<String, Value>> for Selection {
    fn from(map: Map<String, Value>) -> Self {
        Selection::Map(map)
    }
}

impl Selection {
    fn into_entries(self) -> Vec<(String, Value)> {
        match self {
            Selection::Names(names) => names
                .into_iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .map(|name| match name.strip_prefix('-') {
                    Some(excluded) => (excluded.to_string(), json!(0)),
                    None => (name, json!(1)),
                })
                .collect(),
            Selection::Map(map) => map.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A pipeline under construction for the documents of one model.
///
/// Operator calls such as [`Query::greater_than`] apply to the field last
/// selected with [`Query::where_field`] and are folded into the most recent
/// `$match` stage by [`Pipeline::merge`]. Terminal calls like
/// [`Query::find_one`] fix the result type through the marker `R`.
///
/// Queries are cheap to clone; clones share their stages until one of them is
/// changed.
pub struct Query<T, R = Many> {
    pub(crate) model: Model<T>,
    pub(crate) pipeline: Pipeline,
    field: Option<String>,
    disjunctive: bool,
    pub(crate) fail_with: Option<FailWith>,
    /// Operator applied while no field was selected.
    unbound_operator: Option<String>,
    _result: PhantomData<fn() -> R>,
}

impl<T, R> Clone for Query<T, R> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            pipeline: self.pipeline.clone(),
            field: self.field.clone(),
            disjunctive: self.disjunctive,
            fail_with: self.fail_with.clone(),
            unbound_operator: self.unbound_operator.clone(),
            _result: PhantomData,
        }
    }
}

impl<T, R> fmt::Debug for Query<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("model", &self.model.name())
            .field("pipeline", &self.pipeline)
            .field("field", &self.field)
            .field("disjunctive", &self.disjunctive)
            .field("or_fail", &self.fail_with.is_some())
            .finish()
    }
}

impl<T> Query<T> {
    pub(crate) fn new(model: Model<T>) -> Self {
        Self {
            model,
            pipeline: Pipeline::new(),
            field: None,
            disjunctive: false,
            fail_with: None,
            unbound_operator: None,
            _result: PhantomData,
        }
    }
}

impl<T, R> Query<T, R> {
    pub fn model(&self) -> &Model<T> {
        &self.model
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The stage documents that will be sent to the data source.
    pub fn to_documents(&self) -> Vec<Value> {
        self.pipeline.to_documents()
    }

    /// Usage error recorded while building, reported by the terminal call.
    pub(crate) fn usage_error(&self) -> Option<Error> {
        self.unbound_operator
            .as_ref()
            .map(|op| Error::MissingTargetField(op.clone()))
    }

    fn with_result<S>(self) -> Query<T, S> {
        Query {
            model: self.model,
            pipeline: self.pipeline,
            field: self.field,
            disjunctive: self.disjunctive,
            fail_with: self.fail_with,
            unbound_operator: self.unbound_operator,
            _result: PhantomData,
        }
    }

    /// Append a `$match` stage; anything but an object matches everything.
    pub fn filter(mut self, conditions: Value) -> Self {
        let conditions = match conditions {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.pipeline.push(Stage::Match(conditions));
        self
    }

    // -- Target field -------------------------------------------------------

    /// Select the field later operator calls constrain.
    pub fn where_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self.disjunctive = false;
        self
    }

    pub fn where_equals(self, field: &str, value: impl Into<Value>) -> Self {
        self.where_field(field).equals(value)
    }

    /// Like [`Query::where_field`], but the following conditions are OR-ed
    /// with everything matched so far.
    pub fn or_where(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self.disjunctive = true;
        self
    }

    pub fn or_where_equals(self, field: &str, value: impl Into<Value>) -> Self {
        self.or_where(field).equals(value)
    }

    // -- Operators ----------------------------------------------------------

    /// Apply `{key: value}` to the selected field.
    pub fn apply(mut self, key: &str, value: impl Into<Value>) -> Self {
        let Some(field) = self.field.clone() else {
            self.unbound_operator.get_or_insert_with(|| key.to_string());
            return self;
        };
        let combine = if self.disjunctive {
            Combine::Or
        } else {
            Combine::And
        };
        let value: Value = value.into();
        let condition = json!({ key: value });
        self.pipeline
            .merge(StageKind::Match, &field, condition, combine);
        self
    }

    pub fn equals(self, value: impl Into<Value>) -> Self {
        self.apply("$eq", value)
    }

    pub fn not_equals(self, value: impl Into<Value>) -> Self {
        self.apply("$ne", value)
    }

    pub fn greater_than(self, value: impl Into<Value>) -> Self {
        self.apply("$gt", value)
    }

    pub fn greater_than_or_equals(self, value: impl Into<Value>) -> Self {
        self.apply("$gte", value)
    }

    pub fn less_than(self, value: impl Into<Value>) -> Self {
        self.apply("$lt", value)
    }

    pub fn less_than_or_equals(self, value: impl Into<Value>) -> Self {
        self.apply("$lte", value)
    }

    pub fn is_in<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Self {
        let list: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.apply("$in", list)
    }

    pub fn not_in<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Self {
        let list: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.apply("$nin", list)
    }

    pub fn exists(self, present: bool) -> Self {
        self.apply("$exists", present)
    }

    pub fn matches_regex(self, pattern: &str) -> Self {
        self.apply("$regex", pattern)
    }

    // -- Shaping ------------------------------------------------------------

    /// Merge sort keys into the most recent `$sort` stage.
    ///
    /// Fails without touching the pipeline if a pair is incomplete or a
    /// direction is not one of `1`, `-1`, `asc`, `desc`, `ascending`,
    /// `descending`.
    pub fn sort(mut self, spec: impl Into<SortSpec>) -> Result<Self> {
        for (field, order) in spec.into().into_pairs()? {
            self.pipeline
                .merge(StageKind::Sort, &field, json!(order.as_i32()), Combine::And);
        }
        Ok(self)
    }

    pub fn sort_by(mut self, field: &str, order: SortOrder) -> Self {
        self.pipeline
            .merge(StageKind::Sort, field, json!(order.as_i32()), Combine::And);
        self
    }

    /// Merge a projection into the most recent `$project` stage.
    pub fn select(mut self, selection: impl Into<Selection>) -> Self {
        for (field, value) in selection.into().into_entries() {
            self.pipeline
                .merge(StageKind::Project, &field, value, Combine::And);
        }
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.pipeline.push(Stage::Limit(n));
        self
    }

    pub fn skip(mut self, n: u64) -> Self {
        self.pipeline.push(Stage::Skip(n));
        self
    }

    // -- Guards -------------------------------------------------------------

    /// Fail with [`Error::NoResults`] when nothing matches.
    pub fn or_fail(self) -> Self {
        self.or_fail_with(|| Error::NoResults)
    }

    /// Fail with the error built by `make_error` when nothing matches.
    pub fn or_fail_with<F>(mut self, make_error: F) -> Self
    where
        F: Fn() -> Error + Send + Sync + 'static,
    {
        self.fail_with = Some(Arc::new(make_error));
        self
    }

    // -- Terminal shapes ----------------------------------------------------

    /// First document matching `conditions`.
    pub fn find_one(mut self, conditions: Value) -> Query<T, One> {
        self = self.filter(conditions);
        self.pipeline.push(Stage::Limit(1));
        self.with_result()
    }

    pub fn find_by_id(self, id: ObjectId) -> Query<T, One> {
        self.find_one(json!({ ID_FIELD: id }))
    }

    /// Number of documents matching `conditions`.
    pub fn count_documents(mut self, conditions: Value) -> Query<T, Count> {
        self = self.filter(conditions);
        self.pipeline.push(Stage::Count(COUNT_FIELD.to_string()));
        self.with_result()
    }

    /// Distinct values of `field` among documents matching `conditions`.
    pub fn distinct(mut self, field: &str, conditions: Value) -> Query<T, Distinct> {
        self = self.filter(conditions);
        let mut group = Map::new();
        group.insert(ID_FIELD.to_string(), json!(format!("${field}")));
        self.pipeline.push(Stage::Group(group));
        self.with_result()
    }
}
