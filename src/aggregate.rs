use std::collections::HashMap;

use serde_json::{Map, Value, json};

use crate::context::Context;
use crate::document::{resolve_field, set_field};
use crate::error::{Error, Result};
use crate::filter::{self, Filter};
use crate::value::{Comparable, compare_json};

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expression {
    Literal(Value),
    FieldRef(String),
}

impl Expression {
    fn parse(val: &Value) -> Self {
        match val {
            Value::String(s) if s.starts_with('$') => Expression::FieldRef(s[1..].to_string()),
            other => Expression::Literal(other.clone()),
        }
    }

    fn eval(&self, doc: &Value) -> Value {
        match self {
            Expression::Literal(v) => v.clone(),
            Expression::FieldRef(path) => resolve_field(doc, path),
        }
    }
}

// ---------------------------------------------------------------------------
// Group keys and accumulators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum GroupKey {
    Single(Expression),
    Compound(Vec<(String, Expression)>),
}

#[derive(Debug, Clone)]
enum Accumulator {
    Sum(Expression),
    Avg(Expression),
    Min(Expression),
    Max(Expression),
    Count,
    First(Expression),
    Last(Expression),
    Push(Expression),
    AddToSet(Expression),
}

enum AccumulatorState {
    Sum(f64),
    Avg { sum: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    Count(u64),
    First(Option<Value>),
    Last(Option<Value>),
    Push(Vec<Value>),
}

impl Accumulator {
    fn parse(val: &Value) -> Result<Self> {
        let obj = val
            .as_object()
            .filter(|o| o.len() == 1)
            .ok_or_else(|| Error::InvalidPipeline("accumulator must have exactly one operator".into()))?;
        let (op, arg) = obj.iter().next().ok_or_else(|| {
            Error::InvalidPipeline("accumulator must have exactly one operator".into())
        })?;
        let expr = Expression::parse(arg);
        Ok(match op.as_str() {
            "$sum" => Accumulator::Sum(expr),
            "$avg" => Accumulator::Avg(expr),
            "$min" => Accumulator::Min(expr),
            "$max" => Accumulator::Max(expr),
            "$count" => Accumulator::Count,
            "$first" => Accumulator::First(expr),
            "$last" => Accumulator::Last(expr),
            "$push" => Accumulator::Push(expr),
            "$addToSet" => Accumulator::AddToSet(expr),
            _ => return Err(Error::InvalidPipeline(format!("unknown accumulator: {op}"))),
        })
    }

    fn initial(&self) -> AccumulatorState {
        match self {
            Accumulator::Sum(_) => AccumulatorState::Sum(0.0),
            Accumulator::Avg(_) => AccumulatorState::Avg { sum: 0.0, count: 0 },
            Accumulator::Min(_) => AccumulatorState::Min(None),
            Accumulator::Max(_) => AccumulatorState::Max(None),
            Accumulator::Count => AccumulatorState::Count(0),
            Accumulator::First(_) => AccumulatorState::First(None),
            Accumulator::Last(_) => AccumulatorState::Last(None),
            Accumulator::Push(_) | Accumulator::AddToSet(_) => AccumulatorState::Push(Vec::new()),
        }
    }

    fn fold(&self, state: &mut AccumulatorState, doc: &Value) {
        match (self, state) {
            (Accumulator::Sum(expr), AccumulatorState::Sum(s)) => {
                if let Some(n) = expr.eval(doc).as_f64() {
                    *s += n;
                }
            }
            (Accumulator::Avg(expr), AccumulatorState::Avg { sum, count }) => {
                if let Some(n) = expr.eval(doc).as_f64() {
                    *sum += n;
                    *count += 1;
                }
            }
            (Accumulator::Min(expr), AccumulatorState::Min(current)) => {
                let val = expr.eval(doc);
                if !val.is_null() && current.as_ref().is_none_or(|c| compare_json(&val, c).is_lt()) {
                    *current = Some(val);
                }
            }
            (Accumulator::Max(expr), AccumulatorState::Max(current)) => {
                let val = expr.eval(doc);
                if !val.is_null() && current.as_ref().is_none_or(|c| compare_json(&val, c).is_gt()) {
                    *current = Some(val);
                }
            }
            (Accumulator::Count, AccumulatorState::Count(c)) => *c += 1,
            (Accumulator::First(expr), AccumulatorState::First(current)) => {
                if current.is_none() {
                    *current = Some(expr.eval(doc));
                }
            }
            (Accumulator::Last(expr), AccumulatorState::Last(current)) => {
                *current = Some(expr.eval(doc));
            }
            (Accumulator::Push(expr), AccumulatorState::Push(items)) => items.push(expr.eval(doc)),
            (Accumulator::AddToSet(expr), AccumulatorState::Push(items)) => {
                let val = expr.eval(doc);
                if !items.contains(&val) {
                    items.push(val);
                }
            }
            _ => {}
        }
    }
}

impl AccumulatorState {
    fn finish(self) -> Value {
        match self {
            AccumulatorState::Sum(s) => number_to_value(s),
            AccumulatorState::Avg { count: 0, .. } => Value::Null,
            AccumulatorState::Avg { sum, count } => number_to_value(sum / count as f64),
            AccumulatorState::Count(c) => Value::Number(c.into()),
            AccumulatorState::Min(v)
            | AccumulatorState::Max(v)
            | AccumulatorState::First(v)
            | AccumulatorState::Last(v) => v.unwrap_or(Value::Null),
            AccumulatorState::Push(items) => Value::Array(items),
        }
    }
}

fn number_to_value(n: f64) -> Value {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum Projection {
    Include,
    Exclude,
}

#[derive(Debug, Clone)]
enum Step {
    Match(Filter),
    Group {
        key: GroupKey,
        accumulators: Vec<(String, Accumulator)>,
    },
    Sort(Vec<(String, bool)>), // (field, ascending)
    Skip(u64),
    Limit(u64),
    Project {
        fields: Vec<(String, Projection)>,
        computed: Vec<(String, Expression)>,
    },
    Count(String),
    Unwind {
        path: String,
        preserve_null: bool,
    },
    AddFields(Vec<(String, Expression)>),
}

fn body_object<'a>(stage: &str, body: &'a Value) -> Result<&'a Map<String, Value>> {
    body.as_object()
        .ok_or_else(|| Error::InvalidPipeline(format!("{stage} must be an object")))
}

fn parse_group(body: &Value) -> Result<Step> {
    let obj = body_object("$group", body)?;
    let id = obj
        .get("_id")
        .ok_or_else(|| Error::InvalidPipeline("$group requires '_id' field".into()))?;

    let key = match id {
        Value::Object(map) if !map.keys().any(|k| k.starts_with('$')) => GroupKey::Compound(
            map.iter()
                .map(|(k, v)| (k.clone(), Expression::parse(v)))
                .collect(),
        ),
        other => GroupKey::Single(Expression::parse(other)),
    };

    let accumulators = obj
        .iter()
        .filter(|(name, _)| *name != "_id")
        .map(|(name, spec)| Ok((name.clone(), Accumulator::parse(spec)?)))
        .collect::<Result<Vec<_>>>()?;

    Ok(Step::Group { key, accumulators })
}

fn parse_sort(body: &Value) -> Result<Step> {
    let fields = body_object("$sort", body)?
        .iter()
        .map(|(field, dir)| match dir.as_i64() {
            Some(1) => Ok((field.clone(), true)),
            Some(-1) => Ok((field.clone(), false)),
            _ => Err(Error::InvalidPipeline("sort direction must be 1 or -1".into())),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Step::Sort(fields))
}

fn parse_project(body: &Value) -> Result<Step> {
    let mut fields = Vec::new();
    let mut computed = Vec::new();
    for (field, spec) in body_object("$project", body)? {
        match spec {
            Value::Bool(true) => fields.push((field.clone(), Projection::Include)),
            Value::Bool(false) => fields.push((field.clone(), Projection::Exclude)),
            Value::Number(n) if n.as_f64() == Some(0.0) => {
                fields.push((field.clone(), Projection::Exclude))
            }
            Value::Number(_) => fields.push((field.clone(), Projection::Include)),
            other => computed.push((field.clone(), Expression::parse(other))),
        }
    }
    let includes = fields
        .iter()
        .any(|(name, p)| name != "_id" && *p == Projection::Include)
        || !computed.is_empty();
    let excludes = fields
        .iter()
        .any(|(name, p)| name != "_id" && *p == Projection::Exclude);
    if includes && excludes {
        return Err(Error::InvalidPipeline(
            "$project cannot mix inclusion and exclusion".into(),
        ));
    }
    Ok(Step::Project { fields, computed })
}

fn parse_unwind(body: &Value) -> Result<Step> {
    let (path, preserve_null) = match body {
        Value::String(s) => (s.as_str(), false),
        Value::Object(obj) => (
            obj.get("path").and_then(Value::as_str).ok_or_else(|| {
                Error::InvalidPipeline("$unwind requires 'path' string".into())
            })?,
            obj.get("preserveNullAndEmptyArrays")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        ),
        _ => {
            return Err(Error::InvalidPipeline(
                "$unwind must be a string or object".into(),
            ));
        }
    };
    let path = path
        .strip_prefix('$')
        .ok_or_else(|| Error::InvalidPipeline("$unwind path must start with $".into()))?;
    Ok(Step::Unwind {
        path: path.to_string(),
        preserve_null,
    })
}

fn parse_count(body: &Value) -> Result<u64> {
    body.as_u64()
        .ok_or_else(|| Error::InvalidPipeline("expected a non-negative integer".into()))
}

// ---------------------------------------------------------------------------
// Stage execution
// ---------------------------------------------------------------------------

fn exec_group(
    docs: Vec<Value>,
    key: &GroupKey,
    accumulators: &[(String, Accumulator)],
) -> Vec<Value> {
    let mut groups: HashMap<String, usize> = HashMap::new();
    let mut ordered: Vec<(Value, Vec<AccumulatorState>)> = Vec::new();

    for doc in &docs {
        let key_val = match key {
            GroupKey::Single(expr) => expr.eval(doc),
            GroupKey::Compound(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(name, expr)| (name.clone(), expr.eval(doc)))
                    .collect(),
            ),
        };

        let slot = *groups.entry(key_val.to_string()).or_insert_with(|| {
            let states = accumulators.iter().map(|(_, acc)| acc.initial()).collect();
            ordered.push((key_val, states));
            ordered.len() - 1
        });

        let states = &mut ordered[slot].1;
        for ((_, acc), state) in accumulators.iter().zip(states.iter_mut()) {
            acc.fold(state, doc);
        }
    }

    ordered
        .into_iter()
        .map(|(key_val, states)| {
            let mut row = Map::new();
            row.insert("_id".to_string(), key_val);
            for ((name, _), state) in accumulators.iter().zip(states) {
                row.insert(name.clone(), state.finish());
            }
            Value::Object(row)
        })
        .collect()
}

fn exec_sort(mut docs: Vec<Value>, fields: &[(String, bool)]) -> Vec<Value> {
    docs.sort_by(|a, b| {
        fields
            .iter()
            .map(|(field, ascending)| {
                let cmp = Comparable::from_json(&resolve_field(a, field))
                    .cmp(&Comparable::from_json(&resolve_field(b, field)));
                if *ascending { cmp } else { cmp.reverse() }
            })
            .find(|cmp| cmp.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    docs
}

fn exec_project(
    docs: Vec<Value>,
    fields: &[(String, Projection)],
    computed: &[(String, Expression)],
) -> Vec<Value> {
    let excludes_other = fields
        .iter()
        .any(|(name, p)| name != "_id" && *p == Projection::Exclude);
    // `{_id: 1}` on its own selects just the id
    let inclusion_mode = !computed.is_empty()
        || fields
            .iter()
            .any(|(name, p)| *p == Projection::Include && (name != "_id" || !excludes_other));
    let id_excluded = fields
        .iter()
        .any(|(name, p)| name == "_id" && *p == Projection::Exclude);

    docs.into_iter()
        .map(|doc| {
            if !inclusion_mode {
                let mut result = doc;
                if let Value::Object(map) = &mut result {
                    for (name, p) in fields {
                        if *p == Projection::Exclude {
                            map.shift_remove(name.as_str());
                        }
                    }
                }
                return result;
            }

            let mut result = json!({});
            if !id_excluded {
                if let Some(id) = doc.get("_id") {
                    set_field(&mut result, "_id", id.clone());
                }
            }
            for (name, p) in fields {
                if *p == Projection::Include {
                    if let Some(val) = crate::document::get_field(&doc, name) {
                        set_field(&mut result, name, val.clone());
                    }
                }
            }
            for (name, expr) in computed {
                set_field(&mut result, name, expr.eval(&doc));
            }
            result
        })
        .collect()
}

fn exec_unwind(docs: Vec<Value>, path: &str, preserve_null: bool) -> Vec<Value> {
    let mut result = Vec::new();
    for doc in docs {
        match resolve_field(&doc, path) {
            Value::Array(items) if !items.is_empty() => {
                for item in items {
                    let mut unwound = doc.clone();
                    set_field(&mut unwound, path, item);
                    result.push(unwound);
                }
            }
            Value::Array(_) | Value::Null => {
                if preserve_null {
                    result.push(doc);
                }
            }
            _ => result.push(doc),
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// A parsed aggregation pipeline, ready to run over a set of documents.
#[derive(Debug, Clone)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    pub fn parse(stages: &[Value]) -> Result<Self> {
        let mut steps = Vec::with_capacity(stages.len());
        for stage in stages {
            let obj = stage
                .as_object()
                .filter(|o| o.len() == 1)
                .ok_or_else(|| {
                    Error::InvalidPipeline("each pipeline stage must have exactly one key".into())
                })?;
            let Some((name, body)) = obj.iter().next() else {
                continue;
            };

            steps.push(match name.as_str() {
                "$match" => Step::Match(filter::parse_filter(body)?),
                "$group" => parse_group(body)?,
                "$sort" => parse_sort(body)?,
                "$skip" => Step::Skip(parse_count(body)?),
                "$limit" => Step::Limit(parse_count(body)?),
                "$project" => parse_project(body)?,
                "$count" => Step::Count(
                    body.as_str()
                        .filter(|s| !s.is_empty() && !s.starts_with('$'))
                        .ok_or_else(|| {
                            Error::InvalidPipeline("$count must be a non-empty field name".into())
                        })?
                        .to_string(),
                ),
                "$unwind" => parse_unwind(body)?,
                "$addFields" | "$set" => Step::AddFields(
                    body_object(name, body)?
                        .iter()
                        .map(|(k, v)| (k.clone(), Expression::parse(v)))
                        .collect(),
                ),
                _ => return Err(Error::InvalidPipeline(format!("unknown stage: {name}"))),
            });
        }
        Ok(Self { steps })
    }

    /// The filter of a leading `$match`, which a store may apply while
    /// scanning, and the index of the first step left to run.
    pub fn leading_filter(&self) -> (Option<&Filter>, usize) {
        match self.steps.first() {
            Some(Step::Match(filter)) => (Some(filter), 1),
            _ => (None, 0),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn execute(&self, docs: Vec<Value>, ctx: &Context) -> Result<Vec<Value>> {
        self.execute_from(0, docs, ctx)
    }

    /// Run steps starting at `start`, checking `ctx` before each one.
    pub fn execute_from(&self, start: usize, docs: Vec<Value>, ctx: &Context) -> Result<Vec<Value>> {
        let mut current = docs;
        for step in self.steps.iter().skip(start) {
            ctx.check()?;
            current = match step {
                Step::Match(filter) => current
                    .into_iter()
                    .filter(|doc| filter::matches(filter, doc))
                    .collect(),
                Step::Group { key, accumulators } => exec_group(current, key, accumulators),
                Step::Sort(fields) => exec_sort(current, fields),
                Step::Skip(n) => current.into_iter().skip(*n as usize).collect(),
                Step::Limit(n) => current.into_iter().take(*n as usize).collect(),
                Step::Project { fields, computed } => exec_project(current, fields, computed),
                // no input rows produce no output row
                Step::Count(_) if current.is_empty() => current,
                Step::Count(field) => vec![json!({ field.as_str(): current.len() })],
                Step::Unwind {
                    path,
                    preserve_null,
                } => exec_unwind(current, path, *preserve_null),
                Step::AddFields(fields) => current
                    .into_iter()
                    .map(|mut doc| {
                        for (name, expr) in fields {
                            let val = expr.eval(&doc);
                            set_field(&mut doc, name, val);
                        }
                        doc
                    })
                    .collect(),
            };
        }
        Ok(current)
    }
}
