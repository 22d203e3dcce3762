use std::sync::Arc;

use serde_json::{Map, Value, json};

/// Reserved key holding a list of AND-ed single-field conditions.
pub const AND: &str = "$and";
/// Reserved key holding a list of OR-ed conditions.
pub const OR: &str = "$or";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Match,
    Sort,
    Project,
    Group,
    Limit,
    Skip,
    Count,
}

impl StageKind {
    pub fn key(self) -> &'static str {
        match self {
            StageKind::Match => "$match",
            StageKind::Sort => "$sort",
            StageKind::Project => "$project",
            StageKind::Group => "$group",
            StageKind::Limit => "$limit",
            StageKind::Skip => "$skip",
            StageKind::Count => "$count",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Map<String, Value>),
    Sort(Map<String, Value>),
    Project(Map<String, Value>),
    Group(Map<String, Value>),
    Limit(u64),
    Skip(u64),
    Count(String),
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Match(_) => StageKind::Match,
            Stage::Sort(_) => StageKind::Sort,
            Stage::Project(_) => StageKind::Project,
            Stage::Group(_) => StageKind::Group,
            Stage::Limit(_) => StageKind::Limit,
            Stage::Skip(_) => StageKind::Skip,
            Stage::Count(_) => StageKind::Count,
        }
    }

    /// An empty keyed stage; `None` for stages without a field map.
    fn empty(kind: StageKind) -> Option<Self> {
        match kind {
            StageKind::Match => Some(Stage::Match(Map::new())),
            StageKind::Sort => Some(Stage::Sort(Map::new())),
            StageKind::Project => Some(Stage::Project(Map::new())),
            StageKind::Group => Some(Stage::Group(Map::new())),
            StageKind::Limit | StageKind::Skip | StageKind::Count => None,
        }
    }

    pub fn fields(&self) -> Option<&Map<String, Value>> {
        match self {
            Stage::Match(m) | Stage::Sort(m) | Stage::Project(m) | Stage::Group(m) => Some(m),
            _ => None,
        }
    }

    fn fields_mut(&mut self) -> Option<&mut Map<String, Value>> {
        match self {
            Stage::Match(m) | Stage::Sort(m) | Stage::Project(m) | Stage::Group(m) => Some(m),
            _ => None,
        }
    }

    /// The wire form, e.g. `{"$limit": 1}`.
    pub fn to_document(&self) -> Value {
        let body = match self {
            Stage::Match(m) | Stage::Sort(m) | Stage::Project(m) | Stage::Group(m) => {
                Value::Object(m.clone())
            }
            Stage::Limit(n) | Stage::Skip(n) => json!(n),
            Stage::Count(field) => json!(field),
        };
        json!({ self.kind().key(): body })
    }
}

/// How a new condition combines with what a `$match` stage already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Combine {
    #[default]
    And,
    Or,
}

/// Ordered stage list with copy-on-write sharing between builder values.
///
/// Builder calls either append a stage or fold a field condition into the
/// most recent stage of the same kind, so repeated constraints on one field
/// end up in a single `$match` document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    stages: Arc<Vec<Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn push(&mut self, stage: Stage) {
        Arc::make_mut(&mut self.stages).push(stage);
    }

    /// Most recently appended stage of `kind`.
    pub fn last_of(&self, kind: StageKind) -> Option<&Stage> {
        self.stages.iter().rev().find(|s| s.kind() == kind)
    }

    pub fn to_documents(&self) -> Vec<Value> {
        self.stages.iter().map(Stage::to_document).collect()
    }

    /// Fold `field: condition` into the most recent stage of `kind`, or append
    /// a new stage holding just that entry.
    ///
    /// `$match` stages conjoin repeated fields under `$and` (or wrap the body
    /// in `$or` for [`Combine::Or`]); keyed stages such as `$sort` and
    /// `$project` set the field directly, replacing an earlier value in place.
    pub fn merge(&mut self, kind: StageKind, field: &str, condition: Value, combine: Combine) {
        let stages = Arc::make_mut(&mut self.stages);
        let existing = stages
            .iter_mut()
            .rev()
            .find(|s| s.kind() == kind)
            .and_then(Stage::fields_mut);

        match existing {
            Some(filters) if kind == StageKind::Match => match combine {
                Combine::And => conjoin(filters, field, condition),
                Combine::Or => disjoin(filters, field, condition),
            },
            Some(filters) => {
                filters.insert(field.to_string(), condition);
            }
            None => {
                if let Some(mut stage) = Stage::empty(kind) {
                    if let Some(filters) = stage.fields_mut() {
                        filters.insert(field.to_string(), condition);
                    }
                    stages.push(stage);
                }
            }
        }
    }
}

fn single(field: &str, condition: Value) -> Value {
    let mut entry = Map::new();
    entry.insert(field.to_string(), condition);
    Value::Object(entry)
}

fn conjoin(filters: &mut Map<String, Value>, field: &str, condition: Value) {
    if let Some(Value::Array(list)) = filters.get_mut(AND) {
        if list.iter().any(|c| c.get(field).is_some()) {
            list.push(single(field, condition));
            return;
        }
    }

    let Some(previous) = filters.shift_remove(field) else {
        filters.insert(field.to_string(), condition);
        return;
    };

    let list = filters
        .entry(AND)
        .or_insert_with(|| Value::Array(Vec::new()));
    if !list.is_array() {
        // a raw `$and` that is not a list is kept as its own entry
        let raw = list.take();
        *list = Value::Array(vec![raw]);
    }
    if let Value::Array(list) = list {
        list.push(single(field, previous));
        list.push(single(field, condition));
    }
}

fn disjoin(filters: &mut Map<String, Value>, field: &str, condition: Value) {
    if filters.is_empty() {
        filters.insert(field.to_string(), condition);
        return;
    }
    if filters.len() == 1 {
        if let Some(Value::Array(list)) = filters.get_mut(OR) {
            list.push(single(field, condition));
            return;
        }
    }
    let previous = std::mem::take(filters);
    filters.insert(
        OR.to_string(),
        Value::Array(vec![Value::Object(previous), single(field, condition)]),
    );
}
