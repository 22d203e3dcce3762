use regex::Regex;
use serde_json::Value;

use crate::document::get_field;
use crate::error::{Error, Result};
use crate::value::Comparable;

// ---------------------------------------------------------------------------
// Filter AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum FilterOp {
    Eq(Value),
    Ne(Value),
    Gt(Comparable),
    Gte(Comparable),
    Lt(Comparable),
    Lte(Comparable),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub enum Filter {
    Field { field: String, op: FilterOp },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    All,
}

// ---------------------------------------------------------------------------
// Parsing: match document → Filter
// ---------------------------------------------------------------------------

pub fn parse_filter(filter: &Value) -> Result<Filter> {
    let obj = filter
        .as_object()
        .ok_or_else(|| Error::InvalidQuery("filter must be a JSON object".into()))?;

    let mut conditions = Vec::new();
    for (key, value) in obj {
        match key.as_str() {
            "$and" | "$or" => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| Error::InvalidQuery(format!("{key} must be an array")))?;
                let subs = arr.iter().map(parse_filter).collect::<Result<Vec<_>>>()?;
                conditions.push(if key == "$and" {
                    Filter::And(subs)
                } else {
                    Filter::Or(subs)
                });
            }
            field => match value.as_object() {
                Some(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    let options = ops.get("$options").and_then(Value::as_str);
                    for (op_key, op_val) in ops {
                        if op_key == "$options" {
                            continue;
                        }
                        conditions.push(Filter::Field {
                            field: field.to_string(),
                            op: parse_op(op_key, op_val, options)?,
                        });
                    }
                }
                // plain value or embedded document: equality shorthand
                _ => conditions.push(Filter::Field {
                    field: field.to_string(),
                    op: FilterOp::Eq(value.clone()),
                }),
            },
        }
    }

    Ok(match conditions.len() {
        0 => Filter::All,
        1 => conditions.remove(0),
        _ => Filter::And(conditions),
    })
}

fn parse_op(op_key: &str, op_val: &Value, options: Option<&str>) -> Result<FilterOp> {
    let list = |name: &str| {
        op_val
            .as_array()
            .cloned()
            .ok_or_else(|| Error::InvalidQuery(format!("{name} must be an array")))
    };
    match op_key {
        "$eq" => Ok(FilterOp::Eq(op_val.clone())),
        "$ne" => Ok(FilterOp::Ne(op_val.clone())),
        "$gt" => Ok(FilterOp::Gt(Comparable::from_json(op_val))),
        "$gte" => Ok(FilterOp::Gte(Comparable::from_json(op_val))),
        "$lt" => Ok(FilterOp::Lt(Comparable::from_json(op_val))),
        "$lte" => Ok(FilterOp::Lte(Comparable::from_json(op_val))),
        "$in" => Ok(FilterOp::In(list("$in")?)),
        "$nin" => Ok(FilterOp::Nin(list("$nin")?)),
        "$exists" => {
            let b = op_val
                .as_bool()
                .ok_or_else(|| Error::InvalidQuery("$exists must be a boolean".into()))?;
            Ok(FilterOp::Exists(b))
        }
        "$regex" => {
            let pattern = op_val
                .as_str()
                .ok_or_else(|| Error::InvalidQuery("$regex must be a string".into()))?;
            let pattern = match options {
                Some(flags) if !flags.is_empty() => format!("(?{flags}){pattern}"),
                _ => pattern.to_string(),
            };
            Regex::new(&pattern)
                .map(FilterOp::Regex)
                .map_err(|e| Error::InvalidQuery(format!("invalid $regex: {e}")))
        }
        _ => Err(Error::InvalidQuery(format!("unknown operator: {op_key}"))),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a filter against one document.
///
/// Array-valued fields match when any element satisfies a positive operator
/// (`$eq`, `$gt`, `$in`, `$regex`, ...), or when the array as a whole equals
/// the operand. `$ne` and `$nin` are the negation of `$eq` and `$in`.
pub fn matches(filter: &Filter, doc: &Value) -> bool {
    match filter {
        Filter::All => true,
        Filter::And(subs) => subs.iter().all(|s| matches(s, doc)),
        Filter::Or(subs) => subs.iter().any(|s| matches(s, doc)),
        Filter::Field { field, op } => {
            let field_val = get_field(doc, field);
            match op {
                FilterOp::Exists(expected) => field_val.is_some() == *expected,
                FilterOp::Ne(v) => !field_val.is_some_and(|f| equals(f, v)),
                FilterOp::Nin(vals) => !field_val.is_some_and(|f| vals.iter().any(|v| equals(f, v))),
                FilterOp::Eq(v) => match field_val {
                    Some(f) => equals(f, v),
                    // missing fields match an explicit null
                    None => v.is_null(),
                },
                FilterOp::In(vals) => match field_val {
                    Some(f) => vals.iter().any(|v| equals(f, v)),
                    None => vals.iter().any(Value::is_null),
                },
                _ => field_val.is_some_and(|f| any_element(f, |x| compare(x, op))),
            }
        }
    }
}

fn equals(field_val: &Value, operand: &Value) -> bool {
    if field_val.is_array() && operand.is_array() && field_val == operand {
        return true;
    }
    let target = Comparable::from_json(operand);
    any_element(field_val, |x| {
        !x.is_array() && !x.is_object() && Comparable::from_json(x) == target
            || x.is_object() && x == operand
    })
}

fn compare(val: &Value, op: &FilterOp) -> bool {
    if let FilterOp::Regex(re) = op {
        return val.as_str().is_some_and(|s| re.is_match(s));
    }
    let cv = Comparable::from_json(val);
    match op {
        FilterOp::Gt(v) => cv > *v,
        FilterOp::Gte(v) => cv >= *v,
        FilterOp::Lt(v) => cv < *v,
        FilterOp::Lte(v) => cv <= *v,
        _ => false,
    }
}

fn any_element(val: &Value, pred: impl Fn(&Value) -> bool) -> bool {
    match val {
        Value::Array(items) => items.iter().any(pred),
        other => pred(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(filter: Value, doc: Value) -> bool {
        matches(&parse_filter(&filter).unwrap(), &doc)
    }

    #[test]
    fn simple_equality() {
        assert!(check(json!({"name": "Geralt"}), json!({"name": "Geralt"})));
        assert!(!check(json!({"name": "Geralt"}), json!({"name": "Ciri"})));
    }

    #[test]
    fn range_on_one_field() {
        let filter = json!({"age": {"$gte": 18, "$lt": 65}});
        assert!(check(filter.clone(), json!({"age": 30})));
        assert!(!check(filter.clone(), json!({"age": 10})));
        assert!(!check(filter, json!({"age": 70})));
    }

    #[test]
    fn conjunction_list() {
        let filter = json!({"$and": [{"age": {"$gt": 10}}, {"age": {"$lt": 50}}]});
        assert!(check(filter.clone(), json!({"age": 20})));
        assert!(!check(filter, json!({"age": 100})));
    }

    #[test]
    fn disjunction_list() {
        let filter = json!({"$or": [{"occupation": "Mage"}, {"age": {"$gte": 300}}]});
        assert!(check(filter.clone(), json!({"occupation": "Mage", "age": 100})));
        assert!(check(filter.clone(), json!({"occupation": "Witcher", "age": 300})));
        assert!(!check(filter, json!({"occupation": "Witcher", "age": 100})));
    }

    #[test]
    fn date_range() {
        let filter = json!({"created_at": {"$gte": "2024-01-01", "$lt": "2025-01-01"}});
        assert!(check(filter.clone(), json!({"created_at": "2024-06-15T08:00:00Z"})));
        assert!(!check(filter, json!({"created_at": "2023-06-15"})));
    }

    #[test]
    fn array_fields_match_any_element() {
        let doc = json!({"weapons": ["Silver sword", "Crossbow"]});
        assert!(check(json!({"weapons": "Crossbow"}), doc.clone()));
        assert!(check(json!({"weapons": {"$in": ["Mace", "Crossbow"]}}), doc.clone()));
        assert!(!check(json!({"weapons": {"$nin": ["Crossbow"]}}), doc.clone()));
        assert!(check(json!({"weapons": ["Silver sword", "Crossbow"]}), doc.clone()));
        assert!(!check(json!({"weapons": {"$ne": "Silver sword"}}), doc));
    }

    #[test]
    fn exists_and_null() {
        assert!(check(json!({"school": {"$exists": false}}), json!({"name": "Ciri"})));
        assert!(check(json!({"school": {"$exists": true}}), json!({"school": null})));
        assert!(check(json!({"school": null}), json!({"name": "Ciri"})));
        assert!(check(json!({"school": {"$ne": "Wolf"}}), json!({"name": "Ciri"})));
    }

    #[test]
    fn regex_with_options() {
        let filter = json!({"name": {"$regex": "^ger", "$options": "i"}});
        assert!(check(filter.clone(), json!({"name": "Geralt"})));
        assert!(!check(filter, json!({"name": "Vesemir"})));
    }

    #[test]
    fn empty_filter_matches_all() {
        assert!(matches!(parse_filter(&json!({})).unwrap(), Filter::All));
        assert!(check(json!({}), json!({"anything": 1})));
    }

    #[test]
    fn rejects_bad_operators() {
        assert!(parse_filter(&json!({"age": {"$between": [1, 2]}})).is_err());
        assert!(parse_filter(&json!({"age": {"$in": 5}})).is_err());
        assert!(parse_filter(&json!({"$and": {}})).is_err());
        assert!(parse_filter(&json!([])).is_err());
    }
}
