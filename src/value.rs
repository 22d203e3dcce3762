use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

/// A JSON scalar with a total, type-aware ordering.
///
/// Ordering across types is `Null < Boolean < number < DateTime < String`.
/// Integers and floats compare numerically with each other. Strings that look
/// like dates are parsed into `DateTime` so `"2024-01-15"` sorts before
/// `"2024-01-15T10:30:00Z"` the way a reader expects.
#[derive(Debug, Clone)]
pub enum Comparable {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    DateTime(i64), // millis since epoch
    String(String),
}

impl Eq for Comparable {}

impl Hash for Comparable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Comparable::Null => 0u8.hash(state),
            Comparable::Boolean(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            // integers and integral floats compare equal, so they must hash alike
            Comparable::Integer(i) => {
                2u8.hash(state);
                (*i as f64).to_bits().hash(state);
            }
            Comparable::Float(f) => {
                2u8.hash(state);
                f.to_bits().hash(state);
            }
            Comparable::DateTime(ms) => {
                3u8.hash(state);
                ms.hash(state);
            }
            Comparable::String(s) => {
                4u8.hash(state);
                s.hash(state);
            }
        }
    }
}

impl PartialEq for Comparable {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for Comparable {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Comparable {
    fn cmp(&self, other: &Self) -> Ordering {
        use Comparable::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,

            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Boolean(_), _) => Ordering::Less,
            (_, Boolean(_)) => Ordering::Greater,

            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Integer(b)) => a.total_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Integer(_) | Float(_), _) => Ordering::Less,
            (_, Integer(_) | Float(_)) => Ordering::Greater,

            (DateTime(a), DateTime(b)) => a.cmp(b),
            (DateTime(_), _) => Ordering::Less,
            (_, DateTime(_)) => Ordering::Greater,

            (String(a), String(b)) => a.cmp(b),
        }
    }
}

impl Comparable {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Comparable::Null,
            Value::Bool(b) => Comparable::Boolean(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Comparable::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    Comparable::Float(f)
                } else {
                    Comparable::Null
                }
            }
            Value::String(s) => Self::parse_string(s),
            // compared structurally through their canonical text
            other => Comparable::String(other.to_string()),
        }
    }

    pub fn parse_string(s: &str) -> Self {
        // Only strings shaped like YYYY-MM-DD are worth handing to chrono.
        let b = s.as_bytes();
        let date_shaped = b.len() >= 10
            && b[..4].iter().all(u8::is_ascii_digit)
            && b[4] == b'-'
            && b[5..7].iter().all(u8::is_ascii_digit)
            && b[7] == b'-';
        if !date_shaped {
            return Comparable::String(s.to_string());
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Comparable::DateTime(dt.timestamp_millis());
        }
        for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
                return Comparable::DateTime(dt.and_utc().timestamp_millis());
            }
        }
        if let Some(dt) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return Comparable::DateTime(dt.and_utc().timestamp_millis());
        }
        Comparable::String(s.to_string())
    }
}

/// Compare two JSON values with [`Comparable`] ordering.
pub fn compare_json(a: &Value, b: &Value) -> Ordering {
    Comparable::from_json(a).cmp(&Comparable::from_json(b))
}
