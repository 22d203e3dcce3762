use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::Context;
use crate::document::ID_FIELD;
use crate::error::{Error, Result};
use crate::query::{COUNT_FIELD, Query};
use crate::scheduler::{JobId, Scheduler};

/// Every matching document.
#[derive(Debug, Clone, Copy)]
pub struct Many;

/// The first matching document, if any.
#[derive(Debug, Clone, Copy)]
pub struct One;

/// Number of matching documents.
#[derive(Debug, Clone, Copy)]
pub struct Count;

/// Distinct values of one field.
#[derive(Debug, Clone, Copy)]
pub struct Distinct;

/// Shapes raw result rows into the output of a query.
///
/// The marker type of a [`Query`] picks the shape: [`Many`] decodes every
/// row, [`One`] the first, [`Count`] reads the `count` field and
/// [`Distinct`] collects group keys.
pub trait Resolve {
    type Output<T>;

    fn resolve<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Self::Output<T>>;
}

impl Resolve for Many {
    type Output<T> = Vec<T>;

    fn resolve<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>> {
        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(Into::into))
            .collect()
    }
}

impl Resolve for One {
    type Output<T> = Option<T>;

    fn resolve<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Option<T>> {
        match rows.into_iter().next() {
            Some(row) => Ok(Some(serde_json::from_value(row)?)),
            None => Ok(None),
        }
    }
}

impl Resolve for Count {
    type Output<T> = i64;

    fn resolve<T: DeserializeOwned>(rows: Vec<Value>) -> Result<i64> {
        let Some(n) = rows.first().and_then(|row| row.get(COUNT_FIELD)) else {
            return Ok(0);
        };
        n.as_i64()
            .or_else(|| n.as_u64().and_then(|n| i64::try_from(n).ok()))
            .or_else(|| {
                n.as_f64()
                    .filter(|f| n.is_f64() && f.is_finite() && f.abs() < i64::MAX as f64)
                    .map(|f| f as i64)
            })
            .ok_or_else(|| Error::InvalidPipeline(format!("count is not a number: {n}")))
    }
}

impl Resolve for Distinct {
    type Output<T> = Vec<Value>;

    fn resolve<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<Value>> {
        Ok(rows
            .into_iter()
            .map(|mut row| row.get_mut(ID_FIELD).map(Value::take).unwrap_or(Value::Null))
            .collect())
    }
}

impl<T, R: Resolve> Query<T, R> {
    /// Run the query with the configured default timeout.
    pub fn exec(self) -> Result<R::Output<T>>
    where
        T: DeserializeOwned,
    {
        let ctx = Context::with_timeout(self.model.query_timeout());
        self.run(&ctx)
    }

    /// Run the query bound to `ctx`.
    pub fn exec_with(self, ctx: &Context) -> Result<R::Output<T>>
    where
        T: DeserializeOwned,
    {
        self.run(ctx)
    }

    fn run(&self, ctx: &Context) -> Result<R::Output<T>>
    where
        T: DeserializeOwned,
    {
        if let Some(err) = self.usage_error() {
            return Err(err);
        }
        let rows = self
            .model
            .collection()
            .aggregate(&self.pipeline.to_documents(), ctx)?;
        if rows.is_empty() {
            if let Some(fail) = &self.fail_with {
                return Err(fail());
            }
        }
        R::resolve(rows)
    }

    /// Attach a recurrence; see [`Scheduler::add`] for the accepted forms.
    pub fn schedule(self, expression: &str) -> ScheduledQuery<T, R> {
        ScheduledQuery {
            query: self,
            expression: expression.to_string(),
        }
    }
}

/// A query to be re-run on a recurrence instead of once.
#[derive(Debug)]
pub struct ScheduledQuery<T, R> {
    query: Query<T, R>,
    expression: String,
}

impl<T, R> ScheduledQuery<T, R>
where
    T: DeserializeOwned + 'static,
    R: Resolve + 'static,
{
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Register the query with `scheduler`. Each firing runs its own
    /// execution of the pipeline as it is now; results are discarded.
    pub fn exec(self, scheduler: &Scheduler) -> Result<JobId> {
        if let Some(err) = self.query.usage_error() {
            return Err(err);
        }
        let query = self.query;
        let model = query.model.name().to_string();
        scheduler.add(&self.expression, move || {
            let ctx = Context::with_timeout(query.model.query_timeout());
            query.run(&ctx)?;
            tracing::debug!(model = %model, "scheduled query ran");
            Ok(())
        })
    }
}
