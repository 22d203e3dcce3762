pub mod aggregate;
pub mod config;
pub mod connection;
pub mod context;
pub mod document;
pub mod error;
pub mod executor;
pub mod filter;
pub mod model;
pub mod query;
pub mod registry;
pub mod scheduler;
pub mod schema;
pub mod stage;
pub mod store;
pub mod value;

pub use config::Config;
pub use connection::{CollectionHandle, Connections, DataSource};
pub use context::Context;
pub use document::ObjectId;
pub use error::{Error, Result};
pub use executor::{Count, Distinct, Many, One, Resolve, ScheduledQuery};
pub use model::Model;
pub use query::{Query, Selection, SortSpec};
pub use registry::ModelRegistry;
pub use scheduler::{JobId, Scheduler};
pub use schema::{Field, FieldType, IndexOptions, IndexSpec, Schema, SchemaOptions, SortOrder};
pub use stage::{Pipeline, Stage, StageKind};
pub use store::MemoryStore;
