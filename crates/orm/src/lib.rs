//! # tether-orm
//!
//! Relationship-aware ORM core. Entities describe their fields once; the
//! engine infers has-one, has-many, belongs-to and many-to-many links from
//! naming conventions and annotations, cascades saves across them through
//! ordered callback chains, and eager-loads nested paths with batched
//! `IN (...)` queries.
//!
//! ```rust,ignore
//! let db = Db::connect("sqlite::memory:", OrmConfig::new()).await?;
//! db.auto_migrate::<Post>().await?;
//!
//! let mut post = Post { title: "hello".into(), category: Some(Category::named("news")), ..Default::default() };
//! db.create(&mut post).await?;
//!
//! let posts: Vec<Post> = db.clone().preload("category").find().await?;
//! db.association(&mut post, "tags").append(vec![tag]).await?;
//! ```

pub mod association;
pub mod backends;
pub mod callbacks;
pub mod config;
pub mod db;
pub mod error;
pub mod keys;
pub mod migrator;
mod preload;
pub mod relationships;
pub mod schema;
pub mod scope;
pub mod search;

pub use association::Association;
pub use backends::{
    DatabaseBackend, DatabaseBackendRegistry, DatabaseBackendType, DatabasePool, DatabasePoolConfig,
    DatabaseRow, DatabaseTransaction, DatabaseValue, SqlDialect,
};
pub use callbacks::{Callback, CallbackFuture, CallbackKind, CallbackProcessor, Callbacks};
pub use config::{OrmConfig, PreloadConfig};
pub use db::{BoxFuture, Db};
pub use error::{ModelError, ModelResult, OrmError, OrmResult, RelationshipError};
pub use keys::KeyScalar;
pub use relationships::{JoinTableDescriptor, RelationshipDescriptor, RelationshipKind};
pub use schema::{
    Entity, EntityDescriptor, EntityMetadata, EntityRef, FieldMetadata, HookPoint, ScalarKind,
    SchemaRegistry,
};
pub use scope::Scope;
pub use search::{Condition, PreloadSpec, Search};

#[cfg(test)]
pub(crate) mod testing {
    use crate::backends::DatabasePoolConfig;
    use crate::config::OrmConfig;
    use crate::db::Db;

    /// In-memory SQLite handle. One connection, so every statement sees the
    /// same database.
    pub(crate) async fn memory_db() -> Db {
        let config = OrmConfig::new().with_pool(DatabasePoolConfig::single_connection());
        Db::connect("sqlite::memory:", config)
            .await
            .expect("in-memory sqlite")
    }
}
