#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use tether_orm::{Db, DatabasePoolConfig, Entity, EntityDescriptor, OrmConfig, ScalarKind};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tether_orm=debug")
        .with_test_writer()
        .try_init();
}

/// Fresh in-memory database on a single connection
pub async fn memory_db() -> Db {
    init_tracing();
    let config = OrmConfig::new()
        .with_pool(DatabasePoolConfig::single_connection())
        .with_log_sql(true);
    Db::connect("sqlite::memory:", config).await.unwrap()
}

/// In-memory database with every test entity migrated
pub async fn migrated_db() -> Db {
    let db = memory_db().await;
    db.auto_migrate::<Category>().await.unwrap();
    db.auto_migrate::<Post>().await.unwrap();
    db.auto_migrate::<Comment>().await.unwrap();
    db.auto_migrate::<User>().await.unwrap();
    db.auto_migrate::<Language>().await.unwrap();
    db.auto_migrate::<Cat>().await.unwrap();
    db.auto_migrate::<Dog>().await.unwrap();
    db.auto_migrate::<Toy>().await.unwrap();
    db.auto_migrate::<Memo>().await.unwrap();
    db
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub posts: Vec<Post>,
}

impl Entity for Category {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("Category")
            .field("id", ScalarKind::Int, "primary_key")
            .field("name", ScalarKind::Text, "size:64")
            .many::<Post>("posts", "")
    }
}

impl Category {
    pub fn named(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Post {
    pub id: i64,
    pub title: String,
    pub category_id: i64,
    pub category: Option<Box<Category>>,
    pub comments: Vec<Comment>,
}

impl Entity for Post {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("Post")
            .field("id", ScalarKind::Int, "primary_key")
            .field("title", ScalarKind::Text, "not null")
            .field("category_id", ScalarKind::Int, "index")
            .one::<Category>("category", "")
            .many::<Comment>("comments", "")
    }
}

impl Post {
    pub fn titled(title: &str) -> Self {
        Self { title: title.to_string(), ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Comment {
    pub id: i64,
    pub post_id: i64,
    pub body: String,
}

impl Entity for Comment {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("Comment")
            .field("id", ScalarKind::Int, "primary_key")
            .field("post_id", ScalarKind::Int, "")
            .field("body", ScalarKind::Text, "")
    }
}

impl Comment {
    pub fn saying(body: &str) -> Self {
        Self { body: body.to_string(), ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub languages: Vec<Language>,
}

impl Entity for User {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("User")
            .field("id", ScalarKind::Int, "primary_key")
            .field("name", ScalarKind::Text, "")
            .many::<Language>("languages", "many2many:user_languages")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Language {
    pub id: i64,
    pub name: String,
}

impl Entity for Language {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("Language")
            .field("id", ScalarKind::Int, "primary_key")
            .field("name", ScalarKind::Text, "unique_index")
    }
}

impl Language {
    pub fn named(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cat {
    pub id: i64,
    pub name: String,
    pub toy: Option<Toy>,
}

impl Entity for Cat {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("Cat")
            .field("id", ScalarKind::Int, "primary_key")
            .field("name", ScalarKind::Text, "")
            .one::<Toy>("toy", "polymorphic:Owner")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dog {
    pub id: i64,
    pub name: String,
    pub toys: Vec<Toy>,
}

impl Entity for Dog {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("Dog")
            .field("id", ScalarKind::Int, "primary_key")
            .field("name", ScalarKind::Text, "")
            .many::<Toy>("toys", "polymorphic:Owner")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toy {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    pub owner_type: String,
}

impl Entity for Toy {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("Toy")
            .field("id", ScalarKind::Int, "primary_key")
            .field("name", ScalarKind::Text, "")
            .field("owner_id", ScalarKind::Int, "")
            .field("owner_type", ScalarKind::Text, "")
    }
}

impl Toy {
    pub fn named(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }
}

/// Soft-deletable entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Memo {
    pub id: i64,
    pub body: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub deleted_at: Option<String>,
}

impl Entity for Memo {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("Memo")
            .field("id", ScalarKind::Int, "primary_key")
            .field("body", ScalarKind::Text, "")
            .field("created_at", ScalarKind::DateTime, "")
            .field("updated_at", ScalarKind::DateTime, "")
            .field("deleted_at", ScalarKind::DateTime, "")
    }
}
