mod common;

use common::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tether_orm::{CallbackFuture, Entity, EntityDescriptor, HookPoint, ModelError, ScalarKind, Scope};

fn reject(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        scope.add_error(ModelError::Validation("rejected".to_string()));
    })
}

fn shout(scope: &mut Scope) -> CallbackFuture<'_> {
    Box::pin(async move {
        let body = scope.value()["body"].as_str().unwrap_or_default().to_uppercase();
        scope.set_column("body", json!(body));
    })
}

#[tokio::test]
async fn test_default_create_chain_order() {
    let db = memory_db().await;
    assert_eq!(
        db.callback().create().names(),
        vec![
            "tether:begin_transaction",
            "tether:before_create",
            "tether:save_before_associations",
            "tether:update_time_stamp",
            "tether:create",
            "tether:save_after_associations",
            "tether:after_create",
            "tether:commit_or_rollback_transaction",
        ]
    );
    assert_eq!(
        db.callback().query().names(),
        vec!["tether:query", "tether:preload", "tether:after_query"]
    );
}

#[tokio::test]
async fn test_failing_callback_rolls_back_create() {
    let db = migrated_db().await;
    db.callback().create().after("tether:create").register("audit:reject", reject);

    let mut memo = Memo {
        body: "hello".to_string(),
        ..Default::default()
    };
    let outcome = db.create(&mut memo).await;
    assert_eq!(outcome, Err(ModelError::Validation("rejected".to_string())));
    assert_eq!(db.count::<Memo>().await.unwrap(), 0);

    db.callback().create().remove("audit:reject");
    db.create(&mut Memo::default()).await.unwrap();
    assert_eq!(db.count::<Memo>().await.unwrap(), 1);
}

#[tokio::test]
async fn test_custom_callback_before_insert() {
    let db = migrated_db().await;
    db.callback().create().before("tether:create").register("app:shout", shout);

    let mut memo = Memo {
        body: "quiet".to_string(),
        ..Default::default()
    };
    db.create(&mut memo).await.unwrap();
    let stored: Memo = db.first().await.unwrap();
    assert_eq!(stored.body, "QUIET");
}

#[tokio::test]
async fn test_timestamps_and_soft_delete() {
    let db = migrated_db().await;
    let mut kept = Memo {
        body: "kept".to_string(),
        ..Default::default()
    };
    let mut gone = Memo {
        body: "gone".to_string(),
        ..Default::default()
    };
    db.create(&mut kept).await.unwrap();
    db.create(&mut gone).await.unwrap();
    assert!(kept.created_at.is_some());
    assert!(kept.updated_at.is_some());

    assert_eq!(db.delete(&gone).await.unwrap(), 1);
    assert_eq!(db.count::<Memo>().await.unwrap(), 1);
    assert_eq!(db.clone().unscoped().count::<Memo>().await.unwrap(), 2);

    db.clone().unscoped().delete(&gone).await.unwrap();
    assert_eq!(db.clone().unscoped().count::<Memo>().await.unwrap(), 1);
}

#[tokio::test]
async fn test_delete_requires_a_restriction() {
    let db = migrated_db().await;
    let outcome = db.delete(&Memo::default()).await;
    assert_eq!(outcome, Err(ModelError::MissingPrimaryKey));
}

#[tokio::test]
async fn test_update_columns_skips_timestamps() {
    let db = migrated_db().await;
    let mut memo = Memo {
        body: "draft".to_string(),
        ..Default::default()
    };
    db.create(&mut memo).await.unwrap();
    let stamped = memo.updated_at.clone();

    let affected = db
        .update_columns(&mut memo, json!({"body": "final"}))
        .await
        .unwrap();
    assert_eq!(affected, 1);
    assert_eq!(memo.body, "final");
    assert_eq!(memo.updated_at, stamped);

    let mut reloaded = Memo { id: memo.id, ..Default::default() };
    db.reload(&mut reloaded).await.unwrap();
    assert_eq!(reloaded.body, "final");
}

#[tokio::test]
async fn test_explicit_transaction_rollback() {
    let db = migrated_db().await;
    let tx = db.begin().await.unwrap();
    assert!(tx.in_transaction());
    assert!(tx.begin().await.is_err());

    let mut cat = Cat {
        name: "Tom".to_string(),
        toy: Some(Toy::named("mouse")),
        ..Default::default()
    };
    tx.create(&mut cat).await.unwrap();
    assert_eq!(tx.count::<Toy>().await.unwrap(), 1);
    tx.rollback().await.unwrap();

    assert_eq!(db.count::<Cat>().await.unwrap(), 0);
    assert_eq!(db.count::<Toy>().await.unwrap(), 0);
}

#[tokio::test]
async fn test_explicit_transaction_commit() {
    let db = migrated_db().await;
    let tx = db.begin().await.unwrap();
    tx.create(&mut Cat { name: "Tom".to_string(), ..Default::default() })
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(db.count::<Cat>().await.unwrap(), 1);
}

#[tokio::test]
async fn test_save_creates_when_update_matches_nothing() {
    let db = migrated_db().await;
    let mut memo = Memo {
        id: 42,
        body: "imported".to_string(),
        ..Default::default()
    };
    db.save(&mut memo).await.unwrap();
    let stored: Memo = db.first().await.unwrap();
    assert_eq!(stored.id, 42);
    assert_eq!(stored.body, "imported");
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Ticket {
    id: i64,
    code: String,
    state: String,
}

impl Entity for Ticket {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("Ticket")
            .field("id", ScalarKind::Int, "")
            .field("code", ScalarKind::Text, "")
            .field("state", ScalarKind::Text, "default:'open'")
            .hook(HookPoint::BeforeCreate, |ticket: &mut Ticket| {
                if ticket.code.is_empty() {
                    return Err(ModelError::Validation("code is required".to_string()));
                }
                ticket.code = ticket.code.to_uppercase();
                Ok(())
            })
    }
}

#[tokio::test]
async fn test_hooks_and_default_reload() {
    let db = memory_db().await;
    db.auto_migrate::<Ticket>().await.unwrap();

    let mut ticket = Ticket {
        code: "abc".to_string(),
        ..Default::default()
    };
    db.create(&mut ticket).await.unwrap();
    assert_eq!(ticket.code, "ABC");
    assert_eq!(ticket.state, "open");

    let outcome = db.create(&mut Ticket::default()).await;
    assert_eq!(outcome, Err(ModelError::Validation("code is required".to_string())));
    assert_eq!(db.count::<Ticket>().await.unwrap(), 1);
}

#[tokio::test]
async fn test_raw_statements_render_placeholders() {
    let db = migrated_db().await;
    db.exec(
        "INSERT INTO memos (body) VALUES (?), (?)",
        vec!["one".into(), "two".into()],
    )
    .await
    .unwrap();
    let rows = db
        .query_raw("SELECT body FROM memos WHERE body IN (?) ORDER BY id", vec![vec!["one", "two"].into()])
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["body"], tether_orm::DatabaseValue::String("one".to_string()));
}
