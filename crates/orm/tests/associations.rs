mod common;

use common::*;
use tether_orm::{ModelError, RelationshipKind};

#[tokio::test]
async fn test_belongs_to_is_saved_before_owner() {
    let db = migrated_db().await;
    let mut post = Post {
        category: Some(Box::new(Category::named("news"))),
        ..Post::titled("hello")
    };
    db.create(&mut post).await.unwrap();

    let category = post.category.as_ref().unwrap();
    assert!(post.id > 0);
    assert!(category.id > 0);
    assert_eq!(post.category_id, category.id);
    assert_eq!(db.count::<Category>().await.unwrap(), 1);
}

#[tokio::test]
async fn test_has_many_children_receive_owner_key() {
    let db = migrated_db().await;
    let mut post = Post {
        comments: vec![Comment::saying("first"), Comment::saying("second")],
        ..Post::titled("hello")
    };
    db.create(&mut post).await.unwrap();

    assert!(post.comments.iter().all(|c| c.id > 0 && c.post_id == post.id));
    let stored: Vec<Comment> = db.clone().order("id").find().await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|c| c.post_id == post.id));
}

#[tokio::test]
async fn test_save_updates_existing_children() {
    let db = migrated_db().await;
    let mut post = Post {
        comments: vec![Comment::saying("draft")],
        ..Post::titled("hello")
    };
    db.create(&mut post).await.unwrap();

    post.comments[0].body = "edited".to_string();
    db.save(&mut post).await.unwrap();

    let comment: Comment = db.first().await.unwrap();
    assert_eq!(comment.body, "edited");
    assert_eq!(db.count::<Comment>().await.unwrap(), 1);
}

#[tokio::test]
async fn test_save_associations_switch_skips_cascade() {
    let db = migrated_db().await;
    let mut post = Post {
        category: Some(Box::new(Category::named("news"))),
        ..Post::titled("hello")
    };
    db.clone().set_save_associations(false).create(&mut post).await.unwrap();

    assert!(post.id > 0);
    assert_eq!(post.category_id, 0);
    assert_eq!(db.count::<Category>().await.unwrap(), 0);
}

#[tokio::test]
async fn test_autocreate_off_still_links_existing_record() {
    let db = migrated_db().await;
    let mut category = Category::named("news");
    db.create(&mut category).await.unwrap();

    let mut post = Post {
        category: Some(Box::new(category.clone())),
        ..Post::titled("hello")
    };
    db.clone()
        .set_association_autocreate(false)
        .set_association_autoupdate(false)
        .create(&mut post)
        .await
        .unwrap();
    assert_eq!(post.category_id, category.id);

    let mut orphan = Post {
        category: Some(Box::new(Category::named("sports"))),
        ..Post::titled("other")
    };
    db.clone().set_association_autocreate(false).create(&mut orphan).await.unwrap();
    assert_eq!(db.count::<Category>().await.unwrap(), 1);
}

#[tokio::test]
async fn test_many_to_many_append_is_idempotent() {
    let db = migrated_db().await;
    let mut user = User { name: "jinzhu".to_string(), ..Default::default() };
    db.create(&mut user).await.unwrap();

    db.association(&mut user, "languages")
        .append(vec![Language::named("EN")])
        .await
        .unwrap();
    let english = user.languages[0].clone();
    assert!(english.id > 0);

    db.association(&mut user, "languages").append(vec![english]).await.unwrap();
    assert_eq!(db.association(&mut user, "languages").count().await.unwrap(), 1);

    let linked: Vec<Language> = db.association(&mut user, "languages").find().await.unwrap();
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].name, "EN");
}

#[tokio::test]
async fn test_many_to_many_replace_delete_and_clear() {
    let db = migrated_db().await;
    let mut user = User {
        name: "jinzhu".to_string(),
        languages: vec![Language::named("EN"), Language::named("DE")],
        ..Default::default()
    };
    db.create(&mut user).await.unwrap();
    assert_eq!(db.association(&mut user, "languages").count().await.unwrap(), 2);

    db.association(&mut user, "languages")
        .replace(vec![Language::named("FR")])
        .await
        .unwrap();
    assert_eq!(user.languages.len(), 1);
    let french = user.languages[0].clone();
    let linked: Vec<Language> = db.association(&mut user, "languages").find().await.unwrap();
    assert_eq!(linked, vec![french.clone()]);

    db.association(&mut user, "languages").delete(vec![french]).await.unwrap();
    assert!(user.languages.is_empty());
    assert_eq!(db.association(&mut user, "languages").count().await.unwrap(), 0);
    assert_eq!(db.count::<Language>().await.unwrap(), 3);

    db.association(&mut user, "languages")
        .append(vec![Language::named("ES")])
        .await
        .unwrap();
    assert_eq!(db.association(&mut user, "languages").count().await.unwrap(), 1);
    db.association(&mut user, "languages").clear().await.unwrap();
    assert_eq!(db.association(&mut user, "languages").count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_has_many_replace_nulls_old_keys() {
    let db = migrated_db().await;
    let mut post = Post {
        comments: vec![Comment::saying("a"), Comment::saying("b")],
        ..Post::titled("hello")
    };
    db.create(&mut post).await.unwrap();

    db.association(&mut post, "comments")
        .replace(vec![Comment::saying("c")])
        .await
        .unwrap();
    assert_eq!(db.association(&mut post, "comments").count().await.unwrap(), 1);
    assert_eq!(db.count::<Comment>().await.unwrap(), 3);

    let detached: Vec<Comment> = db.clone().where_("post_id IS NULL", Vec::new()).find().await.unwrap();
    assert_eq!(detached.len(), 2);
}

#[tokio::test]
async fn test_belongs_to_append_replaces_and_clear_nulls_key() {
    let db = migrated_db().await;
    let mut post = Post::titled("hello");
    db.create(&mut post).await.unwrap();

    db.association(&mut post, "category")
        .append(vec![Category::named("news")])
        .await
        .unwrap();
    assert!(post.category_id > 0);
    assert_eq!(db.association(&mut post, "category").count().await.unwrap(), 1);

    db.association(&mut post, "category").clear().await.unwrap();
    assert_eq!(post.category_id, 0);
    assert_eq!(db.association(&mut post, "category").count().await.unwrap(), 0);

    let reloaded: Post = db.first().await.unwrap();
    assert_eq!(reloaded.category_id, 0);
}

#[tokio::test]
async fn test_polymorphic_owners_do_not_mix() {
    let db = migrated_db().await;
    let mut cat = Cat {
        name: "Mr. Bigglesworth".to_string(),
        toy: Some(Toy::named("yarn")),
        ..Default::default()
    };
    db.create(&mut cat).await.unwrap();
    let mut dog = Dog {
        name: "Pluto".to_string(),
        toys: vec![Toy::named("bone"), Toy::named("ball")],
        ..Default::default()
    };
    db.create(&mut dog).await.unwrap();

    assert_eq!(cat.id, dog.id);
    assert_eq!(cat.toy.as_ref().unwrap().owner_type, "cats");
    assert!(dog.toys.iter().all(|t| t.owner_type == "dogs" && t.owner_id == dog.id));

    assert_eq!(db.association(&mut cat, "toy").count().await.unwrap(), 1);
    assert_eq!(db.association(&mut dog, "toys").count().await.unwrap(), 2);

    let cats: Vec<Cat> = db.clone().preload("toy").find().await.unwrap();
    assert_eq!(cats[0].toy.as_ref().unwrap().name, "yarn");
    let dogs: Vec<Dog> = db.clone().preload("toys").find().await.unwrap();
    let mut names: Vec<&str> = dogs[0].toys.iter().map(|t| t.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["ball", "bone"]);
}

#[tokio::test]
async fn test_unsaved_source_counts_zero_without_querying() {
    // no tables exist, so any query would fail
    let db = memory_db().await;
    let mut user = User::default();
    assert_eq!(db.association(&mut user, "languages").count().await.unwrap(), 0);
    let linked: Vec<Language> = db.association(&mut user, "languages").find().await.unwrap();
    assert!(linked.is_empty());
}

#[tokio::test]
async fn test_handle_errors_are_sticky() {
    let db = migrated_db().await;
    let mut user = User::default();

    let mut association = db.association(&mut user, "name");
    assert!(matches!(association.count().await, Err(ModelError::Association(_))));
    assert!(association.find::<Language>().await.is_err());

    let mut association = db.association(&mut user, "languages");
    assert!(matches!(association.find::<Toy>().await, Err(ModelError::Association(_))));
    assert!(association.error().is_some());
    assert!(association.count().await.is_err());
}

#[tokio::test]
async fn test_relationships_resolve_from_conventions() {
    let db = memory_db().await;
    let post = db.metadata::<Post>();
    let category = post.field("category").unwrap().relationship().unwrap();
    assert_eq!(category.kind, RelationshipKind::BelongsTo);
    assert_eq!(category.foreign_db_names, vec!["category_id"]);

    let comments = post.field("comments").unwrap().relationship().unwrap();
    assert_eq!(comments.kind, RelationshipKind::HasMany);
    assert_eq!(comments.foreign_db_names, vec!["post_id"]);

    let toys = db.metadata::<Dog>();
    let toys = toys.field("toys").unwrap().relationship().unwrap();
    assert_eq!(toys.polymorphic_condition(), Some(("owner_type", "dogs")));

    let user = db.metadata::<User>();
    let languages = user.field("languages").unwrap().relationship().unwrap();
    assert_eq!(languages.kind, RelationshipKind::ManyToMany);
    assert_eq!(languages.foreign_db_names, vec!["user_id"]);
    assert_eq!(languages.association_foreign_db_names, vec!["language_id"]);
}

#[tokio::test]
async fn test_clear_matches_replace_with_nothing() {
    let db = migrated_db().await;
    let mut post = Post {
        comments: vec![Comment::saying("a"), Comment::saying("b")],
        ..Post::titled("hello")
    };
    db.create(&mut post).await.unwrap();

    db.association(&mut post, "comments").clear().await.unwrap();
    assert!(post.comments.is_empty());
    assert_eq!(db.association(&mut post, "comments").count().await.unwrap(), 0);
    assert_eq!(db.count::<Comment>().await.unwrap(), 2);

    db.association(&mut post, "comments")
        .append(vec![Comment::saying("c")])
        .await
        .unwrap();
    db.association(&mut post, "comments").replace(Vec::<Comment>::new()).await.unwrap();
    assert_eq!(db.association(&mut post, "comments").count().await.unwrap(), 0);
    let detached: Vec<Comment> = db.clone().where_("post_id IS NULL", Vec::new()).find().await.unwrap();
    assert_eq!(detached.len(), 3);
}

#[tokio::test]
async fn test_clear_keeps_other_polymorphic_owners() {
    let db = migrated_db().await;
    let mut cat = Cat {
        name: "Tom".to_string(),
        toy: Some(Toy::named("yarn")),
        ..Default::default()
    };
    db.create(&mut cat).await.unwrap();
    let mut dog = Dog {
        name: "Pluto".to_string(),
        toys: vec![Toy::named("bone")],
        ..Default::default()
    };
    db.create(&mut dog).await.unwrap();
    assert_eq!(cat.id, dog.id);

    db.association(&mut dog, "toys").clear().await.unwrap();
    assert_eq!(db.association(&mut dog, "toys").count().await.unwrap(), 0);
    assert_eq!(db.association(&mut cat, "toy").count().await.unwrap(), 1);
}
