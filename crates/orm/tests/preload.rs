mod common;

use common::*;
use tether_orm::ModelError;

async fn seed_posts(db: &tether_orm::Db) -> Vec<Post> {
    let mut posts = vec![
        Post {
            comments: vec![Comment::saying("a"), Comment::saying("b")],
            ..Post::titled("first")
        },
        Post::titled("second"),
        Post {
            comments: vec![Comment::saying("c")],
            ..Post::titled("third")
        },
    ];
    for post in posts.iter_mut() {
        db.create(post).await.unwrap();
    }
    posts
}

#[tokio::test]
async fn test_has_many_preload_gives_every_owner_a_collection() {
    let db = migrated_db().await;
    seed_posts(&db).await;

    let posts: Vec<Post> = db.clone().preload("comments").order("id").find().await.unwrap();
    let counts: Vec<usize> = posts.iter().map(|p| p.comments.len()).collect();
    assert_eq!(counts, vec![2, 0, 1]);
    assert!(posts
        .iter()
        .all(|p| p.comments.iter().all(|c| c.post_id == p.id)));
}

#[tokio::test]
async fn test_belongs_to_preload_shares_one_query_per_level() {
    let db = migrated_db().await;
    let mut news = Category::named("news");
    db.create(&mut news).await.unwrap();
    for title in ["a", "b", "c"] {
        let mut post = Post {
            category_id: news.id,
            ..Post::titled(title)
        };
        db.create(&mut post).await.unwrap();
    }
    let mut loose = Post::titled("loose");
    db.create(&mut loose).await.unwrap();

    let posts: Vec<Post> = db.clone().preload("category").order("id").find().await.unwrap();
    assert_eq!(posts.len(), 4);
    assert!(posts[..3]
        .iter()
        .all(|p| p.category.as_ref().map(|c| c.name.as_str()) == Some("news")));
    assert!(posts[3].category.is_none());
}

#[tokio::test]
async fn test_nested_preload_path() {
    let db = migrated_db().await;
    let mut news = Category::named("news");
    db.create(&mut news).await.unwrap();
    let mut post = Post {
        category_id: news.id,
        comments: vec![Comment::saying("nice"), Comment::saying("meh")],
        ..Post::titled("hello")
    };
    db.create(&mut post).await.unwrap();

    let categories: Vec<Category> = db.clone().preload("posts.comments").find().await.unwrap();
    assert_eq!(categories.len(), 1);
    assert_eq!(categories[0].posts.len(), 1);
    assert_eq!(categories[0].posts[0].comments.len(), 2);
}

#[tokio::test]
async fn test_preload_conditions_apply_to_last_segment() {
    let db = migrated_db().await;
    seed_posts(&db).await;

    let posts: Vec<Post> = db
        .clone()
        .preload_where("comments", "body <> ?", vec!["a".into()])
        .order("id")
        .find()
        .await
        .unwrap();
    let bodies: Vec<Vec<&str>> = posts
        .iter()
        .map(|p| p.comments.iter().map(|c| c.body.as_str()).collect())
        .collect();
    assert_eq!(bodies, vec![vec!["b"], vec![], vec!["c"]]);

    let posts: Vec<Post> = db
        .clone()
        .preload_with("comments", |query| query.order("id desc"))
        .order("id")
        .find()
        .await
        .unwrap();
    assert_eq!(posts[0].comments[0].body, "b");
}

#[tokio::test]
async fn test_many_to_many_preload_groups_by_owner() {
    let db = migrated_db().await;
    let mut alice = User {
        name: "alice".to_string(),
        languages: vec![Language::named("EN"), Language::named("DE")],
        ..Default::default()
    };
    db.create(&mut alice).await.unwrap();
    let mut bob = User {
        name: "bob".to_string(),
        ..Default::default()
    };
    db.create(&mut bob).await.unwrap();
    let english = alice.languages[0].clone();
    db.association(&mut bob, "languages").append(vec![english]).await.unwrap();
    let mut carol = User {
        name: "carol".to_string(),
        ..Default::default()
    };
    db.create(&mut carol).await.unwrap();

    let users: Vec<User> = db.clone().preload("languages").order("id").find().await.unwrap();
    let names: Vec<Vec<&str>> = users
        .iter()
        .map(|u| {
            let mut names: Vec<&str> = u.languages.iter().map(|l| l.name.as_str()).collect();
            names.sort();
            names
        })
        .collect();
    assert_eq!(names, vec![vec!["DE", "EN"], vec!["EN"], vec![]]);
}

#[tokio::test]
async fn test_small_batches_cover_every_owner() {
    init_tracing();
    let config = tether_orm::OrmConfig::new()
        .with_pool(tether_orm::DatabasePoolConfig::single_connection())
        .with_preload_batch_size(1);
    let db = tether_orm::Db::connect("sqlite::memory:", config).await.unwrap();
    db.auto_migrate::<Post>().await.unwrap();
    db.auto_migrate::<Comment>().await.unwrap();
    seed_posts(&db).await;

    let posts: Vec<Post> = db.clone().preload("comments").order("id").find().await.unwrap();
    let counts: Vec<usize> = posts.iter().map(|p| p.comments.len()).collect();
    assert_eq!(counts, vec![2, 0, 1]);
}

#[tokio::test]
async fn test_unknown_preload_field_is_an_error() {
    let db = migrated_db().await;
    seed_posts(&db).await;

    let outcome = db.clone().preload("title").find::<Post>().await;
    assert!(matches!(outcome, Err(ModelError::Query(_))));
}
