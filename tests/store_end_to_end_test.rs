//! End-to-end tests against a SQLite database file.

use sqlstore::config::StoreConfig;
use sqlstore::db::{SqliteDriver, Value};
use sqlstore::logging::init_tracing;
use sqlstore::models::KeyValue;
use sqlstore::query::{AggregationFunction, AggregationNode, EntityNode, SelectClause};
use sqlstore::store::Store;
use std::sync::Arc;
use tempfile::NamedTempFile;

const AUTHORS: i64 = 1000;
const SELECT_AUTHORS: &str =
    "SELECT id AS Author_id, name AS Author_name, age AS Author_age FROM author ORDER BY id";

async fn author_store(temp_file: &NamedTempFile) -> Store<SqliteDriver> {
    let config = StoreConfig::for_url(format!(
        "sqlite:{}",
        temp_file.path().to_str().unwrap()
    ));
    // Another test may have installed the subscriber already.
    let _ = init_tracing(&config);

    let store = Store::connect_sqlite(&config).await.unwrap();
    store
        .define_entity_json(
            "Author",
            &serde_json::json!({
                "table": "author",
                "id": {"column": "id", "sequence": "author_id"},
                "properties": {
                    "name": {"type": "string", "nullable": false},
                    "age": {"type": "integer"}
                }
            }),
        )
        .unwrap();

    store
        .execute("CREATE TABLE author (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER)")
        .await
        .unwrap();
    let values: Vec<String> = (1..=AUTHORS)
        .map(|id| format!("({}, 'author {}', {})", id, id, 20 + id % 50))
        .collect();
    let inserted = store
        .execute(&format!(
            "INSERT INTO author (id, name, age) VALUES {}",
            values.join(", ")
        ))
        .await
        .unwrap();
    assert_eq!(inserted, AUTHORS as u64);
    store
}

#[tokio::test]
async fn test_select_all_entities_in_cursor_order() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = author_store(&temp_file).await;

    let results = store
        .query(
            "SELECT id AS Author_id FROM author ORDER BY id",
            &SelectClause::single(EntityNode::new("Author")),
        )
        .await
        .unwrap();

    assert_eq!(results.len(), AUTHORS as usize);
    for (expected, value) in (1..=AUTHORS).zip(&results) {
        let entity = value.as_entity().unwrap();
        assert_eq!(entity.id(), &KeyValue::Integer(expected));
        assert!(!entity.is_loaded());
    }
    assert_eq!(store.pool().size(), 1);
    store.close().await;
}

#[tokio::test]
async fn test_identity_preserved_across_queries() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = author_store(&temp_file).await;
    let clause = SelectClause::single(EntityNode::eager("Author"));

    let first = store.query(SELECT_AUTHORS, &clause).await.unwrap();
    let second = store.query(SELECT_AUTHORS, &clause).await.unwrap();
    assert_eq!(first.len(), AUTHORS as usize);

    for (a, b) in first.iter().zip(&second) {
        let (a, b) = (a.as_entity().unwrap(), b.as_entity().unwrap());
        assert!(a.same_representation(b));
    }
    let author = first[41].as_entity().unwrap();
    assert_eq!(author.get("name"), Some(&Value::Text("author 42".into())));
    assert_eq!(author.get("age"), Some(&Value::Integer(62)));

    // The store cache is sized above the result set: nothing evicted.
    let stats = store.cache_stats().unwrap();
    assert_eq!(stats.len, AUTHORS as usize);
    assert_eq!(stats.evictions, 0);
    assert_eq!(stats.hits, AUTHORS as u64);
    store.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_queries_share_cache() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = Arc::new(author_store(&temp_file).await);
    let clause = SelectClause::single(EntityNode::eager("Author"));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let store = Arc::clone(&store);
        let clause = clause.clone();
        tasks.push(tokio::spawn(async move {
            store.query(SELECT_AUTHORS, &clause).await
        }));
    }
    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }

    for rows in &results[1..] {
        assert_eq!(rows.len(), AUTHORS as usize);
        for (a, b) in results[0].iter().zip(rows) {
            assert!(a.as_entity().unwrap().same_representation(b.as_entity().unwrap()));
        }
    }
    assert!(store.pool().size() <= 4);
    assert_eq!(store.pool().active_count(), 0);
    store.close().await;
}

#[tokio::test]
async fn test_aggregate_query() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = author_store(&temp_file).await;

    let results = store
        .query(
            "SELECT count(id) AS count_Author_id, avg(age) AS avg_Author_age FROM author",
            &SelectClause::new(vec![
                AggregationNode::count("Author").into(),
                AggregationNode::new(AggregationFunction::Avg, "Author", "age").into(),
            ]),
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].to_json(),
        serde_json::json!({"count(Author)": 1000, "avg(Author.age)": 44.5})
    );
    store.close().await;
}
