//! IndexStore over the Qdrant backend, against an in-process server that
//! speaks the subset of the Qdrant REST API the backend uses.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};

use docsync::config::{BackendKind, QdrantConfig, StoreConfig};
use docsync::embedding::cosine_similarity;
use docsync::error::Error;
use docsync::hash::{chunk_id, content_hash};
use docsync::models::{Chunk, ChunkMetadata};
use docsync::store::qdrant::QdrantBackend;
use docsync::store::{IndexStore, UpsertOutcome};

const COLLECTION: &str = "acme_1_0";

#[derive(Default)]
struct MockQdrant {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    exists: bool,
    indexed_fields: Vec<String>,
    /// Point id -> (vector, payload), iterated in id order like Qdrant scroll.
    points: BTreeMap<String, (Vec<f32>, Value)>,
    scroll_calls: usize,
}

impl MockQdrant {
    fn content_points(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .points
            .values()
            .filter(|(_, payload)| payload["is_metadata"] == json!(false))
            .count()
    }

    fn scroll_calls(&self) -> usize {
        self.state.lock().unwrap().scroll_calls
    }
}

type Shared = Arc<MockQdrant>;

fn ok(result: Value) -> Json<Value> {
    Json(json!({ "result": result, "status": "ok", "time": 0.0 }))
}

fn condition_holds(cond: &Value, payload: &Value) -> bool {
    let field = &payload[cond["key"].as_str().unwrap_or_default()];
    let matcher = &cond["match"];
    match matcher.get("any").and_then(Value::as_array) {
        Some(any) => any.contains(field),
        None => &matcher["value"] == field,
    }
}

fn filter_holds(filter: &Value, payload: &Value) -> bool {
    let must = filter["must"]
        .as_array()
        .map_or(true, |conds| conds.iter().all(|c| condition_holds(c, payload)));
    let must_not = filter["must_not"]
        .as_array()
        .map_or(false, |conds| conds.iter().any(|c| condition_holds(c, payload)));
    must && !must_not
}

fn as_vector(value: &Value) -> Vec<f32> {
    value
        .as_array()
        .map(|xs| xs.iter().filter_map(Value::as_f64).map(|x| x as f32).collect())
        .unwrap_or_default()
}

async fn get_collection(State(mock): State<Shared>) -> Result<Json<Value>, StatusCode> {
    if mock.state.lock().unwrap().exists {
        Ok(ok(json!({ "status": "green" })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn create_collection(State(mock): State<Shared>, Json(_body): Json<Value>) -> Json<Value> {
    mock.state.lock().unwrap().exists = true;
    ok(json!(true))
}

async fn create_index(State(mock): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let field = body["field_name"].as_str().unwrap_or_default().to_string();
    let mut state = mock.state.lock().unwrap();
    if !state.indexed_fields.contains(&field) {
        state.indexed_fields.push(field);
    }
    ok(json!({ "status": "acknowledged" }))
}

async fn upsert_points(State(mock): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let mut state = mock.state.lock().unwrap();
    for point in body["points"].as_array().cloned().unwrap_or_default() {
        let id = point["id"].as_str().unwrap_or_default().to_string();
        state
            .points
            .insert(id, (as_vector(&point["vector"]), point["payload"].clone()));
    }
    ok(json!({ "status": "completed" }))
}

async fn get_point(
    State(mock): State<Shared>,
    Path((_collection, id)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let state = mock.state.lock().unwrap();
    match state.points.get(&id) {
        Some((_, payload)) => Ok(ok(json!({ "id": id, "payload": payload }))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn scroll(State(mock): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let mut state = mock.state.lock().unwrap();
    state.scroll_calls += 1;
    let limit = body["limit"].as_u64().unwrap_or(10) as usize;
    let offset = body["offset"].as_str().map(str::to_string);

    let mut matching = state
        .points
        .iter()
        .filter(|(id, _)| offset.as_ref().map_or(true, |o| *id >= o))
        .filter(|(_, (_, payload))| filter_holds(&body["filter"], payload));
    let page: Vec<Value> = matching
        .by_ref()
        .take(limit)
        .map(|(id, (_, payload))| json!({ "id": id, "payload": payload }))
        .collect();
    let next = matching.next().map(|(id, _)| json!(id)).unwrap_or(Value::Null);

    ok(json!({ "points": page, "next_page_offset": next }))
}

async fn count(State(mock): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let state = mock.state.lock().unwrap();
    let count = state
        .points
        .values()
        .filter(|(_, payload)| filter_holds(&body["filter"], payload))
        .count();
    ok(json!({ "count": count }))
}

async fn delete(State(mock): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let mut state = mock.state.lock().unwrap();
    state
        .points
        .retain(|_, (_, payload)| !filter_holds(&body["filter"], payload));
    ok(json!({ "status": "completed" }))
}

async fn search(State(mock): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let state = mock.state.lock().unwrap();
    let query = as_vector(&body["vector"]);
    let limit = body["limit"].as_u64().unwrap_or(10) as usize;

    let mut scored: Vec<(f32, &String, &Value)> = state
        .points
        .iter()
        .filter(|(_, (_, payload))| filter_holds(&body["filter"], payload))
        .map(|(id, (vector, payload))| (cosine_similarity(&query, vector), id, payload))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
    scored.truncate(limit);

    ok(json!(scored
        .into_iter()
        .map(|(score, id, payload)| json!({ "id": id, "score": score, "payload": payload }))
        .collect::<Vec<_>>()))
}

static NO_PROXY: Once = Once::new();

async fn spawn_qdrant() -> (Shared, QdrantConfig) {
    // keep loopback traffic away from any configured HTTP proxy
    NO_PROXY.call_once(|| std::env::set_var("NO_PROXY", "127.0.0.1,localhost"));

    let mock: Shared = Arc::new(MockQdrant::default());
    let app = Router::new()
        .route("/collections/{name}", get(get_collection).put(create_collection))
        .route("/collections/{name}/index", put(create_index))
        .route("/collections/{name}/points", put(upsert_points))
        .route("/collections/{name}/points/scroll", post(scroll))
        .route("/collections/{name}/points/count", post(count))
        .route("/collections/{name}/points/delete", post(delete))
        .route("/collections/{name}/points/search", post(search))
        .route("/collections/{name}/points/{id}", get(get_point))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = QdrantConfig {
        url: format!("http://{}", addr),
        api_key_env: None,
        timeout_secs: 5,
        scroll_page_size: 2,
    };
    (mock, config)
}

async fn open_store() -> (Shared, IndexStore) {
    let (mock, config) = spawn_qdrant().await;
    let backend = QdrantBackend::new(&config, COLLECTION, 3).unwrap();
    let store = IndexStore::new(Box::new(backend));
    store.init_schema().await.unwrap();
    (mock, store)
}

fn chunk(url: &str, index: usize, content: &str) -> Chunk {
    Chunk {
        content: content.to_string(),
        metadata: ChunkMetadata {
            product_name: "acme".to_string(),
            version: "1.0".to_string(),
            chunk_id: chunk_id(url, index),
            url: url.to_string(),
            hash: content_hash(content),
            chunk_index: index as i64,
            total_chunks: 3,
            ..Default::default()
        },
    }
}

async fn put_chunk(store: &IndexStore, c: &Chunk, vector: &[f32]) -> UpsertOutcome {
    store.upsert_chunk(c, vector, &c.metadata.hash).await
}

#[tokio::test]
async fn test_init_schema_idempotent_with_payload_indexes() {
    let (mock, store) = open_store().await;
    store.init_schema().await.unwrap();

    let state = mock.state.lock().unwrap();
    assert!(state.exists);
    for field in ["url", "chunk_id", "repo", "is_metadata"] {
        assert!(state.indexed_fields.iter().any(|f| f == field), "missing index on {}", field);
    }
}

#[tokio::test]
async fn test_open_existing_requires_collection() {
    let (_mock, qdrant) = spawn_qdrant().await;
    let config = StoreConfig {
        backend: BackendKind::Qdrant,
        dir: PathBuf::from("unused"),
        table: "vectors".to_string(),
        qdrant,
    };

    let err = IndexStore::open_existing(&config, COLLECTION, 3).await.err().unwrap();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Validation(_))));
    assert!(err.to_string().contains("No index found"));

    IndexStore::open(&config, COLLECTION, 3)
        .await
        .unwrap()
        .init_schema()
        .await
        .unwrap();
    assert!(IndexStore::open_existing(&config, COLLECTION, 3).await.is_ok());
}

#[tokio::test]
async fn test_upsert_is_last_write_wins_without_duplicates() {
    let (mock, store) = open_store().await;

    let first = chunk("https://a/x", 0, "first version");
    let second = chunk("https://a/x", 0, "second version");
    assert_eq!(put_chunk(&store, &first, &[1.0, 0.0, 0.0]).await, UpsertOutcome::Inserted);
    assert_eq!(put_chunk(&store, &first, &[1.0, 0.0, 0.0]).await, UpsertOutcome::Unchanged);
    assert_eq!(put_chunk(&store, &second, &[0.0, 1.0, 0.0]).await, UpsertOutcome::Updated);

    assert_eq!(mock.content_points(), 1);
    let chunks = store.document_chunks("https://a/x").await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].content, "second version");
    assert_eq!(
        store.chunk_hash(&first.metadata.chunk_id).await,
        Some(content_hash("second version"))
    );
}

#[tokio::test]
async fn test_scoped_obsolescence_leaves_other_prefix_alone() {
    let (mock, store) = open_store().await;
    for url in [
        "https://site/a/one",
        "https://site/a/two",
        "https://site/a/three",
        "https://site/b/one",
        "https://site/b/two",
    ] {
        put_chunk(&store, &chunk(url, 0, url), &[1.0, 0.0, 0.0]).await;
    }

    let visited: HashSet<String> = ["https://site/a/one".to_string()].into_iter().collect();
    let deleted = store.delete_obsolete(&visited, "https://site/a/").await;

    assert_eq!(deleted, 2);
    assert_eq!(mock.content_points(), 3);
    assert_eq!(store.get_hashes_for_url("https://site/a/one").await.len(), 1);
    assert!(store.get_hashes_for_url("https://site/a/two").await.is_empty());
    assert!(store.get_hashes_for_url("https://site/a/three").await.is_empty());
    assert_eq!(store.get_hashes_for_url("https://site/b/one").await.len(), 1);
    assert_eq!(store.get_hashes_for_url("https://site/b/two").await.len(), 1);
}

#[tokio::test]
async fn test_document_chunks_follow_pages_and_sort_by_position() {
    let (mock, store) = open_store().await;
    let url = "https://a/long";
    for index in [2usize, 0, 1] {
        put_chunk(&store, &chunk(url, index, &format!("part {}", index)), &[1.0, 0.0, 0.0]).await;
    }
    put_chunk(&store, &chunk("https://a/other", 0, "other"), &[1.0, 0.0, 0.0]).await;

    let before = mock.scroll_calls();
    let chunks = store.document_chunks(url).await.unwrap();

    // three matching points with a page size of two
    assert_eq!(mock.scroll_calls() - before, 2);
    let order: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
    assert_eq!(order, vec![0, 1, 2]);
    assert_eq!(chunks[0].content, "part 0");
}

#[tokio::test]
async fn test_metadata_points_stay_out_of_content_operations() {
    let (mock, store) = open_store().await;

    assert_eq!(store.get_metadata("last_run_acme", "never").await, "never");
    assert!(store.set_metadata("last_run_acme", "2024-01-01T00:00:00Z").await);
    assert!(store.set_metadata("last_run_acme", "2024-02-01T00:00:00Z").await);
    assert_eq!(
        store.get_metadata("last_run_acme", "never").await,
        "2024-02-01T00:00:00Z"
    );

    // the dummy metadata vector points the same way as this chunk
    put_chunk(&store, &chunk("https://a/doc", 0, "body"), &[1.0, 0.0, 0.0]).await;
    let hits = store.search(&[1.0, 0.0, 0.0], 10, None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].url, "https://a/doc");

    assert_eq!(store.delete_obsolete(&HashSet::new(), "https://").await, 1);
    assert_eq!(mock.content_points(), 0);
    assert_eq!(
        store.get_metadata("last_run_acme", "never").await,
        "2024-02-01T00:00:00Z"
    );
}

#[tokio::test]
async fn test_search_filters_by_repo() {
    let (_mock, store) = open_store().await;
    let mut widgets = chunk("https://code/widgets/lib.rs", 0, "fn widget() {}");
    widgets.metadata.repo = Some("acme/widgets".to_string());
    let mut gadgets = chunk("https://code/gadgets/lib.rs", 0, "fn gadget() {}");
    gadgets.metadata.repo = Some("acme/gadgets".to_string());
    put_chunk(&store, &widgets, &[1.0, 0.0, 0.0]).await;
    put_chunk(&store, &gadgets, &[0.9, 0.1, 0.0]).await;

    let hits = store
        .search(&[1.0, 0.0, 0.0], 10, Some("acme/gadgets"))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].repo, "acme/gadgets");
    assert!(hits[0].distance >= 0.0);
}
