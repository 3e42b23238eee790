//! End-to-end runs: local HTTP stub, real HTTP fetcher, `SQLite` file.

use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;

use ingestflow::config::{parse_config_str, AppConfig};
use ingestflow::core::RunStatus;
use ingestflow::events::CollectingEventSink;
use ingestflow::testing::{count_rows, sample_post, sample_posts, StubResponse, StubServer};
use ingestflow::Orchestrator;

async fn start_upstream() -> StubServer {
    StubServer::start(|path| match path {
        "/posts" => {
            let mut items = sample_posts(3);
            if let Some(list) = items.as_array_mut() {
                list.push(json!({ "title": "no id", "body": "dropped" }));
            }
            StubResponse::json(items.to_string())
        }
        "/users/1" | "/users/2" => {
            let id = path.trim_start_matches("/users/").parse().unwrap_or(0);
            StubResponse::json(sample_post(id).to_string())
        }
        "/broken" => StubResponse::status(500),
        _ => StubResponse::status(404),
    })
    .await
    .unwrap()
}

fn config_for(base_url: &str, dir: &Path) -> AppConfig {
    let yaml = format!(
        r#"
retry:
  max_attempts: 2
  initial_delay_ms: 10
http:
  timeout_seconds: 2.0
database:
  backend: sqlite
  path: "{db}"
  events_table: run_events
output:
  render_status_graph: true
  status_graph_path: "{graph}"
pipelines:
  - name: posts
    mode: single-fetch
    base_url: {base_url}
    endpoint: /posts
    table: posts
    batch_size: 2
  - name: users
    mode: multi-fetch
    base_url: {base_url}
    url_pattern: /users/{{id}}
    id_range: {{ start: 1, end: 3 }}
    table: users
  - name: broken
    mode: single-fetch
    base_url: {base_url}
    endpoint: /broken
    table: broken
  - name: mystery
    mode: streaming
    base_url: {base_url}
    table: mystery
  - name: archived
    enabled: false
    mode: single-fetch
    base_url: {base_url}
    endpoint: /archived
    table: archived
"#,
        db = dir.join("ingest.db").display(),
        graph = dir.join("docs").join("ingestion_dag.md").display(),
    );
    parse_config_str(&yaml).unwrap()
}

#[tokio::test]
async fn test_config_run_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = start_upstream().await;
    let config = config_for(&upstream.base_url(), dir.path());
    let sink = Arc::new(CollectingEventSink::new());

    let orchestrator = Orchestrator::from_config(&config, sink.clone()).unwrap();
    let report = orchestrator.run_config(&config).await.unwrap();

    assert_eq!(report.outcomes.len(), 4);
    assert_eq!(report.statuses.get("posts"), Some(&RunStatus::Success));
    assert_eq!(report.statuses.get("users"), Some(&RunStatus::Success));
    assert_eq!(report.statuses.get("broken"), Some(&RunStatus::Failed));
    assert_eq!(report.statuses.get("mystery"), Some(&RunStatus::Failed));
    assert!(report.outcome("archived").is_none());

    let posts = report.outcome("posts").unwrap();
    assert_eq!((posts.records, posts.rejected), (3, 1));
    assert_eq!(report.outcome("users").unwrap().records, 2);

    assert_eq!(upstream.hits("/broken"), 2);
    assert_eq!(upstream.hits("/users/3"), 2);
    assert_eq!(upstream.hits("/archived"), 0);

    let db = ingestflow::persistence::open_database(&config.database).unwrap();
    assert_eq!(count_rows(db.as_ref(), "posts").unwrap(), 3);
    assert_eq!(count_rows(db.as_ref(), "users").unwrap(), 2);

    let events = orchestrator.event_store();
    assert_eq!(events.table(), "run_events");
    let latest = events.latest_statuses().unwrap();
    assert_eq!(latest.get("broken"), Some(&RunStatus::Failed));
    assert_eq!(latest.get("posts"), Some(&RunStatus::Success));
    assert_eq!(events.events_for("mystery").unwrap().len(), 2);

    let graph =
        std::fs::read_to_string(dir.path().join("docs").join("ingestion_dag.md")).unwrap();
    assert!(graph.starts_with("```mermaid\ngraph LR\n"));
    assert!(graph.contains("  class posts success;\n"));
    assert!(graph.contains("  class broken failed;\n"));
    assert!(graph.contains("  class archived pending;\n"));

    assert_eq!(sink.events_of_type("validation.rejected").len(), 1);
    assert_eq!(sink.events_of_type("orchestrator.completed").len(), 1);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = start_upstream().await;
    let mut config = config_for(&upstream.base_url(), dir.path());
    config.output.render_status_graph = false;

    let orchestrator = Orchestrator::from_config(&config, Arc::new(CollectingEventSink::new()))
        .unwrap();
    orchestrator.run_config(&config).await.unwrap();
    orchestrator.run_config(&config).await.unwrap();

    let db = ingestflow::persistence::open_database(&config.database).unwrap();
    assert_eq!(count_rows(db.as_ref(), "posts").unwrap(), 3);
    assert_eq!(
        orchestrator.event_store().events_for("posts").unwrap().len(),
        4
    );
    assert!(!dir.path().join("docs").exists());
}

#[tokio::test]
async fn test_duplicate_names_fail_before_any_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = start_upstream().await;
    let mut config = config_for(&upstream.base_url(), dir.path());
    let mut twin = config.pipelines[0].clone();
    twin.table = "posts_copy".to_string();
    config.pipelines.push(twin);

    let orchestrator = Orchestrator::from_config(&config, Arc::new(CollectingEventSink::new()))
        .unwrap();
    let err = orchestrator.run_config(&config).await.unwrap_err();

    assert!(err.to_string().contains("duplicate pipeline name"));
    assert_eq!(upstream.hits("/posts"), 0);
    assert!(!dir.path().join("docs").exists());
}
