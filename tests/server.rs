use futures_util::StreamExt;
use repo_ask::agent::ScriptedBackend;
use repo_ask::ask::{AskRequest, Asker};
use repo_ask::client::RemoteClient;
use repo_ask::collection::CollectionAssembler;
use repo_ask::config::Config;
use repo_ask::events::AgentEvent;
use repo_ask::models::{QuestionStatus, ResourceDefinition, ToolState};
use repo_ask::sse::{Transcript, WireEvent};
use repo_ask::threads::ThreadStore;
use repo_ask::{db, migrate, server};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct TestServer {
    _tmp: TempDir,
    base_url: String,
    asker: Arc<Asker>,
}

fn text(id: &str, text: &str) -> AgentEvent {
    AgentEvent::TextPart {
        part_id: id.into(),
        message_id: None,
        text: Some(text.into()),
        delta: None,
    }
}

async fn start_server(backend: ScriptedBackend) -> TestServer {
    let tmp = TempDir::new().unwrap();
    let mut resources = Vec::new();
    for name in ["svelte", "effect"] {
        let dir = tmp.path().join("repos").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("README.md"), format!("# {}\n", name)).unwrap();
        resources.push(ResourceDefinition::Local {
            name: name.into(),
            path: dir,
            notes: String::new(),
        });
    }
    let mut config = Config::with_resources(resources);
    config.storage.resources_dir = tmp.path().join("resources");
    config.storage.collections_dir = tmp.path().join("collections");

    let pool = db::connect_in_memory().await.unwrap();
    migrate::migrate(&pool).await.unwrap();
    let asker = Arc::new(Asker::new(
        config.agent.clone(),
        Arc::new(CollectionAssembler::from_config(&config)),
        Arc::new(backend),
        ThreadStore::new(pool),
    ));

    let app = server::router(Arc::new(config), asker.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        _tmp: tmp,
        base_url: format!("http://{}", addr),
        asker,
    }
}

fn request(question: &str, resources: &[&str]) -> AskRequest {
    AskRequest {
        question: question.into(),
        resources: resources.iter().map(|r| r.to_string()).collect(),
        ..AskRequest::default()
    }
}

async fn collect(server: &TestServer, request: &AskRequest) -> Vec<WireEvent> {
    let client = RemoteClient::new(&server.base_url).unwrap();
    let stream = client.ask_stream(request).await.unwrap();
    stream.map(|event| event.unwrap()).collect().await
}

#[tokio::test]
async fn test_health() {
    let server = start_server(ScriptedBackend::new(vec![])).await;
    let client = RemoteClient::new(&server.base_url).unwrap();
    assert!(client.health().await.unwrap());
}

#[tokio::test]
async fn test_resources_listed() {
    let server = start_server(ScriptedBackend::new(vec![])).await;
    let body: serde_json::Value = reqwest::get(format!("{}/resources", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["svelte", "effect"]);
    assert_eq!(body[0]["type"], "local");
}

#[tokio::test]
async fn test_question_streams_in_order() {
    let backend = ScriptedBackend::new(vec![
        AgentEvent::ToolPart {
            call_id: "c1".into(),
            tool: "grep".into(),
            state: ToolState::Running,
        },
        text("p1", "Hel"),
        AgentEvent::ToolPart {
            call_id: "c1".into(),
            tool: "grep".into(),
            state: ToolState::Completed,
        },
        text("p1", "Hello"),
        AgentEvent::Idle,
    ]);
    let server = start_server(backend.clone()).await;

    let events = collect(&server, &request("what is this?", &["svelte", "effect"])).await;

    match &events[0] {
        WireEvent::Meta {
            collection_key,
            resources,
            ..
        } => {
            assert_eq!(collection_key, "effect+svelte");
            assert_eq!(resources, &vec!["effect".to_string(), "svelte".to_string()]);
        }
        other => panic!("expected meta first, got {:?}", other),
    }
    // meta, add tool, add text, update tool, update text, done
    assert_eq!(events.len(), 6);

    let mut transcript = Transcript::new();
    for event in &events {
        transcript.apply(event);
    }
    assert_eq!(transcript.answer(), "Hello");
    assert_eq!(transcript.final_answer(), Some("Hello"));
    assert_eq!(transcript.status(), Some(QuestionStatus::Completed));
    assert!(transcript.question_id().is_some());

    assert_eq!(backend.log().closes, 1);
}

#[tokio::test]
async fn test_thread_endpoints() {
    let backend = ScriptedBackend::new(vec![text("p1", "Answer"), AgentEvent::Idle]);
    let server = start_server(backend).await;
    collect(&server, &request("first", &["svelte"])).await;

    let threads: serde_json::Value = reqwest::get(format!("{}/threads", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(threads.as_array().unwrap().len(), 1);
    assert_eq!(threads[0]["title"], "first");
    let id = threads[0]["id"].as_str().unwrap().to_string();

    let mut follow_up = request("second", &["effect"]);
    follow_up.thread_id = Some(id.clone());
    let events = collect(&server, &follow_up).await;
    match &events[0] {
        WireEvent::Meta {
            collection_key,
            thread_id,
            ..
        } => {
            assert_eq!(collection_key, "effect+svelte");
            assert_eq!(thread_id, &id);
        }
        other => panic!("expected meta first, got {:?}", other),
    }

    let thread: serde_json::Value = reqwest::get(format!("{}/threads/{}", server.base_url, id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let questions = thread["questions"].as_array().unwrap();
    assert_eq!(questions.len(), 2);
    assert_eq!(questions[0]["answer"], "Answer");
    assert_eq!(questions[1]["order"], 1);
    assert_eq!(questions[1]["status"], "completed");

    let client = reqwest::Client::new();
    let response = client
        .delete(format!("{}/threads/{}", server.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    let response = reqwest::get(format!("{}/threads/{}", server.base_url, id))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_unknown_resource_is_bad_request() {
    let backend = ScriptedBackend::new(vec![AgentEvent::Idle]);
    let server = start_server(backend.clone()).await;

    let client = RemoteClient::new(&server.base_url).unwrap();
    let err = match client.ask_stream(&request("q", &["react"])).await {
        Ok(_) => panic!("expected the question to be rejected"),
        Err(err) => err,
    };
    let message = err.to_string();
    assert!(message.contains("bad_request"), "{}", message);
    assert!(message.contains("react"), "{}", message);

    let response = reqwest::Client::new()
        .post(format!("{}/question/stream", server.base_url))
        .json(&serde_json::json!({ "question": "q", "resources": ["svelte"], "thread_id": "nope" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    assert!(backend.log().started_in.is_empty());
}

#[tokio::test]
async fn test_agent_failure_ends_with_error_event() {
    let backend = ScriptedBackend::new(vec![text("p1", "Half")]).then_fail("connection reset");
    let server = start_server(backend).await;

    let events = collect(&server, &request("q", &["svelte"])).await;
    match events.last() {
        Some(WireEvent::Error { message }) => assert!(message.contains("connection reset")),
        other => panic!("expected error last, got {:?}", other),
    }

    let threads = server.asker.store().list_threads().await.unwrap();
    let thread = server
        .asker
        .store()
        .get_thread(&threads[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(thread.questions[0].status, QuestionStatus::Failed);
    assert_eq!(thread.questions[0].answer, "Half");
}

#[tokio::test]
async fn test_disconnect_cancels_question() {
    let events: Vec<AgentEvent> = (1..=300).map(|n| text("p1", &"x".repeat(n))).collect();
    let backend = ScriptedBackend::new(events)
        .with_delay(Duration::from_millis(20))
        .hold_open();
    let server = start_server(backend.clone()).await;

    let client = RemoteClient::new(&server.base_url).unwrap();
    let mut stream = client.ask_stream(&request("q", &["svelte"])).await.unwrap();
    while let Some(event) = stream.next().await {
        if matches!(event.unwrap(), WireEvent::Add { .. }) {
            break;
        }
    }
    let store = server.asker.store();
    let threads = store.list_threads().await.unwrap();
    let streaming = store.get_thread(&threads[0].id).await.unwrap().unwrap();
    assert_eq!(streaming.questions[0].status, QuestionStatus::Streaming);
    assert_eq!(streaming.questions[0].prompt, "q");

    drop(stream);

    let mut recorded = None;
    for _ in 0..200 {
        let threads = store.list_threads().await.unwrap();
        if let Some(summary) = threads.first() {
            let thread = store.get_thread(&summary.id).await.unwrap().unwrap();
            if thread.questions.first().map(|q| q.status) == Some(QuestionStatus::Canceled) {
                recorded = Some(thread);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let thread = recorded.expect("question was never canceled");
    assert!(thread.questions[0].answer.starts_with('x'));
    let log = backend.log();
    assert_eq!(log.aborts, 1);
    assert_eq!(log.closes, 1);
}
