//! Functional tests driving the HTTP surface and the event channel.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use relay_events::{FanoutHub, WebhookNotifier};
use relay_knowledge::{KnowledgeService, KnowledgeServiceConfig};
use relay_lifecycle::RequestService;
use relay_memory::{MemoryGateway, MemoryHitMetadata, MemorySearchHit, MemoryWriteMetadata};
use relay_store::SqliteStore;

use super::{build_router, AppState};

#[derive(Default)]
struct ScriptedGateway {
    hits: Mutex<Vec<MemorySearchHit>>,
}

#[async_trait]
impl MemoryGateway for ScriptedGateway {
    async fn add(
        &self,
        _question: &str,
        _answer: &str,
        _metadata: &MemoryWriteMetadata,
    ) -> Result<String> {
        Ok("mem-scripted".to_string())
    }

    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<MemorySearchHit>> {
        let hits = self.hits.lock().expect("hits lock");
        Ok(hits.iter().take(limit).cloned().collect())
    }

    async fn update(
        &self,
        _memory_id: &str,
        _content: &str,
        _metadata: &MemoryWriteMetadata,
    ) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _memory_id: &str) -> Result<()> {
        Ok(())
    }
}

struct TestServer {
    _tempdir: tempfile::TempDir,
    addr: SocketAddr,
    gateway: Arc<ScriptedGateway>,
    _handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

async fn spawn_test_server() -> Result<TestServer> {
    let tempdir = tempfile::tempdir().context("tempdir")?;
    let store = Arc::new(SqliteStore::new(tempdir.path().join("relay.sqlite")).context("store")?);
    let hub = Arc::new(FanoutHub::new());
    let notifier = Arc::new(WebhookNotifier::new(None));
    let gateway = Arc::new(ScriptedGateway::default());
    let (knowledge, worker) = KnowledgeService::new(
        Arc::clone(&store),
        Arc::clone(&gateway) as Arc<dyn MemoryGateway>,
        Arc::clone(&hub),
        KnowledgeServiceConfig {
            index_retry_base_delay_ms: 1,
            ..KnowledgeServiceConfig::default()
        },
    );
    tokio::spawn(worker.run());
    let requests = RequestService::new(
        Arc::clone(&store),
        Arc::clone(&knowledge),
        Arc::clone(&hub),
        notifier,
    );
    let state = AppState::new(requests, knowledge, store, hub, None);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind ephemeral listener")?;
    let addr = listener.local_addr().context("resolve listener addr")?;
    let app = build_router(state);
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    Ok(TestServer {
        _tempdir: tempdir,
        addr,
        gateway,
        _handle: handle,
    })
}

async fn post_json(url: &str, body: Value) -> Result<(u16, Value)> {
    let response = reqwest::Client::new()
        .post(url)
        .json(&body)
        .send()
        .await
        .context("post")?;
    let status = response.status().as_u16();
    let body: Value = response.json().await.context("decode body")?;
    Ok((status, body))
}

async fn patch_json(url: &str, body: Value) -> Result<(u16, Value)> {
    let response = reqwest::Client::new()
        .patch(url)
        .json(&body)
        .send()
        .await
        .context("patch")?;
    let status = response.status().as_u16();
    let body: Value = response.json().await.context("decode body")?;
    Ok((status, body))
}

async fn get_json(url: &str) -> Result<(u16, Value)> {
    let response = reqwest::get(url).await.context("get")?;
    let status = response.status().as_u16();
    let body: Value = response.json().await.context("decode body")?;
    Ok((status, body))
}

fn create_body() -> Value {
    json!({
        "question": "Do you open Sundays?",
        "customerPhone": "+15551234567",
    })
}

#[tokio::test]
async fn functional_escalation_round_trip_lands_in_knowledge_base() {
    let server = spawn_test_server().await.expect("server");

    // Create a help request.
    let (status, body) = post_json(&server.url("/help-requests"), create_body())
        .await
        .expect("create");
    assert_eq!(status, 201);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "pending");
    let request_id = body["data"]["id"].as_str().expect("id").to_string();
    let created = body["data"]["createdUnixMs"].as_u64().expect("created");
    let timeout_at = body["data"]["timeoutAtUnixMs"].as_u64().expect("timeout");
    assert_eq!(timeout_at, created + 30 * 60_000);

    // It shows up pending in the listing.
    let (status, body) = get_json(&server.url("/help-requests?status=pending"))
        .await
        .expect("list");
    assert_eq!(status, 200);
    assert_eq!(body["pagination"]["total"], 1);
    assert_eq!(body["data"][0]["id"], request_id.as_str());

    // Resolve it.
    let (status, body) = patch_json(
        &server.url(&format!("/help-requests/{request_id}/resolve")),
        json!({ "answer": "No, closed Sundays.", "category": "hours" }),
    )
    .await
    .expect("resolve");
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], "resolved");
    assert_eq!(body["kbEntry"]["category"], "hours");
    assert_eq!(body["kbEntry"]["source"], "learned");
    assert_eq!(body["kbEntry"]["sourceRequestId"], request_id.as_str());

    // The promoted entry is visible under its category.
    let (status, body) = get_json(&server.url("/knowledge-base?category=hours"))
        .await
        .expect("kb list");
    assert_eq!(status, 200);
    assert_eq!(body["count"], 1);
    assert_eq!(body["data"][0]["question"], "Do you open Sundays?");
}

#[tokio::test]
async fn functional_validation_and_lookup_failures_map_to_status_codes() {
    let server = spawn_test_server().await.expect("server");

    let (status, body) = post_json(
        &server.url("/help-requests"),
        json!({ "customerPhone": "+15551234567" }),
    )
    .await
    .expect("create");
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "validation_error");

    let (status, body) = get_json(&server.url("/help-requests/req-missing"))
        .await
        .expect("get");
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _) = patch_json(
        &server.url("/help-requests/req-missing/resolve"),
        json!({ "answer": "A" }),
    )
    .await
    .expect("resolve");
    assert_eq!(status, 404);

    let (status, body) = get_json(&server.url("/help-requests?status=bogus"))
        .await
        .expect("list");
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn functional_second_transition_conflicts() {
    let server = spawn_test_server().await.expect("server");
    let (_, body) = post_json(&server.url("/help-requests"), create_body())
        .await
        .expect("create");
    let request_id = body["data"]["id"].as_str().expect("id").to_string();

    let (status, body) = patch_json(
        &server.url(&format!("/help-requests/{request_id}/unresolved")),
        json!({ "reason": "no supervisor available" }),
    )
    .await
    .expect("unresolved");
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], "unresolved");
    assert_eq!(body["data"]["supervisorNotes"], "no supervisor available");

    let (status, body) = patch_json(
        &server.url(&format!("/help-requests/{request_id}/unresolved")),
        json!({}),
    )
    .await
    .expect("unresolved again");
    assert_eq!(status, 409);
    assert_eq!(body["error"]["code"], "conflict");

    let (status, _) = patch_json(
        &server.url(&format!("/help-requests/{request_id}/resolve")),
        json!({ "answer": "late answer" }),
    )
    .await
    .expect("resolve after unresolved");
    assert_eq!(status, 409);
}

#[tokio::test]
async fn functional_hard_delete_succeeds() {
    let server = spawn_test_server().await.expect("server");
    let (_, body) = post_json(&server.url("/help-requests"), create_body())
        .await
        .expect("create");
    let request_id = body["data"]["id"].as_str().expect("id").to_string();

    let response = reqwest::Client::new()
        .delete(server.url(&format!("/help-requests/{request_id}")))
        .send()
        .await
        .expect("delete");
    assert_eq!(response.status().as_u16(), 200);

    let (status, _) = get_json(&server.url(&format!("/help-requests/{request_id}")))
        .await
        .expect("get");
    assert_eq!(status, 404);
}

fn scripted_hit(memory_id: &str, question: &str, answer: &str, score: f64) -> MemorySearchHit {
    MemorySearchHit {
        memory_id: memory_id.to_string(),
        content: format!("Question: {question}\nAnswer: {answer}"),
        score,
        metadata: MemoryHitMetadata {
            question: Some(question.to_string()),
            category: Some("hours".to_string()),
            source: Some("learned".to_string()),
            tags: Vec::new(),
        },
    }
}

#[tokio::test]
async fn functional_knowledge_search_and_agent_check() {
    let server = spawn_test_server().await.expect("server");
    *server.gateway.hits.lock().expect("hits") = vec![
        scripted_hit("mem-a", "Hours?", "Open 9 to 7.", 0.92),
        scripted_hit("mem-b", "Sundays?", "Closed Sundays.", 0.61),
    ];

    let (status, body) = get_json(&server.url("/knowledge-base/search?q=hours"))
        .await
        .expect("search");
    assert_eq!(status, 200);
    assert_eq!(body["results"][0]["memoryId"], "mem-a");
    assert_eq!(body["results"][0]["answer"], "Open 9 to 7.");

    let (status, body) = get_json(&server.url("/knowledge-base/search"))
        .await
        .expect("search without q");
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "validation_error");

    let (status, body) = post_json(
        &server.url("/agent/check-knowledge"),
        json!({ "question": "when are you open" }),
    )
    .await
    .expect("check");
    assert_eq!(status, 200);
    assert_eq!(body["found"], true);
    assert_eq!(body["answer"], "Open 9 to 7.");
    assert_eq!(body["alternatives"].as_array().expect("alts").len(), 1);

    *server.gateway.hits.lock().expect("hits") = Vec::new();
    let (status, body) = post_json(
        &server.url("/agent/check-knowledge"),
        json!({ "question": "anything" }),
    )
    .await
    .expect("check miss");
    assert_eq!(status, 200);
    assert_eq!(body["found"], false);
    assert_eq!(body["suggestEscalation"], true);
}

#[tokio::test]
async fn functional_agent_escalate_and_track_usage() {
    let server = spawn_test_server().await.expect("server");

    let (status, body) = post_json(&server.url("/agent/escalate"), create_body())
        .await
        .expect("escalate");
    assert_eq!(status, 201);
    assert_eq!(body["estimatedResponseTime"], "30 minutes");
    assert!(body["requestId"].as_str().is_some());

    let (status, body) = post_json(&server.url("/agent/track-usage"), json!({}))
        .await
        .expect("track without id");
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "validation_error");

    let (status, body) = post_json(
        &server.url("/agent/track-usage"),
        json!({ "kbEntryId": "kb-anything" }),
    )
    .await
    .expect("track");
    assert_eq!(status, 200);
    assert_eq!(body["message"], "Usage tracked");
}

#[tokio::test]
async fn functional_dashboard_stats_shape() {
    let server = spawn_test_server().await.expect("server");
    let (_, body) = post_json(&server.url("/help-requests"), create_body())
        .await
        .expect("create");
    let request_id = body["data"]["id"].as_str().expect("id").to_string();
    patch_json(
        &server.url(&format!("/help-requests/{request_id}/resolve")),
        json!({ "answer": "No." }),
    )
    .await
    .expect("resolve");

    let (status, body) = get_json(&server.url("/dashboard/stats"))
        .await
        .expect("stats");
    assert_eq!(status, 200);
    assert_eq!(body["stats"]["helpRequests"]["resolved"], 1);
    assert_eq!(body["stats"]["helpRequests"]["pending"], 0);
    assert_eq!(body["stats"]["knowledgeBase"]["total"], 1);
    assert_eq!(body["stats"]["knowledgeBase"]["learned"], 1);
    assert!(body["stats"]["responseTime"]["average"]
        .as_str()
        .expect("average")
        .ends_with("minutes"));

    let (status, body) = get_json(&server.url("/dashboard/analytics"))
        .await
        .expect("analytics");
    assert_eq!(status, 200);
    assert_eq!(body["analytics"]["totalRequests"], 1);
    assert_eq!(body["analytics"]["resolvedRequests"], 1);
    assert_eq!(body["analytics"]["resolutionRate"], 1.0);
    assert_eq!(body["analytics"]["topQuestions"][0]["count"], 1);

    let (status, _) = get_json(&server.url("/dashboard/analytics?startDate=nonsense"))
        .await
        .expect("analytics bad date");
    assert_eq!(status, 400);
}

#[tokio::test]
async fn functional_health_reports_uptime() {
    let server = spawn_test_server().await.expect("server");
    let (status, body) = get_json(&server.url("/health")).await.expect("health");
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert!(body["uptimeSeconds"].as_u64().is_some());
}

async fn recv_ws_json(
    stream: &mut (impl StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> Result<Value> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .context("websocket read timed out")?
            .context("websocket closed")?
            .context("websocket error")?;
        match message {
            Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => bail!("unexpected websocket message: {other:?}"),
        }
    }
}

#[tokio::test]
async fn functional_event_channel_broadcasts_lifecycle_events() {
    let server = spawn_test_server().await.expect("server");

    let (mut stream, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr))
        .await
        .expect("connect ws");

    let info = recv_ws_json(&mut stream).await.expect("connection info");
    assert_eq!(info["kind"], "connection_info");

    stream
        .send(Message::Text(r#"{"kind":"subscribe"}"#.into()))
        .await
        .expect("subscribe");
    let subscribed = recv_ws_json(&mut stream).await.expect("subscribed");
    assert_eq!(subscribed["kind"], "subscribed");
    assert_eq!(subscribed["payload"]["room"], "supervisor");

    post_json(&server.url("/help-requests"), create_body())
        .await
        .expect("create");

    let event = recv_ws_json(&mut stream).await.expect("event frame");
    assert_eq!(event["kind"], "event");
    assert_eq!(event["event"], "new_help_request");
    assert_eq!(event["payload"]["customerPhone"], "+15551234567");

    stream
        .send(Message::Text(r#"{"kind":"ping"}"#.into()))
        .await
        .expect("ping");
    let pong = recv_ws_json(&mut stream).await.expect("pong");
    assert_eq!(pong["kind"], "pong");

    stream
        .send(Message::Text(r#"{"kind":"shout"}"#.into()))
        .await
        .expect("bad frame");
    let error = recv_ws_json(&mut stream).await.expect("error frame");
    assert_eq!(error["kind"], "error");
    assert_eq!(error["payload"]["code"], "unsupported_kind");
}

#[tokio::test]
async fn functional_event_channel_unsubscribe_misses_events() {
    let server = spawn_test_server().await.expect("server");
    let (mut stream, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr))
        .await
        .expect("connect ws");
    recv_ws_json(&mut stream).await.expect("connection info");

    stream
        .send(Message::Text(r#"{"kind":"subscribe"}"#.into()))
        .await
        .expect("subscribe");
    recv_ws_json(&mut stream).await.expect("subscribed");
    stream
        .send(Message::Text(r#"{"kind":"unsubscribe"}"#.into()))
        .await
        .expect("unsubscribe");
    recv_ws_json(&mut stream).await.expect("unsubscribed");

    post_json(&server.url("/help-requests"), create_body())
        .await
        .expect("create");

    stream
        .send(Message::Text(r#"{"kind":"ping"}"#.into()))
        .await
        .expect("ping");
    // The pong arrives without any event frame in between: the emitted
    // event was missed while unsubscribed, with no replay.
    let next = recv_ws_json(&mut stream).await.expect("next frame");
    assert_eq!(next["kind"], "pong");
}
