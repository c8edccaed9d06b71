//! ACP integration: the built-in memory tools over a live connection.

use std::sync::Arc;

use memnexus::config::ProtocolSettings;
use memnexus::memory::context::ContextManager;
use memnexus::memory::store::{MemoryStore, MemoryType};
use memnexus::memory::sync::MemorySyncBus;
use memnexus::protocol::acp::{register_memory_tools, AcpConnection};
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

fn settings() -> ProtocolSettings {
    ProtocolSettings {
        request_timeout_secs: 2,
        prompt_timeout_secs: 5,
    }
}

struct Peer {
    reader: tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
}

impl Peer {
    async fn recv(&mut self) -> Value {
        let line = self
            .reader
            .next_line()
            .await
            .expect("peer read failed")
            .expect("stream closed");
        serde_json::from_str(&line).expect("invalid JSON from client")
    }

    async fn send(&mut self, value: Value) {
        self.writer
            .write_all(format!("{value}\n").as_bytes())
            .await
            .unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn handshake(&mut self) {
        let init = self.recv().await;
        assert_eq!(init["method"], "initialize");
        assert_eq!(init["params"]["capabilities"]["tools"]["listChanged"], true);
        self.send(json!({
            "jsonrpc": "2.0",
            "id": init["id"],
            "result": {"capabilities": {}},
        }))
        .await;
        let note = self.recv().await;
        assert_eq!(note["method"], "notifications/initialized");
    }
}

fn connected(
    context: Arc<ContextManager>,
) -> (Arc<AcpConnection>, Peer, tokio::task::JoinHandle<()>) {
    let (client_side, peer_side) = duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_side);
    let (peer_read, peer_write) = tokio::io::split(peer_side);

    let conn = Arc::new(AcpConnection::new(client_read, client_write, settings()));
    let peer = Peer {
        reader: BufReader::new(peer_read).lines(),
        writer: peer_write,
    };

    let register = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move {
            register_memory_tools(&conn, context).await;
        })
    };
    (conn, peer, register)
}

fn session_fixture() -> (Arc<MemoryStore>, Arc<ContextManager>) {
    let store = Arc::new(MemoryStore::in_memory());
    let bus = Arc::new(MemorySyncBus::new(16));
    let context = Arc::new(ContextManager::new("sess1", Arc::clone(&store), bus));
    (store, context)
}

#[tokio::test]
async fn memory_search_round_trip() {
    let (_store, context) = session_fixture();
    context
        .store_agent_output("claude", "built the login API", MemoryType::Code, None)
        .await
        .unwrap();
    context
        .store_agent_output("kimi", "wrote integration tests", MemoryType::Conversation, None)
        .await
        .unwrap();

    let (conn, mut peer, register) = connected(context);
    register.await.unwrap();

    let driver = tokio::spawn(async move {
        peer.handshake().await;
        // Agent-initiated tool call.
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": 41,
            "method": "tools/call",
            "params": {"name": "memory_search", "arguments": {"query": "API", "limit": 2}},
        }))
        .await;
        let reply = peer.recv().await;
        assert_eq!(reply["id"], 41);
        let memories = reply["result"]["memories"].as_array().unwrap();
        assert_eq!(memories.len(), 2);
        for memory in memories {
            assert!(memory["id"].is_string());
            assert!(memory["content"].is_string());
            assert!(memory["source"].is_string());
            assert!(memory["type"].is_string());
        }
        assert!(reply["result"]["summary"]
            .as_str()
            .unwrap()
            .contains("recent memories"));
    });

    conn.initialize().await.unwrap();
    driver.await.unwrap();
}

#[tokio::test]
async fn memory_store_round_trip_persists_the_record() {
    let (store, context) = session_fixture();
    let (conn, mut peer, register) = connected(context);
    register.await.unwrap();

    let driver = tokio::spawn(async move {
        peer.handshake().await;
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/call",
            "params": {
                "name": "memory_store",
                "arguments": {"content": "decision: use postgres", "source": "claude", "type": "thought"},
            },
        }))
        .await;
        let reply = peer.recv().await;
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["result"]["status"], "stored");
        reply["result"]["id"].as_str().unwrap().to_string()
    });

    conn.initialize().await.unwrap();
    let stored_id = driver.await.unwrap();

    let records = store
        .by_session("sess1", Some(MemoryType::Thought), 10)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, stored_id);
    assert_eq!(records[0].source, "claude");
    assert_eq!(records[0].content, "decision: use postgres");
}

#[tokio::test]
async fn unknown_tool_is_method_not_found() {
    let (_store, context) = session_fixture();
    let (conn, mut peer, register) = connected(context);
    register.await.unwrap();

    let driver = tokio::spawn(async move {
        peer.handshake().await;
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "tools/call",
            "params": {"name": "filesystem_write", "arguments": {}},
        }))
        .await;
        let reply = peer.recv().await;
        assert_eq!(reply["id"], 5);
        assert_eq!(reply["error"]["code"], -32601);
        assert!(reply["error"]["message"]
            .as_str()
            .unwrap()
            .contains("filesystem_write"));
    });

    conn.initialize().await.unwrap();
    driver.await.unwrap();
}

#[tokio::test]
async fn tool_calls_are_served_while_a_prompt_is_streaming() {
    let (store, context) = session_fixture();
    let (conn, mut peer, register) = connected(context);
    register.await.unwrap();

    let driver = tokio::spawn(async move {
        peer.handshake().await;
        let prompt = peer.recv().await;
        assert_eq!(prompt["method"], "prompts/request");

        // Mid-prompt, the agent stores a memory through the reverse channel.
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": 90,
            "method": "tools/call",
            "params": {"name": "memory_store", "arguments": {"content": "note", "source": "agent"}},
        }))
        .await;
        let tool_reply = peer.recv().await;
        assert_eq!(tool_reply["id"], 90);
        assert_eq!(tool_reply["result"]["status"], "stored");

        // Then finishes the prompt.
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": prompt["id"],
            "result": {"message": "done"},
        }))
        .await;
    });

    conn.initialize().await.unwrap();
    let stream = conn.send_prompt("work", None).await.unwrap();
    let result = stream.collect_text().await.unwrap();
    // The final result ends the stream; the reverse call ran concurrently.
    assert_eq!(result, "");
    driver.await.unwrap();

    let records = store.by_session("sess1", None, 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].content, "note");
}
