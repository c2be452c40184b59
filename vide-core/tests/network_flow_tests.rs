//! Network flow: spawn, route, and terminate driven through the `agent`
//! MCP server surface, the way agents themselves do it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use vide_core::{
    AgentServer, AgentStatus, AgentType, FixedDir, McpServer, NetworkManager, NetworkStore,
    RuntimeScope,
};

fn scope_in(dir: &std::path::Path) -> RuntimeScope {
    RuntimeScope::new(dir.join("config"), Arc::new(FixedDir(dir.join("project"))))
}

async fn manager_in(dir: &std::path::Path) -> NetworkManager {
    tokio::fs::create_dir_all(dir.join("project")).await.unwrap();
    NetworkManager::builder(scope_in(dir))
        .cli_command("sh")
        .cli_args(vec!["-c".to_string(), "cat > /dev/null".to_string()])
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn spawn_route_terminate_via_agent_server() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(dir.path()).await;
    let network = manager.start_new("find and fix the auth bug", None).await.unwrap();
    let main_id = network.agents[0].id.clone();

    // The main agent's own `agent` server is the tool surface.
    let main_client = manager.client(&main_id).await.unwrap();
    let agent_server = main_client
        .mcp_server_as::<AgentServer>("agent")
        .expect("main imports the agent server");

    // spawn_agent
    agent_server
        .call_tool(
            "spawn_agent",
            json!({
                "agent_type": "contextCollection",
                "name": "collector",
                "prompt": "find auth"
            }),
        )
        .await
        .unwrap();

    let network = manager.network(&network.id).await.unwrap();
    assert_eq!(network.agents.len(), 2);
    assert_eq!(network.agents[0].status, AgentStatus::WaitingForAgent);
    let collector = &network.agents[1];
    assert_eq!(collector.agent_type, AgentType::ContextCollection);

    let collector_client = manager.client(&collector.id).await.unwrap();
    assert_eq!(
        collector_client.conversation().messages[0].content,
        format!("[SPAWNED BY AGENT: {}] find auth", main_id)
    );

    // The collector reports back through its own agent server.
    let collector_server = collector_client
        .mcp_server_as::<AgentServer>("agent")
        .expect("collector imports the agent server");
    collector_server
        .call_tool(
            "send_message_to_agent",
            json!({"target_agent_id": main_id, "message": "found it"}),
        )
        .await
        .unwrap();

    let main_messages = main_client.conversation().messages;
    assert_eq!(
        main_messages.last().unwrap().content,
        format!("[MESSAGE FROM AGENT: {}] found it", collector.id)
    );

    // terminate: the row stays, routing to it fails afterwards.
    agent_server
        .call_tool(
            "terminate_agent",
            json!({"target_agent_id": collector.id, "reason": "done"}),
        )
        .await
        .unwrap();

    let network = manager.network(&network.id).await.unwrap();
    assert!(network.agent(&collector.id).is_some());
    assert!(manager.client(&collector.id).await.is_none());

    let err = agent_server
        .call_tool(
            "send_message_to_agent",
            json!({"target_agent_id": collector.id, "message": "still there?"}),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("terminated"));

    manager.shutdown().await;
}

#[tokio::test]
async fn shared_memory_server_spans_agents() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(dir.path()).await;
    let network = manager.start_new("goal", None).await.unwrap();
    let main_id = network.agents[0].id.clone();

    let worker_id = manager
        .spawn(&main_id, AgentType::Implementation, "worker", "do it")
        .await
        .unwrap();

    let main_client = manager.client(&main_id).await.unwrap();
    let worker_client = manager.client(&worker_id).await.unwrap();

    // One shared instance: a memory stored via main is visible to the
    // worker.
    let main_memory = main_client.mcp_server("memory").unwrap();
    main_memory
        .call_tool("store_memory", json!({"key": "auth", "value": "JWT based"}))
        .await
        .unwrap();

    let worker_memory = worker_client.mcp_server("memory").unwrap();
    let content = worker_memory
        .call_tool("retrieve_memory", json!({"key": "auth"}))
        .await
        .unwrap();
    assert_eq!(content, vec![vide_core::ToolContent::text("JWT based")]);

    // Terminating the worker leaves the shared server running for main.
    manager.terminate(&worker_id, "done").await.unwrap();
    assert!(main_memory.is_running());

    manager.shutdown().await;
}

#[tokio::test]
async fn persisted_network_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(dir.path()).await;
    let network = manager.start_new("goal", None).await.unwrap();
    let main_id = network.agents[0].id.clone();

    manager
        .spawn(&main_id, AgentType::Planning, "planner", "plan")
        .await
        .unwrap();
    manager
        .set_status(&main_id, AgentStatus::Working)
        .await
        .unwrap();

    let in_memory = manager.network(&network.id).await.unwrap();
    let store = NetworkStore::new(scope_in(dir.path()).networks_dir(&dir.path().join("project")));
    let on_disk = store.load(&network.id).await.unwrap().unwrap();
    assert_eq!(on_disk, in_memory);

    manager.shutdown().await;
}

#[tokio::test]
async fn permission_requests_surface_on_the_event_stream() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::create_dir_all(dir.path().join("project")).await.unwrap();

    // A subprocess that immediately asks for permission on its first turn.
    let script = r#"IFS= read -r line
printf '{"type":"control_request","request_id":"perm-9","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"git status"}}}\n'
cat > /dev/null"#;
    let manager = NetworkManager::builder(scope_in(dir.path()))
        .cli_command("sh")
        .cli_args(vec!["-c".to_string(), script.to_string()])
        .build()
        .await
        .unwrap();

    let mut events = manager.events().subscribe();
    let network = manager.start_new("goal", None).await.unwrap();
    let main_id = network.agents[0].id.clone();

    // The broker surfaces the pending request as a timeline event.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("no permission_request event arrived")
            .unwrap();
        if let vide_core::EventPayload::PermissionRequest {
            ref request_id,
            ref tool_name,
            ..
        } = event.payload
        {
            assert_eq!(request_id, "perm-9");
            assert_eq!(tool_name, "Bash");
            assert_eq!(event.agent_id, main_id);
            break;
        }
    }
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while manager.broker().pending_requests().is_empty() {
        assert!(std::time::Instant::now() < deadline, "request never enqueued");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    manager
        .respond_to_permission("perm-9", vide_core::PermissionResponse::allow())
        .await
        .unwrap();
    assert!(manager.broker().pending_requests().is_empty());

    manager.shutdown().await;
}
