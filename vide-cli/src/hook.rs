//! Permission-hook mode
//!
//! Invoked by the pre-tool-use hook entry installed in the project's
//! settings file. Reads one tool-call payload from stdin, consults the
//! project's allow-list, and writes a decision to stdout. Exit code 0 on
//! success, non-zero on a malformed payload.

use std::io::Read;
use std::path::PathBuf;

use serde_json::{json, Value};
use vide_core::{pattern_matches, SettingsStore};

/// Exit code for a payload the hook could not parse.
pub const EXIT_PROTOCOL_ERROR: i32 = 2;

pub async fn run() -> anyhow::Result<i32> {
    let mut payload = String::new();
    std::io::stdin().read_to_string(&mut payload)?;

    let decision = match evaluate(&payload).await {
        Ok(decision) => decision,
        Err(e) => {
            eprintln!("vide --hook: {}", e);
            return Ok(EXIT_PROTOCOL_ERROR);
        }
    };
    println!("{}", decision);
    Ok(0)
}

async fn evaluate(payload: &str) -> anyhow::Result<Value> {
    let payload: Value = serde_json::from_str(payload)?;
    let tool_name = payload
        .get("tool_name")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("payload has no tool_name"))?;
    let tool_input = payload.get("tool_input").cloned().unwrap_or(json!({}));
    let cwd = payload
        .get("cwd")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .unwrap_or(std::env::current_dir()?);

    let settings = SettingsStore::for_project(&cwd).load().await?;
    for pattern in &settings.permissions.allow {
        if pattern_matches(pattern, tool_name, &tool_input) {
            return Ok(json!({
                "decision": "approve",
                "reason": format!("matched allow pattern {}", pattern),
            }));
        }
    }
    // No opinion: the runtime's permission broker decides.
    Ok(json!({}))
}
