//! Typed views over tool invocations
//!
//! A [`ToolInvocation`] pairs a `ToolUse` response with its matching
//! `ToolResult` by `tool_use_id`. [`FileToolCall`] parses the parameter
//! maps of the file-family tools into structured accessors.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::response::Response;

/// A tool call derived from a message's responses, optionally completed
/// by a paired result.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub tool_use_id: Option<String>,
    pub params: Value,
    pub result: Option<ToolOutcome>,
}

/// The outcome half of a completed invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolInvocation {
    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.has_result()
    }

    pub fn is_error(&self) -> bool {
        self.result.as_ref().map(|r| r.is_error).unwrap_or(false)
    }

    /// Human-readable name: MCP tools of shape `mcp__<server>__<tool>`
    /// render as `<Server Title Cased>: <tool>`, everything else as-is.
    pub fn display_name(&self) -> String {
        display_name(&self.tool_name)
    }

    /// Structured accessors for the file-family tools, if applicable.
    pub fn file_call(&self) -> Option<FileToolCall> {
        FileToolCall::parse(&self.tool_name, &self.params)
    }
}

/// Pair `ToolUse` responses with matching `ToolResult`s within one message.
pub fn pair_invocations(responses: &[Response]) -> Vec<ToolInvocation> {
    let mut invocations: Vec<ToolInvocation> = Vec::new();
    for response in responses {
        match response {
            Response::ToolUse {
                tool_name,
                params,
                tool_use_id,
                ..
            } => {
                invocations.push(ToolInvocation {
                    tool_name: tool_name.clone(),
                    tool_use_id: tool_use_id.clone(),
                    params: params.clone(),
                    result: None,
                });
            }
            Response::ToolResult {
                tool_use_id,
                content,
                is_error,
                ..
            } => {
                if let Some(invocation) = invocations
                    .iter_mut()
                    .find(|i| i.tool_use_id.as_deref() == Some(tool_use_id) && i.result.is_none())
                {
                    invocation.result = Some(ToolOutcome {
                        content: content.clone(),
                        is_error: *is_error,
                    });
                }
            }
            _ => {}
        }
    }
    invocations
}

/// Render a tool name for display.
///
/// `mcp__task-management__create_task` becomes `Task Management: create_task`.
pub fn display_name(tool_name: &str) -> String {
    let Some(rest) = tool_name.strip_prefix("mcp__") else {
        return tool_name.to_string();
    };
    let Some((server, tool)) = rest.split_once("__") else {
        return tool_name.to_string();
    };
    let server_title = server
        .split('-')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    format!("{}: {}", server_title, tool)
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EditOp {
    pub old_string: String,
    pub new_string: String,
    #[serde(default)]
    pub replace_all: bool,
}

/// Parsed parameters of the file-family tools.
#[derive(Debug, Clone, PartialEq)]
pub enum FileToolCall {
    Write {
        file_path: String,
        content: String,
    },
    Edit {
        file_path: String,
        old_string: String,
        new_string: String,
        replace_all: bool,
    },
    MultiEdit {
        file_path: String,
        edits: Vec<EditOp>,
    },
    Read {
        file_path: String,
    },
    Glob {
        pattern: String,
        path: Option<String>,
    },
    Grep {
        pattern: String,
        path: Option<String>,
    },
}

fn str_field(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

impl FileToolCall {
    pub fn parse(tool_name: &str, params: &Value) -> Option<Self> {
        match tool_name {
            "Write" => Some(Self::Write {
                file_path: str_field(params, "file_path")?,
                content: str_field(params, "content").unwrap_or_default(),
            }),
            "Edit" => Some(Self::Edit {
                file_path: str_field(params, "file_path")?,
                old_string: str_field(params, "old_string").unwrap_or_default(),
                new_string: str_field(params, "new_string").unwrap_or_default(),
                replace_all: params
                    .get("replace_all")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            "MultiEdit" => Some(Self::MultiEdit {
                file_path: str_field(params, "file_path")?,
                edits: params
                    .get("edits")
                    .cloned()
                    .and_then(|e| serde_json::from_value(e).ok())
                    .unwrap_or_default(),
            }),
            "Read" => Some(Self::Read {
                file_path: str_field(params, "file_path")?,
            }),
            "Glob" => Some(Self::Glob {
                pattern: str_field(params, "pattern")?,
                path: str_field(params, "path"),
            }),
            "Grep" => Some(Self::Grep {
                pattern: str_field(params, "pattern")?,
                path: str_field(params, "path"),
            }),
            _ => None,
        }
    }

    pub fn file_path(&self) -> Option<&str> {
        match self {
            Self::Write { file_path, .. }
            | Self::Edit { file_path, .. }
            | Self::MultiEdit { file_path, .. }
            | Self::Read { file_path } => Some(file_path),
            Self::Glob { path, .. } | Self::Grep { path, .. } => path.as_deref(),
        }
    }

    /// Line count of the content being replaced.
    ///
    /// Counts split-on-newline elements, so `"a\nb\n"` counts as 3.
    pub fn old_line_count(&self) -> usize {
        match self {
            Self::Edit { old_string, .. } => line_count(old_string),
            Self::MultiEdit { edits, .. } => {
                edits.iter().map(|e| line_count(&e.old_string)).sum()
            }
            _ => 0,
        }
    }

    /// Line count of the content being written.
    pub fn new_line_count(&self) -> usize {
        match self {
            Self::Write { content, .. } => line_count(content),
            Self::Edit { new_string, .. } => line_count(new_string),
            Self::MultiEdit { edits, .. } => {
                edits.iter().map(|e| line_count(&e.new_string)).sum()
            }
            _ => 0,
        }
    }

    /// True when the call would modify file contents.
    pub fn has_changes(&self) -> bool {
        match self {
            Self::Write { content, .. } => !content.is_empty(),
            Self::Edit {
                old_string,
                new_string,
                ..
            } => old_string != new_string,
            Self::MultiEdit { edits, .. } => {
                edits.iter().any(|e| e.old_string != e.new_string)
            }
            Self::Read { .. } | Self::Glob { .. } | Self::Grep { .. } => false,
        }
    }

    /// The call's path relative to `cwd`, when it is inside it.
    pub fn relative_path(&self, cwd: &Path) -> Option<PathBuf> {
        let path = Path::new(self.file_path()?);
        match path.strip_prefix(cwd) {
            Ok(relative) => Some(relative.to_path_buf()),
            Err(_) => Some(path.to_path_buf()),
        }
    }
}

fn line_count(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        text.split('\n').count()
    }
}
