// review-bridge/src/tools.rs
//
// Tool handlers exposed over tools/call. Each one owns exactly the
// dependencies it is constructed with; none share mutable state.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{info, warn};

use crate::{
    diff_review::{outcome_params, DiffReviewEngine},
    editor::{self, Editor},
    protocol::{Notification, EVENT_DIFF_OUTCOME},
    router::{ToolContext, ToolDescriptor, ToolError, ToolHandler, ToolRegistry},
    tracker::OpenFileTracker,
};

fn params<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidParams(e.to_string()))
}

/// Relative paths are taken against the workspace root.
fn resolve(root: &Path, file_path: &str) -> Result<PathBuf, ToolError> {
    if file_path.trim().is_empty() {
        return Err(ToolError::InvalidParams("filePath must not be empty".into()));
    }
    let p = Path::new(file_path);
    Ok(if p.is_absolute() { p.to_path_buf() } else { root.join(p) })
}

fn failed(e: impl std::fmt::Display) -> ToolError { ToolError::Failed(e.to_string()) }

fn file_path_schema(extra: Value) -> Value {
    let mut props = json!({
        "filePath": { "type": "string", "description": "Absolute path, or relative to the workspace" }
    });
    if let (Some(dst), Value::Object(src)) = (props.as_object_mut(), extra) {
        dst.extend(src);
    }
    json!({ "type": "object", "properties": props, "required": ["filePath"] })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilePathArgs {
    file_path: String,
}

// ---- openDiff ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenDiffArgs {
    file_path: String,
    new_content: Option<String>,
}

pub struct OpenDiffTool {
    engine: DiffReviewEngine,
    root: PathBuf,
}

impl OpenDiffTool {
    pub fn new(engine: DiffReviewEngine, root: impl Into<PathBuf>) -> Self { Self { engine, root: root.into() } }
}

#[async_trait]
impl ToolHandler for OpenDiffTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "openDiff",
            description: "Show a proposed change as a side-by-side diff. The outcome arrives later as ide/diffOutcome.",
            input_schema: file_path_schema(json!({
                "newContent": {
                    "type": "string",
                    "description": "Proposed file content; defaults to the current content"
                }
            })),
        }
    }

    async fn call(&self, args: Value, ctx: ToolContext) -> Result<Value, ToolError> {
        let args: OpenDiffArgs = params(args)?;
        let target = resolve(&self.root, &args.file_path)?;
        let content = match args.new_content {
            Some(c) => c,
            None => match tokio::fs::read_to_string(&target).await {
                Ok(c) => c,
                Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(failed(e)),
            },
        };
        let pending = self.engine.open(&target, &content).await.map_err(failed)?;
        info!(session = %ctx.session_id, target = %target.display(), "diff review opened");
        let reported = target.clone();
        tokio::spawn(async move {
            match pending.await {
                Ok(outcome) => {
                    if !ctx.notify(Notification::new(EVENT_DIFF_OUTCOME, outcome_params(&reported, &outcome))) {
                        warn!(session = %ctx.session_id, target = %reported.display(), "diff outcome undeliverable");
                    }
                }
                Err(_) => warn!(target = %reported.display(), "diff review ended without an outcome"),
            }
        });
        Ok(json!(format!("Opened diff for {}", target.display())))
    }
}

// ---- closeDiff ----

pub struct CloseDiffTool {
    engine: DiffReviewEngine,
    root: PathBuf,
}

impl CloseDiffTool {
    pub fn new(engine: DiffReviewEngine, root: impl Into<PathBuf>) -> Self { Self { engine, root: root.into() } }
}

#[async_trait]
impl ToolHandler for CloseDiffTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "closeDiff",
            description: "Close the diff view for a file, if one is open.",
            input_schema: file_path_schema(json!({})),
        }
    }

    async fn call(&self, args: Value, _ctx: ToolContext) -> Result<Value, ToolError> {
        let args: FilePathArgs = params(args)?;
        let target = resolve(&self.root, &args.file_path)?;
        self.engine.close_diff(&target).await.map_err(failed)?;
        Ok(json!("OK"))
    }
}

// ---- checkDocumentDirty ----

pub struct CheckDocumentDirtyTool {
    editor: Editor,
    root: PathBuf,
}

impl CheckDocumentDirtyTool {
    pub fn new(editor: Editor, root: impl Into<PathBuf>) -> Self { Self { editor, root: root.into() } }
}

#[async_trait]
impl ToolHandler for CheckDocumentDirtyTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "checkDocumentDirty",
            description: "Report whether a file is loaded in the editor and has unsaved changes.",
            input_schema: file_path_schema(json!({})),
        }
    }

    async fn call(&self, args: Value, _ctx: ToolContext) -> Result<Value, ToolError> {
        let args: FilePathArgs = params(args)?;
        let target = resolve(&self.root, &args.file_path)?;
        let state = editor::document_state(self.editor.as_ref(), &target.to_string_lossy()).await.map_err(failed)?;
        serde_json::to_value(state).map_err(failed)
    }
}

// ---- openFile ----

fn frontmost_default() -> bool { true }

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenFileArgs {
    file_path: String,
    #[serde(default = "frontmost_default")]
    make_frontmost: bool,
    start_text: Option<String>,
    end_text: Option<String>,
}

pub struct OpenFileTool {
    editor: Editor,
    root: PathBuf,
}

impl OpenFileTool {
    pub fn new(editor: Editor, root: impl Into<PathBuf>) -> Self { Self { editor, root: root.into() } }
}

#[async_trait]
impl ToolHandler for OpenFileTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "openFile",
            description: "Open a file in the editor, optionally selecting text between startText and endText.",
            input_schema: file_path_schema(json!({
                "makeFrontmost": { "type": "boolean", "default": true },
                "startText": { "type": "string" },
                "endText": { "type": "string" }
            })),
        }
    }

    async fn call(&self, args: Value, _ctx: ToolContext) -> Result<Value, ToolError> {
        let args: OpenFileArgs = params(args)?;
        let target = resolve(&self.root, &args.file_path)?;
        let selected = editor::open_file(
            self.editor.as_ref(),
            &target.to_string_lossy(),
            args.make_frontmost,
            args.start_text.as_deref(),
            args.end_text.as_deref(),
        )
        .await
        .map_err(failed)?;
        let suffix = if selected { " with selection" } else { "" };
        Ok(json!(format!("Opened {}{suffix}", target.display())))
    }
}

// ---- getOpenEditors ----

pub struct GetOpenEditorsTool {
    tracker: Arc<OpenFileTracker>,
}

impl GetOpenEditorsTool {
    pub fn new(tracker: Arc<OpenFileTracker>) -> Self { Self { tracker } }
}

#[async_trait]
impl ToolHandler for GetOpenEditorsTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "getOpenEditors",
            description: "List recently touched files, most recent first, with the active one flagged.",
            input_schema: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn call(&self, _args: Value, _ctx: ToolContext) -> Result<Value, ToolError> {
        Ok(json!({ "files": self.tracker.snapshot() }))
    }
}

// ---- getWorkspaceFolders ----

pub struct GetWorkspaceFoldersTool {
    root: PathBuf,
}

impl GetWorkspaceFoldersTool {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }
}

#[async_trait]
impl ToolHandler for GetWorkspaceFoldersTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "getWorkspaceFolders",
            description: "Return the workspace root the editor was started for.",
            input_schema: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn call(&self, _args: Value, _ctx: ToolContext) -> Result<Value, ToolError> {
        let name = self.root.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        Ok(json!({
            "folders": [{ "name": name, "path": self.root.to_string_lossy() }],
            "rootPath": self.root.to_string_lossy(),
        }))
    }
}

/// The full tool set, each handler wired with only what it needs.
pub fn registry(editor: Editor, engine: DiffReviewEngine, tracker: Arc<OpenFileTracker>, root: &Path) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools
        .register(Arc::new(OpenDiffTool::new(engine.clone(), root)))
        .register(Arc::new(CloseDiffTool::new(engine, root)))
        .register(Arc::new(CheckDocumentDirtyTool::new(editor.clone(), root)))
        .register(Arc::new(OpenFileTool::new(editor, root)))
        .register(Arc::new(GetOpenEditorsTool::new(tracker)))
        .register(Arc::new(GetWorkspaceFoldersTool::new(root)));
    tools
}
