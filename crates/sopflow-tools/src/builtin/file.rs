use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use sopflow_core::error::{Result, SopError};
use sopflow_core::traits::Tool;
use sopflow_core::types::{ParamSpec, ParamType, ToolContext};

const CATEGORY: &str = "file";

fn resolve(p: &str, wd: &Path) -> PathBuf {
    let path = PathBuf::from(p);
    if path.is_absolute() {
        path
    } else {
        wd.join(path)
    }
}

fn parse<T: DeserializeOwned>(tool: &str, args: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(args)).map_err(|e| SopError::Argument {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

/// Missing or already-present paths will fail the same way on every attempt.
fn io_err(tool: &str, path: &Path, e: std::io::Error) -> SopError {
    let tool = tool.to_string();
    let message = format!("{}: {}", path.display(), e);
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::AlreadyExists | ErrorKind::InvalidInput => {
            SopError::ToolRefused { tool, message }
        }
        _ => SopError::ToolExecution { tool, message },
    }
}

/// Render arbitrary JSON as file content: strings verbatim, everything else compact JSON.
fn render_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── CreateFileTool ──────────────────────────────────────────────

pub struct CreateFileTool;

#[derive(Deserialize)]
struct CreateFileInput {
    filename: String,
    content: Value,
    #[serde(default)]
    directory: Option<String>,
    extension: String,
}

impl Tool for CreateFileTool {
    fn name(&self) -> &str {
        "create_file"
    }
    fn category(&self) -> &str {
        CATEGORY
    }
    fn description(&self) -> &str {
        "Create a file (and parent directories) with the given content. Adds `extension` when the name has none."
    }
    fn signature(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("filename", ParamType::String),
            ParamSpec::required("content", ParamType::Any),
            ParamSpec::optional("directory", ParamType::String, Value::Null),
            ParamSpec::optional("extension", ParamType::String, json!(".txt")),
        ]
    }
    fn execute(&self, args: Map<String, Value>, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let p: CreateFileInput = parse(self.name(), args)?;
            let mut filename = p.filename;
            if Path::new(&filename).extension().is_none() {
                filename.push_str(&p.extension);
            }
            let base = match &p.directory {
                Some(dir) => resolve(dir, &ctx.working_dir),
                None => ctx.working_dir.clone(),
            };
            let path = resolve(&filename, &base);
            debug!(path = %path.display(), "Creating file");

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_err("create_file", parent, e))?;
            }
            let content = render_content(&p.content);
            tokio::fs::write(&path, &content)
                .await
                .map_err(|e| io_err("create_file", &path, e))?;

            Ok(json!({
                "path": path.display().to_string(),
                "bytes": content.len(),
            }))
        })
    }
}

// ── ReadFileTool ────────────────────────────────────────────────

pub struct ReadFileTool;

#[derive(Deserialize)]
struct PathInput {
    filename: String,
}

impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }
    fn category(&self) -> &str {
        CATEGORY
    }
    fn description(&self) -> &str {
        "Read a UTF-8 text file."
    }
    fn signature(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::required("filename", ParamType::String)]
    }
    fn execute(&self, args: Map<String, Value>, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let p: PathInput = parse(self.name(), args)?;
            let path = resolve(&p.filename, &ctx.working_dir);
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| io_err("read_file", &path, e))?;
            Ok(json!({
                "path": path.display().to_string(),
                "content": content,
                "size": content.len(),
            }))
        })
    }
}

// ── EditFileTool ────────────────────────────────────────────────

pub struct EditFileTool;

#[derive(Deserialize)]
struct EditFileInput {
    filename: String,
    content: Value,
    mode: String,
}

impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }
    fn category(&self) -> &str {
        CATEGORY
    }
    fn description(&self) -> &str {
        "Overwrite or append to an existing file (mode: overwrite | append)."
    }
    fn signature(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("filename", ParamType::String),
            ParamSpec::required("content", ParamType::Any),
            ParamSpec::optional("mode", ParamType::String, json!("overwrite")),
        ]
    }
    fn execute(&self, args: Map<String, Value>, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let p: EditFileInput = parse(self.name(), args)?;
            let append = match p.mode.as_str() {
                "overwrite" => false,
                "append" => true,
                other => {
                    return Err(SopError::Argument {
                        tool: "edit_file".into(),
                        message: format!("unknown mode '{}'", other),
                    })
                }
            };
            let path = resolve(&p.filename, &ctx.working_dir);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(SopError::ToolRefused {
                    tool: "edit_file".into(),
                    message: format!("{}: file does not exist", path.display()),
                });
            }

            let content = render_content(&p.content);
            if append {
                use tokio::io::AsyncWriteExt;
                let mut file = tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .await
                    .map_err(|e| io_err("edit_file", &path, e))?;
                file.write_all(content.as_bytes())
                    .await
                    .map_err(|e| io_err("edit_file", &path, e))?;
            } else {
                tokio::fs::write(&path, &content)
                    .await
                    .map_err(|e| io_err("edit_file", &path, e))?;
            }

            Ok(json!({
                "path": path.display().to_string(),
                "mode": p.mode,
            }))
        })
    }
}

// ── DeleteFileTool ──────────────────────────────────────────────

pub struct DeleteFileTool;

impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }
    fn category(&self) -> &str {
        CATEGORY
    }
    fn description(&self) -> &str {
        "Delete a file."
    }
    fn signature(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::required("filename", ParamType::String)]
    }
    fn execute(&self, args: Map<String, Value>, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let p: PathInput = parse(self.name(), args)?;
            let path = resolve(&p.filename, &ctx.working_dir);
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| io_err("delete_file", &path, e))?;
            Ok(json!({ "path": path.display().to_string(), "deleted": true }))
        })
    }
}

// ── RenameFileTool ──────────────────────────────────────────────

pub struct RenameFileTool;

#[derive(Deserialize)]
struct RenameInput {
    old_name: String,
    new_name: String,
}

impl Tool for RenameFileTool {
    fn name(&self) -> &str {
        "rename_file"
    }
    fn category(&self) -> &str {
        CATEGORY
    }
    fn description(&self) -> &str {
        "Rename or move a file."
    }
    fn signature(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("old_name", ParamType::String),
            ParamSpec::required("new_name", ParamType::String),
        ]
    }
    fn execute(&self, args: Map<String, Value>, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let p: RenameInput = parse(self.name(), args)?;
            let from = resolve(&p.old_name, &ctx.working_dir);
            let to = resolve(&p.new_name, &ctx.working_dir);
            tokio::fs::rename(&from, &to)
                .await
                .map_err(|e| io_err("rename_file", &from, e))?;
            Ok(json!({
                "from": from.display().to_string(),
                "to": to.display().to_string(),
            }))
        })
    }
}

// ── CopyFileTool ────────────────────────────────────────────────

pub struct CopyFileTool;

#[derive(Deserialize)]
struct CopyInput {
    src: String,
    dest: String,
}

impl Tool for CopyFileTool {
    fn name(&self) -> &str {
        "copy_file"
    }
    fn category(&self) -> &str {
        CATEGORY
    }
    fn description(&self) -> &str {
        "Copy a file."
    }
    fn signature(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("src", ParamType::String),
            ParamSpec::required("dest", ParamType::String),
        ]
    }
    fn execute(&self, args: Map<String, Value>, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let p: CopyInput = parse(self.name(), args)?;
            let src = resolve(&p.src, &ctx.working_dir);
            let dest = resolve(&p.dest, &ctx.working_dir);
            let bytes = tokio::fs::copy(&src, &dest)
                .await
                .map_err(|e| io_err("copy_file", &src, e))?;
            Ok(json!({
                "src": src.display().to_string(),
                "dest": dest.display().to_string(),
                "bytes": bytes,
            }))
        })
    }
}

// ── FileInfoTool ────────────────────────────────────────────────

pub struct FileInfoTool;

impl Tool for FileInfoTool {
    fn name(&self) -> &str {
        "file_info"
    }
    fn category(&self) -> &str {
        CATEGORY
    }
    fn description(&self) -> &str {
        "Get file metadata: size, type, modification time."
    }
    fn signature(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::required("filename", ParamType::String)]
    }
    fn execute(&self, args: Map<String, Value>, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let p: PathInput = parse(self.name(), args)?;
            let path = resolve(&p.filename, &ctx.working_dir);
            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|e| io_err("file_info", &path, e))?;
            let modified = meta
                .modified()
                .ok()
                .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());
            Ok(json!({
                "path": path.display().to_string(),
                "size": meta.len(),
                "is_file": meta.is_file(),
                "is_dir": meta.is_dir(),
                "readonly": meta.permissions().readonly(),
                "modified": modified,
            }))
        })
    }
}

// ── CheckFileExistsTool ─────────────────────────────────────────

pub struct CheckFileExistsTool;

impl Tool for CheckFileExistsTool {
    fn name(&self) -> &str {
        "check_file_exists"
    }
    fn category(&self) -> &str {
        CATEGORY
    }
    fn description(&self) -> &str {
        "Check whether a file exists. Never fails for a missing file."
    }
    fn signature(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::required("filename", ParamType::String)]
    }
    fn execute(&self, args: Map<String, Value>, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let p: PathInput = parse(self.name(), args)?;
            let path = resolve(&p.filename, &ctx.working_dir);
            let exists = tokio::fs::try_exists(&path)
                .await
                .map_err(|e| io_err("check_file_exists", &path, e))?;
            Ok(json!({ "path": path.display().to_string(), "exists": exists }))
        })
    }
}
