use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

use super::process_store::{OutputReaders, ProcessStore};
use super::registry::Toolset;
use crate::errors::{ToolCallResult, ToolError};
use crate::models::tool::Tool;

pub const DEFAULT_INTERPRETER: &str = "python3";
pub const DEFAULT_EXECUTION_WAIT: Duration = Duration::from_secs(10);

/// File and code tools confined to one workspace directory.
pub struct ProjectTools {
    tools: Vec<Tool>,
    root: PathBuf,
    interpreter: String,
    execution_wait: Duration,
    processes: ProcessStore,
    instructions: String,
}

impl ProjectTools {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        let root = root.into();
        let path_param = |description: &str| json!({"type": "string", "description": description});

        let tools = vec![
            Tool::new(
                "create_file",
                "Create a new file at the specified path with the given content. \
                Parent directories are created as needed and an existing file is overwritten.",
                json!({
                    "path": path_param("The path where the file should be created"),
                    "content": {"type": "string", "description": "The content of the file"}
                }),
                ["path", "content"],
            ),
            Tool::new(
                "create_folder",
                "Create a new folder at the specified path.",
                json!({"path": path_param("The path where the folder should be created")}),
                ["path"],
            ),
            Tool::new(
                "read_file",
                "Read the contents of a file at the specified path.",
                json!({"path": path_param("The path of the file to read")}),
                ["path"],
            ),
            Tool::new(
                "read_multiple_files",
                "Read the contents of several files at once.",
                json!({
                    "paths": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "The paths of the files to read"
                    }
                }),
                ["paths"],
            ),
            Tool::new(
                "list_files",
                "List the entries of a folder. Defaults to the workspace root.",
                json!({"path": path_param("The folder to list")}),
                Vec::<String>::new(),
            ),
            Tool::new(
                "delete_path",
                "Delete a file or a folder and everything inside it.",
                json!({"path": path_param("The file or folder to delete")}),
                ["path"],
            ),
            Tool::new(
                "edit_file",
                "Apply a list of SEARCH/REPLACE edits to a file, in order. Each edit replaces \
                the first occurrence of `search` with `replace`. Edits whose search text is not \
                found are reported back so they can be retried.",
                json!({
                    "path": path_param("The file to edit"),
                    "edits": {
                        "type": "array",
                        "description": "The edits to apply",
                        "items": {
                            "type": "object",
                            "properties": {
                                "search": {"type": "string", "description": "The exact text to find"},
                                "replace": {"type": "string", "description": "The text to put in its place"}
                            },
                            "required": ["search", "replace"]
                        }
                    }
                }),
                ["path", "edits"],
            ),
            Tool::new(
                "execute_code",
                "Run Python code in the workspace. Returns its output if it finishes quickly, \
                otherwise a process id that can be passed to stop_process.",
                json!({"code": {"type": "string", "description": "The code to run"}}),
                ["code"],
            ),
            Tool::new(
                "stop_process",
                "Stop a process started by execute_code.",
                json!({"process_id": {"type": "string", "description": "The id returned by execute_code"}}),
                ["process_id"],
            ),
        ];

        let instructions = format!(
            "All file paths are relative to the workspace at {}. \
            Paths outside the workspace are rejected.",
            root.display()
        );

        Self {
            tools,
            root,
            interpreter: DEFAULT_INTERPRETER.to_string(),
            execution_wait: DEFAULT_EXECUTION_WAIT,
            processes: ProcessStore::new(),
            instructions,
        }
    }

    pub fn with_interpreter<S: Into<String>>(mut self, interpreter: S) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// How long execute_code waits before leaving a process in the background.
    pub fn with_execution_wait(mut self, wait: Duration) -> Self {
        self.execution_wait = wait;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn processes(&self) -> &ProcessStore {
        &self.processes
    }

    /// Resolve a model-supplied path inside the workspace. The check is
    /// lexical so it also works for paths that do not exist yet.
    fn resolve_path(&self, path_str: &str) -> ToolCallResult<PathBuf> {
        let path = Path::new(path_str);
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root).map_err(|_| outside(path_str))?
        } else {
            path
        };

        let mut resolved = self.root.clone();
        let mut depth = 0usize;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(outside(path_str));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => return Err(outside(path_str)),
            }
        }
        Ok(resolved)
    }

    async fn create_file(&self, params: &Value) -> ToolCallResult<String> {
        let path_str = required_str(params, "path")?;
        let content = required_str(params, "content")?;
        let path = self.resolve_path(path_str)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::ExecutionError(format!("Failed to create parent folders: {}", e))
            })?;
        }
        fs::write(&path, content)
            .await
            .map_err(|e| ToolError::ExecutionError(format!("Failed to write file: {}", e)))?;

        Ok(format!("File created: {}", path_str))
    }

    async fn create_folder(&self, params: &Value) -> ToolCallResult<String> {
        let path_str = required_str(params, "path")?;
        let path = self.resolve_path(path_str)?;

        fs::create_dir_all(&path)
            .await
            .map_err(|e| ToolError::ExecutionError(format!("Failed to create folder: {}", e)))?;

        Ok(format!("Folder created: {}", path_str))
    }

    async fn read_file(&self, params: &Value) -> ToolCallResult<String> {
        let path_str = required_str(params, "path")?;
        self.read_one(path_str).await
    }

    async fn read_one(&self, path_str: &str) -> ToolCallResult<String> {
        let path = self.resolve_path(path_str)?;
        if !path.is_file() {
            return Err(ToolError::InvalidParameters(format!(
                "The file '{}' does not exist",
                path_str
            )));
        }
        fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::ExecutionError(format!("Failed to read file: {}", e)))
    }

    async fn read_multiple_files(&self, params: &Value) -> ToolCallResult<String> {
        let paths = params
            .get("paths")
            .and_then(Value::as_array)
            .ok_or_else(|| ToolError::InvalidParameters("Missing 'paths' parameter".into()))?;

        let mut sections = Vec::with_capacity(paths.len());
        for entry in paths {
            let Some(path_str) = entry.as_str() else {
                return Err(ToolError::InvalidParameters(
                    "'paths' must only contain strings".into(),
                ));
            };
            let section = match self.read_one(path_str).await {
                Ok(content) => format!("File: {}\n{}", path_str, content),
                Err(e) => format!("File: {}\nError: {}", path_str, e),
            };
            sections.push(section);
        }
        Ok(sections.join("\n\n"))
    }

    async fn list_files(&self, params: &Value) -> ToolCallResult<String> {
        let path_str = params.get("path").and_then(Value::as_str).unwrap_or(".");
        let path = self.resolve_path(path_str)?;
        if !path.is_dir() {
            return Err(ToolError::InvalidParameters(format!(
                "The folder '{}' does not exist",
                path_str
            )));
        }

        let mut entries = fs::read_dir(&path)
            .await
            .map_err(|e| ToolError::ExecutionError(format!("Failed to read folder: {}", e)))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ToolError::ExecutionError(format!("Failed to read folder: {}", e)))?
        {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();

        if names.is_empty() {
            Ok(format!("The folder '{}' is empty", path_str))
        } else {
            Ok(names.join("\n"))
        }
    }

    async fn delete_path(&self, params: &Value) -> ToolCallResult<String> {
        let path_str = required_str(params, "path")?;
        let path = self.resolve_path(path_str)?;
        if path == self.root {
            return Err(ToolError::InvalidParameters(
                "Refusing to delete the workspace root".into(),
            ));
        }

        let result = if path.is_dir() {
            fs::remove_dir_all(&path).await
        } else if path.exists() {
            fs::remove_file(&path).await
        } else {
            return Err(ToolError::InvalidParameters(format!(
                "The path '{}' does not exist",
                path_str
            )));
        };
        result.map_err(|e| ToolError::ExecutionError(format!("Failed to delete: {}", e)))?;

        Ok(format!("Deleted: {}", path_str))
    }

    async fn edit_file(&self, params: &Value) -> ToolCallResult<String> {
        let path_str = required_str(params, "path")?;
        let edits: Vec<EditBlock> = params
            .get("edits")
            .cloned()
            .map(serde_json::from_value::<Vec<EditBlock>>)
            .transpose()
            .map_err(|e| ToolError::InvalidParameters(format!("Invalid 'edits' parameter: {}", e)))?
            .ok_or_else(|| ToolError::InvalidParameters("Missing 'edits' parameter".into()))?;
        let content = self.read_one(path_str).await?;

        let applied = apply_edits(&content, &edits);
        if applied.changed == 0 {
            return Err(ToolError::InvalidParameters(format!(
                "No changes could be applied to {}. Search text not found:\n{}",
                path_str,
                applied.failed.join("\n")
            )));
        }

        let path = self.resolve_path(path_str)?;
        fs::write(&path, &applied.content)
            .await
            .map_err(|e| ToolError::ExecutionError(format!("Failed to write file: {}", e)))?;
        debug!(
            path = path_str,
            applied = applied.changed,
            failed = applied.failed.len(),
            "edits written"
        );

        if applied.failed.is_empty() {
            Ok(format!("Changes applied to {}", path_str))
        } else {
            Ok(format!(
                "Changes applied to {}. These edits could not be applied, please retry them:\n{}",
                path_str,
                applied.failed.join("\n")
            ))
        }
    }

    async fn execute_code(&self, params: &Value) -> ToolCallResult<String> {
        let code = required_str(params, "code")?;

        let mut child = Command::new(&self.interpreter)
            .arg("-c")
            .arg(code)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ToolError::ExecutionError(format!("Failed to start {}: {}", self.interpreter, e))
            })?;

        // a child writing more than the pipe buffer blocks until someone reads it
        let output = OutputReaders::spawn(&mut child);

        match tokio::time::timeout(self.execution_wait, child.wait()).await {
            Ok(status) => {
                let status = status
                    .map_err(|e| ToolError::ExecutionError(format!("Process failed: {}", e)))?;
                let (stdout, stderr) = output.collect().await;
                let code = status
                    .code()
                    .map_or_else(|| "terminated by signal".to_string(), |c| c.to_string());
                Ok(format!(
                    "Stdout:\n{}\nStderr:\n{}\nExit code: {}",
                    stdout, stderr, code
                ))
            }
            Err(_) => {
                let id = self.processes.store_with_output(child, output);
                debug!(process_id = %id, "execute_code left running in background");
                Ok(format!(
                    "Process is still running with ID: {}. Use stop_process to end it.",
                    id
                ))
            }
        }
    }

    async fn stop_process(&self, params: &Value) -> ToolCallResult<String> {
        let id = required_str(params, "process_id")?;
        match self.processes.kill(id).await {
            Ok(true) => Ok(format!("Process {} stopped", id)),
            Ok(false) => Err(ToolError::InvalidParameters(format!(
                "No running process with ID: {}",
                id
            ))),
            Err(e) => Err(ToolError::ExecutionError(format!(
                "Failed to stop process {}: {}",
                id, e
            ))),
        }
    }
}

#[async_trait]
impl Toolset for ProjectTools {
    fn name(&self) -> &str {
        "project"
    }

    fn description(&self) -> &str {
        "Read, create, edit and delete files in the workspace, and run code there"
    }

    fn instructions(&self) -> &str {
        &self.instructions
    }

    fn tools(&self) -> &[Tool] {
        &self.tools
    }

    async fn call(&self, name: &str, arguments: Value) -> ToolCallResult<String> {
        match name {
            "create_file" => self.create_file(&arguments).await,
            "create_folder" => self.create_folder(&arguments).await,
            "read_file" => self.read_file(&arguments).await,
            "read_multiple_files" => self.read_multiple_files(&arguments).await,
            "list_files" => self.list_files(&arguments).await,
            "delete_path" => self.delete_path(&arguments).await,
            "edit_file" => self.edit_file(&arguments).await,
            "execute_code" => self.execute_code(&arguments).await,
            "stop_process" => self.stop_process(&arguments).await,
            _ => Err(ToolError::ToolNotFound(name.to_string())),
        }
    }
}

fn required_str<'a>(params: &'a Value, key: &str) -> ToolCallResult<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidParameters(format!("Missing '{}' parameter", key)))
}

fn outside(path_str: &str) -> ToolError {
    ToolError::InvalidParameters(format!(
        "The path '{}' is outside the workspace",
        path_str
    ))
}

#[derive(Debug, Deserialize)]
struct EditBlock {
    search: String,
    replace: String,
}

struct AppliedEdits {
    content: String,
    changed: usize,
    failed: Vec<String>,
}

/// Apply each edit to the running content. Search and replacement text are
/// trimmed, and only the first match is replaced.
fn apply_edits(original: &str, edits: &[EditBlock]) -> AppliedEdits {
    let mut content = original.to_string();
    let mut changed = 0;
    let mut failed = Vec::new();

    for (i, edit) in edits.iter().enumerate() {
        let search = edit.search.trim();
        if !search.is_empty() && content.contains(search) {
            content = content.replacen(search, edit.replace.trim(), 1);
            changed += 1;
        } else {
            failed.push(format!("Edit {}: {}", i + 1, search));
        }
    }

    AppliedEdits {
        content,
        changed,
        failed,
    }
}
