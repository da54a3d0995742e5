//! File-backed documents under `<project_root>/<documents_dir>`.
//!
//! Every path argument is resolved against the documents directory and must
//! stay inside it. Writing a file whose extension is listed in
//! `host.rebuild_extensions` asks the host to rebuild.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use hostlink_core::config::HostConfig;
use hostlink_core::{
    validate_and_normalize_path, BridgeError, BridgeResult, CommandHandler, PageRequest, Payload,
};

use crate::host::HostSignals;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct DocumentEntry {
    path: String,
    size: u64,
}

/// CRUD over the documents directory.
pub struct DocumentsHandler {
    root: PathBuf,
    host_config: HostConfig,
    host: HostSignals,
}

impl DocumentsHandler {
    pub fn new(project_root: &Path, host_config: HostConfig, host: HostSignals) -> Self {
        Self {
            root: project_root.join(&host_config.documents_dir),
            host_config,
            host,
        }
    }

    fn resolve(&self, payload: &Payload) -> BridgeResult<(String, PathBuf)> {
        let path = payload.require_str("path")?;
        let resolved = validate_and_normalize_path(path, &self.root)?;
        if resolved == self.root_normalized()? {
            return Err(BridgeError::invalid_field("path", "must name a file"));
        }
        Ok((path.to_string(), resolved))
    }

    fn root_normalized(&self) -> BridgeResult<PathBuf> {
        validate_and_normalize_path(".", &self.root)
    }

    fn list(&self, payload: &Payload) -> BridgeResult<Value> {
        let request = PageRequest::from_payload(payload)?;
        let root = self.root_normalized()?;

        let mut entries = Vec::new();
        collect_files(&root, &root, &mut entries)?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        serde_json::to_value(request.paginate(entries))
            .map_err(|e| BridgeError::handler(e.to_string()))
    }

    fn get(&self, payload: &Payload) -> BridgeResult<Value> {
        let (path, resolved) = self.resolve(payload)?;
        let content = fs::read_to_string(&resolved).map_err(|e| match e.kind() {
            IoErrorKind::NotFound => {
                BridgeError::invalid_field("path", format!("no document at '{path}'"))
            }
            _ => io_failure("read", &path, &e),
        })?;

        Ok(json!({ "path": path, "content": content }))
    }

    fn put(&self, payload: &Payload) -> BridgeResult<Value> {
        let (path, resolved) = self.resolve(payload)?;

        let content = match (payload.optional_str("content")?, payload.get("data")) {
            (Some(text), _) => text.to_string(),
            (None, Some(data)) => serde_json::to_string_pretty(data)
                .map_err(|e| BridgeError::invalid_field("data", e.to_string()))?,
            (None, None) => return Err(BridgeError::missing_field("content")),
        };

        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent).map_err(|e| io_failure("create directory for", &path, &e))?;
        }
        fs::write(&resolved, content.as_bytes()).map_err(|e| io_failure("write", &path, &e))?;
        debug!(path = %path, bytes = content.len(), "Document written");

        let rebuild_requested = self.maybe_request_rebuild(&path, &resolved);
        Ok(json!({
            "path": path,
            "bytesWritten": content.len(),
            "rebuildRequested": rebuild_requested,
        }))
    }

    fn delete(&self, payload: &Payload) -> BridgeResult<Value> {
        let (path, resolved) = self.resolve(payload)?;
        fs::remove_file(&resolved).map_err(|e| match e.kind() {
            IoErrorKind::NotFound => {
                BridgeError::invalid_field("path", format!("no document at '{path}'"))
            }
            _ => io_failure("delete", &path, &e),
        })?;

        let rebuild_requested = self.maybe_request_rebuild(&path, &resolved);
        Ok(json!({
            "path": path,
            "deleted": true,
            "rebuildRequested": rebuild_requested,
        }))
    }

    fn maybe_request_rebuild(&self, path: &str, resolved: &Path) -> bool {
        if !self.host_config.triggers_rebuild(resolved) {
            return false;
        }
        let requested = self.host.request_rebuild(format!("document changed: {path}"));
        if requested {
            info!(path = %path, "Document change triggers host rebuild");
        }
        // A rebuild already underway will pick the change up too.
        self.host.is_rebuilding()
    }
}

impl CommandHandler for DocumentsHandler {
    fn category(&self) -> &str {
        "storage"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn supported_operations(&self) -> &[&str] {
        &["list", "get", "put", "delete"]
    }

    fn requires_compilation_wait(&self, operation: &str) -> bool {
        matches!(operation, "put" | "delete")
    }

    fn execute(&self, operation: &str, payload: &Payload) -> BridgeResult<Value> {
        match operation {
            "list" => self.list(payload),
            "get" => self.get(payload),
            "put" => self.put(payload),
            "delete" => self.delete(payload),
            other => Err(BridgeError::UnknownOperation {
                command: "documents".to_string(),
                operation: other.to_string(),
            }),
        }
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<DocumentEntry>) -> BridgeResult<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_failure("list", &dir.display().to_string(), &e)),
    };

    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let path = entry.path();
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            out.push(DocumentEntry {
                path: relative,
                size,
            });
        }
    }
    Ok(())
}

fn io_failure(action: &str, path: &str, error: &std::io::Error) -> BridgeError {
    BridgeError::handler(format!("failed to {action} '{path}': {error}"))
}
