//! File access application
//!
//! Exposes a fixed set of file operations on the `files` channel. Every path
//! is checked twice:
//! - before normalisation: any `..` segment is rejected outright
//! - after canonicalisation: the real location (symlinks resolved) must lie
//!   inside one of the shared roots
//!
//! Failures cross the channel as short messages only; io detail stays in the
//! agent's log.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use homechannel_lib::apps::{OperationResult, OperationTable, TableHandler};

use crate::protocol::*;

/// Name the file service is registered under
pub const APP_NAME: &str = "files";

/// Shared directories and size limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilesConfig {
    pub roots: Vec<PathBuf>,
    pub max_read_bytes: u64,
    pub max_write_bytes: u64,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            max_read_bytes: default_max_size(),
            max_write_bytes: default_max_size(),
        }
    }
}

fn default_max_size() -> u64 {
    10 * 1024 * 1024
}

/// File service errors
#[derive(Debug, Error)]
pub enum FsError {
    #[error("No shared directories configured")]
    NoRoots,

    #[error("Invalid path")]
    InvalidPath,

    #[error("Path traversal is not allowed")]
    Traversal,

    #[error("Path is outside the shared directories")]
    OutsideRoots,

    #[error("Shared directories cannot be removed")]
    RootRemoval,

    #[error("Not found")]
    NotFound,

    #[error("Already exists")]
    AlreadyExists,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Not a file")]
    NotAFile,

    #[error("Not a directory")]
    NotADirectory,

    #[error("File too large: {size} bytes (max: {max} bytes)")]
    TooLarge { size: u64, max: u64 },

    #[error("File is not valid UTF-8, use base64 encoding")]
    NotUtf8,

    #[error("Content is not valid base64")]
    InvalidContent,

    #[error("File changed since it was read")]
    HashMismatch,

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("IO error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io(e),
        }
    }
}

impl FsError {
    /// The message sent to the remote party.
    pub fn public_message(&self) -> String {
        match self {
            Self::OutsideRoots | Self::RootRemoval => "Access denied".to_string(),
            Self::Io(_) => "I/O error".to_string(),
            other => other.to_string(),
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn mtime_secs(meta: &std::fs::Metadata) -> Option<u64> {
    meta.modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs())
}

#[cfg(unix)]
fn permissions(meta: &std::fs::Metadata) -> Option<String> {
    use std::os::unix::fs::PermissionsExt;
    Some(format!("{:o}", meta.permissions().mode() & 0o777))
}

#[cfg(not(unix))]
fn permissions(_meta: &std::fs::Metadata) -> Option<String> {
    None
}

fn mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// File operations confined to a set of shared roots
pub struct FileService {
    roots: Vec<PathBuf>,
    max_read_bytes: u64,
    max_write_bytes: u64,
}

impl FileService {
    pub fn new(config: &FilesConfig) -> Result<Self, FsError> {
        if config.roots.is_empty() {
            return Err(FsError::NoRoots);
        }
        let roots = config
            .roots
            .iter()
            .map(std::fs::canonicalize)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            roots,
            max_read_bytes: config.max_read_bytes,
            max_write_bytes: config.max_write_bytes,
        })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Resolve a requested path to its real location inside a shared root.
    ///
    /// Relative paths are taken relative to the first root. The target need
    /// not exist; its deepest existing ancestor is canonicalised instead.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, FsError> {
        if raw.trim().is_empty() || raw.contains('\0') {
            return Err(FsError::InvalidPath);
        }
        if raw.split(['/', '\\']).any(|segment| segment == "..") {
            return Err(FsError::Traversal);
        }

        let requested = Path::new(raw);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.roots.first().ok_or(FsError::NoRoots)?.join(requested)
        };

        let resolved = canonicalize_lenient(&joined)?;
        if self.roots.iter().any(|root| resolved.starts_with(root)) {
            Ok(resolved)
        } else {
            Err(FsError::OutsideRoots)
        }
    }

    fn is_root(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| root == path)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Operations
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn list_directory(&self, params: PathParams) -> Result<ListDirectoryResult, FsError> {
        let dir = self.resolve(&params.path)?;
        if !tokio::fs::metadata(&dir).await?.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            // DirEntry metadata does not follow symlinks
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path().to_string_lossy().into_owned(),
                file_type: meta.file_type().into(),
                size: meta.len(),
                mtime: mtime_secs(&meta),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ListDirectoryResult { entries })
    }

    pub async fn read_file(&self, params: ReadFileParams) -> Result<ReadFileResult, FsError> {
        let path = self.resolve(&params.path)?;
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(FsError::NotAFile);
        }
        if meta.len() > self.max_read_bytes {
            return Err(FsError::TooLarge {
                size: meta.len(),
                max: self.max_read_bytes,
            });
        }

        let bytes = tokio::fs::read(&path).await?;
        let hash = sha256_hex(&bytes);
        let size = bytes.len() as u64;
        let content = match params.encoding {
            Encoding::Utf8 => String::from_utf8(bytes).map_err(|_| FsError::NotUtf8)?,
            Encoding::Base64 => BASE64.encode(&bytes),
        };

        Ok(ReadFileResult {
            content,
            encoding: params.encoding,
            mime_type: mime_type(&path),
            hash,
            size,
            mtime: mtime_secs(&meta).unwrap_or(0),
        })
    }

    pub async fn write_file(&self, params: WriteFileParams) -> Result<WriteFileResult, FsError> {
        let path = self.resolve(&params.path)?;
        let bytes = match params.encoding {
            Encoding::Utf8 => params.content.into_bytes(),
            Encoding::Base64 => BASE64
                .decode(params.content.as_bytes())
                .map_err(|_| FsError::InvalidContent)?,
        };
        if bytes.len() as u64 > self.max_write_bytes {
            return Err(FsError::TooLarge {
                size: bytes.len() as u64,
                max: self.max_write_bytes,
            });
        }

        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_dir() => return Err(FsError::NotAFile),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(expected) = params.expect_hash {
            let current = match tokio::fs::read(&path).await {
                Ok(current) => sha256_hex(&current),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(FsError::HashMismatch)
                }
                Err(e) => return Err(e.into()),
            };
            if current != expected.trim().to_ascii_lowercase() {
                return Err(FsError::HashMismatch);
            }
        }

        // Write beside the target, then rename over it
        let parent = path.parent().ok_or(FsError::InvalidPath)?;
        let name = path.file_name().ok_or(FsError::InvalidPath)?;
        let mut tmp_name = OsString::from(".");
        tmp_name.push(name);
        tmp_name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let tmp = parent.join(tmp_name);

        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        let meta = tokio::fs::metadata(&path).await?;
        Ok(WriteFileResult {
            hash: sha256_hex(&bytes),
            size: bytes.len() as u64,
            mtime: mtime_secs(&meta).unwrap_or(0),
            mime_type: mime_type(&path),
        })
    }

    pub async fn create_directory(&self, params: DirectoryParams) -> Result<Done, FsError> {
        let path = self.resolve(&params.path)?;
        if params.recursive {
            tokio::fs::create_dir_all(&path).await?;
        } else {
            tokio::fs::create_dir(&path).await?;
        }
        Ok(Done::OK)
    }

    pub async fn delete_file(&self, params: PathParams) -> Result<Done, FsError> {
        let path = self.resolve(&params.path)?;
        if tokio::fs::symlink_metadata(&path).await?.is_dir() {
            return Err(FsError::NotAFile);
        }
        tokio::fs::remove_file(&path).await?;
        Ok(Done::OK)
    }

    pub async fn delete_directory(&self, params: DirectoryParams) -> Result<Done, FsError> {
        let path = self.resolve(&params.path)?;
        if self.is_root(&path) {
            return Err(FsError::RootRemoval);
        }
        if !tokio::fs::symlink_metadata(&path).await?.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if params.recursive {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_dir(&path).await?;
        }
        Ok(Done::OK)
    }

    pub async fn get_file_info(&self, params: PathParams) -> Result<FileInfo, FsError> {
        let path = self.resolve(&params.path)?;
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FileInfo::missing()),
            Err(e) => return Err(e.into()),
        };
        Ok(FileInfo {
            exists: true,
            file_type: Some(meta.file_type().into()),
            size: Some(meta.len()),
            mtime: mtime_secs(&meta),
            permissions: permissions(&meta),
            mime_type: meta.is_file().then(|| mime_type(&path)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Dispatch
    // ═══════════════════════════════════════════════════════════════════════

    /// The allow-listed operations, by wire name.
    pub fn operations() -> OperationTable<FileService> {
        OperationTable::new()
            .with(LIST_DIRECTORY, op_list_directory)
            .with(READ_FILE, op_read_file)
            .with(WRITE_FILE, op_write_file)
            .with(CREATE_DIRECTORY, op_create_directory)
            .with(DELETE_FILE, op_delete_file)
            .with(DELETE_DIRECTORY, op_delete_directory)
            .with(GET_FILE_INFO, op_get_file_info)
    }

    pub fn into_handler(self) -> TableHandler<FileService> {
        TableHandler::new(Arc::new(self), Self::operations())
    }
}

/// Canonicalise the deepest existing ancestor and re-append the rest.
fn canonicalize_lenient(path: &Path) -> Result<PathBuf, FsError> {
    let mut existing = path.to_path_buf();
    let mut missing: Vec<OsString> = Vec::new();
    loop {
        match std::fs::canonicalize(&existing) {
            Ok(mut resolved) => {
                for part in missing.iter().rev() {
                    resolved.push(part);
                }
                return Ok(resolved);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // A dangling symlink could point anywhere
                if std::fs::symlink_metadata(&existing).is_ok() {
                    return Err(FsError::OutsideRoots);
                }
                let name = existing.file_name().ok_or(FsError::InvalidPath)?;
                missing.push(name.to_os_string());
                if !existing.pop() {
                    return Err(FsError::InvalidPath);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn parse<P: DeserializeOwned>(params: Value) -> Result<P, String> {
    serde_json::from_value(params).map_err(|e| FsError::InvalidParams(e.to_string()).public_message())
}

fn respond<R: Serialize>(operation: &str, result: Result<R, FsError>) -> OperationResult {
    match result {
        Ok(r) => serde_json::to_value(r).map_err(|_| "Internal error".to_string()),
        Err(e) => {
            debug!("[files] {} failed: {}", operation, e);
            Err(e.public_message())
        }
    }
}

fn op_list_directory(svc: Arc<FileService>, params: Value) -> BoxFuture<'static, OperationResult> {
    Box::pin(async move { respond(LIST_DIRECTORY, svc.list_directory(parse(params)?).await) })
}

fn op_read_file(svc: Arc<FileService>, params: Value) -> BoxFuture<'static, OperationResult> {
    Box::pin(async move { respond(READ_FILE, svc.read_file(parse(params)?).await) })
}

fn op_write_file(svc: Arc<FileService>, params: Value) -> BoxFuture<'static, OperationResult> {
    Box::pin(async move { respond(WRITE_FILE, svc.write_file(parse(params)?).await) })
}

fn op_create_directory(svc: Arc<FileService>, params: Value) -> BoxFuture<'static, OperationResult> {
    Box::pin(async move { respond(CREATE_DIRECTORY, svc.create_directory(parse(params)?).await) })
}

fn op_delete_file(svc: Arc<FileService>, params: Value) -> BoxFuture<'static, OperationResult> {
    Box::pin(async move { respond(DELETE_FILE, svc.delete_file(parse(params)?).await) })
}

fn op_delete_directory(svc: Arc<FileService>, params: Value) -> BoxFuture<'static, OperationResult> {
    Box::pin(async move { respond(DELETE_DIRECTORY, svc.delete_directory(parse(params)?).await) })
}

fn op_get_file_info(svc: Arc<FileService>, params: Value) -> BoxFuture<'static, OperationResult> {
    Box::pin(async move { respond(GET_FILE_INFO, svc.get_file_info(parse(params)?).await) })
}
