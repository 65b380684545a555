//! Wire types for the `files` application.
//!
//! Requests arrive as `{requestId, operation, params}` on the `files`
//! channel; these are the `params` and `result` shapes per operation.

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════
// Operation names
// ═══════════════════════════════════════════════════════════════════════════

pub const LIST_DIRECTORY: &str = "listDirectory";
pub const READ_FILE: &str = "readFile";
pub const WRITE_FILE: &str = "writeFile";
pub const CREATE_DIRECTORY: &str = "createDirectory";
pub const DELETE_FILE: &str = "deleteFile";
pub const DELETE_DIRECTORY: &str = "deleteDirectory";
pub const GET_FILE_INFO: &str = "getFileInfo";

/// Content encodings for readFile/writeFile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Utf8,
    Base64,
}

// ═══════════════════════════════════════════════════════════════════════════
// Params & results
// ═══════════════════════════════════════════════════════════════════════════

/// Any operation that only takes a path
#[derive(Debug, Deserialize)]
pub struct PathParams {
    pub path: String,
}

/// listDirectory result
#[derive(Debug, Serialize)]
pub struct ListDirectoryResult {
    pub entries: Vec<FileEntry>,
}

/// A single file/directory entry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub file_type: FileType,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Other,
}

impl From<std::fs::FileType> for FileType {
    fn from(t: std::fs::FileType) -> Self {
        if t.is_symlink() {
            Self::Symlink
        } else if t.is_dir() {
            Self::Directory
        } else if t.is_file() {
            Self::File
        } else {
            Self::Other
        }
    }
}

/// readFile params
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileParams {
    pub path: String,
    #[serde(default)]
    pub encoding: Encoding,
}

/// readFile result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileResult {
    pub content: String,
    pub encoding: Encoding,
    pub mime_type: String,
    /// SHA-256 hex digest of the raw bytes.
    pub hash: String,
    pub size: u64,
    pub mtime: u64,
}

/// writeFile params
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFileParams {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub encoding: Encoding,
    /// If provided, only write if the current hash matches (optimistic lock).
    #[serde(default)]
    pub expect_hash: Option<String>,
}

/// writeFile result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFileResult {
    pub hash: String,
    pub size: u64,
    pub mtime: u64,
    pub mime_type: String,
}

/// createDirectory / deleteDirectory params
#[derive(Debug, Deserialize)]
pub struct DirectoryParams {
    pub path: String,
    /// mkdir -p / rm -r
    #[serde(default)]
    pub recursive: bool,
}

/// getFileInfo result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<FileType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>, // octal, e.g. "755"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl FileInfo {
    pub fn missing() -> Self {
        Self {
            exists: false,
            file_type: None,
            size: None,
            mtime: None,
            permissions: None,
            mime_type: None,
        }
    }
}

/// Empty success result
#[derive(Debug, Serialize)]
pub struct Done {
    pub ok: bool,
}

impl Done {
    pub const OK: Done = Done { ok: true };
}
