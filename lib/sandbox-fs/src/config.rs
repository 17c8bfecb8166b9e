use serde::{Deserialize, Serialize};

/// Per-[`FileSystem`](crate::FileSystem) limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSystemConfig {
    /// How many files may be open at once. Zero disables the limit.
    pub maximum_files_open: usize,

    /// How deep a recursive copy may descend before giving up.
    pub maximum_copy_depth: usize,
}

impl Default for FileSystemConfig {
    fn default() -> Self {
        FileSystemConfig {
            maximum_files_open: 128,
            maximum_copy_depth: 128,
        }
    }
}
