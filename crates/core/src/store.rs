//! Document files in a working directory.
//!
//! Every document is one `<name>.json` file holding 2-space pretty-printed
//! JSON. The set of files always equals the set of document names.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::errors::StoreError;

/// File extension of document files.
pub const DOCUMENT_EXTENSION: &str = "json";

/// Document name to JSON value. Backed by a sorted map, so keys are always
/// written in a stable order.
pub type Documents = Map<String, Value>;

/// Reads and writes the document set of one working directory.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    dir: PathBuf,
}

impl DocumentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the file holding document `name`.
    pub fn document_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, DOCUMENT_EXTENSION))
    }

    /// Read every document file, in parallel.
    ///
    /// Fails with [`StoreError::DocumentCorrupt`] naming the first file
    /// that does not parse.
    pub async fn read_all(&self) -> Result<Documents, StoreError> {
        let files = self.document_files().await?;

        let mut tasks = JoinSet::new();
        for (name, path) in files {
            tasks.spawn(async move {
                let contents = tokio::fs::read(&path).await?;
                let value: Value =
                    serde_json::from_slice(&contents).map_err(|e| StoreError::DocumentCorrupt {
                        file: file_label(&path),
                        detail: e.to_string(),
                    })?;
                Ok::<_, StoreError>((name, value))
            });
        }

        let mut documents = Documents::new();
        while let Some(joined) = tasks.join_next().await {
            let (name, value) = joined.map_err(|e| StoreError::IoError(std::io::Error::other(e)))??;
            documents.insert(name, value);
        }

        debug!(dir = %self.dir.display(), count = documents.len(), "read documents");
        Ok(documents)
    }

    /// Write every document and remove files of documents no longer present.
    pub async fn write_all(&self, documents: &Documents) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        for (name, value) in documents {
            let mut body =
                serde_json::to_string_pretty(value).map_err(|e| StoreError::Serialize {
                    document: name.clone(),
                    detail: e.to_string(),
                })?;
            body.push('\n');
            tokio::fs::write(self.document_path(name), body).await?;
        }

        let mut removed = 0usize;
        for (name, path) in self.document_files().await? {
            if !documents.contains_key(&name) {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }

        info!(
            dir = %self.dir.display(),
            written = documents.len(),
            removed,
            "wrote documents"
        );
        Ok(())
    }

    /// `(name, path)` of every document file in the directory.
    async fn document_files(&self) -> Result<Vec<(String, PathBuf)>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            if let Some(name) = document_name(&path) {
                files.push((name, path));
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Document name for a file path, or `None` if it is not a document file.
pub fn document_name(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != DOCUMENT_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() {
        return None;
    }
    Some(stem.to_string())
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Documents {
        let mut docs = Documents::new();
        docs.insert("people".into(), json!({"name": "Alice", "age": 30}));
        docs.insert("settings".into(), json!({"theme": {"dark": true}, "tags": [1, 2]}));
        docs
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path());
        store.write_all(&sample()).await.unwrap();
        assert_eq!(store.read_all().await.unwrap(), sample());
    }

    #[tokio::test]
    async fn test_pretty_printed_sorted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path());
        store.write_all(&sample()).await.unwrap();
        let text = std::fs::read_to_string(store.document_path("people")).unwrap();
        assert_eq!(text, "{\n  \"age\": 30,\n  \"name\": \"Alice\"\n}\n");
    }

    #[tokio::test]
    async fn test_corrupt_document_is_named() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path());
        store.write_all(&sample()).await.unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();

        match store.read_all().await {
            Err(StoreError::DocumentCorrupt { file, .. }) => assert_eq!(file, "broken.json"),
            other => panic!("expected DocumentCorrupt, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_utf8_document_is_named() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path());
        std::fs::write(dir.path().join("bad.json"), [0xff, 0xfe, b'{', b'}']).unwrap();

        match store.read_all().await {
            Err(StoreError::DocumentCorrupt { file, .. }) => assert_eq!(file, "bad.json"),
            other => panic!("expected DocumentCorrupt, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path());
        std::fs::write(dir.path().join("README.md"), "# hi").unwrap();
        std::fs::create_dir(dir.path().join("nested.json")).unwrap();
        std::fs::write(dir.path().join("a.json"), "[1]").unwrap();

        let docs = store.read_all().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs["a"], json!([1]));
    }

    #[tokio::test]
    async fn test_write_removes_dropped_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path());
        store.write_all(&sample()).await.unwrap();

        let mut docs = sample();
        docs.remove("settings");
        store.write_all(&docs).await.unwrap();

        assert!(!store.document_path("settings").exists());
        assert_eq!(store.read_all().await.unwrap(), docs);
    }

    #[test]
    fn test_document_name() {
        assert_eq!(document_name(Path::new("/x/people.json")), Some("people".into()));
        assert_eq!(document_name(Path::new("/x/people.txt")), None);
        assert_eq!(document_name(Path::new("/x/.json")), None);
    }
}
