//! Reading and writing the generated document.
//!
//! The document is JSON by default; a `.yaml`/`.yml` output path selects
//! YAML. Writes are atomic: the content goes to a temporary file in the
//! target directory which is then renamed over the destination, so a reader
//! never observes a half-written document.

use crate::error::{PipelineError, Result};
use crate::openapi_builder::OpenApiDocument;
use log::{debug, warn};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Serializes an OpenAPI document to pretty-printed JSON, with a trailing newline.
pub fn serialize_json(doc: &OpenApiDocument) -> Result<String> {
    debug!("Serializing OpenAPI document to JSON");
    let mut json = serde_json::to_string_pretty(doc)?;
    json.push('\n');
    Ok(json)
}

/// Serializes an OpenAPI document to YAML.
pub fn serialize_yaml(doc: &OpenApiDocument) -> Result<String> {
    debug!("Serializing OpenAPI document to YAML");
    serde_yaml::to_string(doc).map_err(|e| invalid_data(e.to_string()))
}

/// Serializes in the format implied by the extension of `path`.
pub fn serialize_for(doc: &OpenApiDocument, path: &Path) -> Result<String> {
    if is_yaml(path) {
        serialize_yaml(doc)
    } else {
        serialize_json(doc)
    }
}

/// Atomically replace `path` with `content`.
///
/// Parent directories are created. On any failure the previous file at
/// `path` is left as it was.
pub fn write_atomic(content: &str, path: &Path) -> Result<()> {
    debug!("Writing {} bytes to {}", content.len(), path.display());
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(content.as_bytes())?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| PipelineError::Io(e.error))?;

    debug!("Wrote {}", path.display());
    Ok(())
}

/// The previous run's document at `path`, if there is one.
///
/// A missing file is not an error. A file that cannot be read as an OpenAPI
/// document is ignored with a warning so that the run starts from scratch.
pub fn read_baseline(path: &Path) -> Result<Option<OpenApiDocument>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No baseline at {}", path.display());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let parsed = if is_yaml(path) {
        serde_yaml::from_str::<OpenApiDocument>(&content).map_err(|e| e.to_string())
    } else {
        serde_json::from_str::<OpenApiDocument>(&content).map_err(|e| e.to_string())
    };
    match parsed {
        Ok(document) => {
            debug!(
                "Baseline {} has {} operations",
                path.display(),
                document.operation_count()
            );
            Ok(Some(document))
        }
        Err(e) => {
            warn!("Ignoring unreadable baseline {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn invalid_data(message: String) -> PipelineError {
    PipelineError::Io(io::Error::new(io::ErrorKind::InvalidData, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openapi_builder::Info;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn create_test_document() -> OpenApiDocument {
        OpenApiDocument {
            openapi: "3.0.3".to_string(),
            info: Info {
                title: "Test API".to_string(),
                version: "1.0.0".to_string(),
                description: Some("A test API".to_string()),
            },
            servers: Vec::new(),
            paths: BTreeMap::new(),
            components: None,
        }
    }

    #[test]
    fn test_serialize_json_is_pretty_and_sorted() {
        let json = serialize_json(&create_test_document()).unwrap();
        assert!(json.ends_with("}\n"));
        let info = json.find("\"info\"").unwrap();
        let openapi = json.find("\"openapi\"").unwrap();
        let paths = json.find("\"paths\"").unwrap();
        assert!(info < openapi && openapi < paths);
        assert!(json.lines().count() > 5);
    }

    #[test]
    fn test_serialize_yaml() {
        let yaml = serialize_yaml(&create_test_document()).unwrap();
        assert!(yaml.contains("openapi: 3.0.3"));
        assert!(yaml.contains("title: Test API"));
    }

    #[test]
    fn test_write_atomic_replaces_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("openapi.json");
        write_atomic("first", &path).unwrap();
        write_atomic("second", &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");

        // no temporary files left behind
        let entries = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_read_baseline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("openapi.json");
        assert!(read_baseline(&path).unwrap().is_none());

        let doc = create_test_document();
        write_atomic(&serialize_json(&doc).unwrap(), &path).unwrap();
        assert_eq!(read_baseline(&path).unwrap(), Some(doc));

        fs::write(&path, "not json").unwrap();
        assert!(read_baseline(&path).unwrap().is_none());
    }

    #[test]
    fn test_yaml_round_trip_by_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("openapi.yaml");
        let doc = create_test_document();
        write_atomic(&serialize_for(&doc, &path).unwrap(), &path).unwrap();
        assert!(fs::read_to_string(&path).unwrap().starts_with("openapi:"));
        assert_eq!(read_baseline(&path).unwrap(), Some(doc));
    }
}
