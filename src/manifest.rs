//! Input manifest parsing and validation.
//!
//! Two accepted shapes:
//! - Rich: `{ "project": ..., "branchName": ..., "description": ...,
//!   "userStories": [ ... ] }`
//! - Flat: a bare JSON array of story objects
//!
//! Story fields use camelCase (`acceptanceCriteria`) with a snake_case
//! fallback, matching manifests produced by different generators.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// A single story entry from the manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestStory {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "acceptanceCriteria")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub priority: Option<u32>,
    /// Pre-marked as done by the manifest author; such stories are skipped.
    #[serde(default)]
    pub passes: Option<bool>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Rich manifest wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub project: String,
    #[serde(default, alias = "branchName")]
    pub branch_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "userStories")]
    pub user_stories: Vec<ManifestStory>,
}

/// Load and validate stories from a manifest file.
///
/// Validation failures are configuration errors and fatal at startup:
/// missing/duplicate IDs and unknown dependency references all abort. Cycle
/// detection happens later on the assembled graph.
pub fn load_stories(path: &Path) -> Result<Vec<ManifestStory>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read manifest {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("parse manifest {}", path.display()))?;

    let stories: Vec<ManifestStory> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)
            .with_context(|| format!("parse flat story array in {}", path.display()))?,
        serde_json::Value::Object(_) => {
            let manifest: Manifest = serde_json::from_value(value)
                .with_context(|| format!("parse manifest object in {}", path.display()))?;
            manifest.user_stories
        }
        _ => bail!(
            "unrecognized manifest format in {}: expected a JSON array or an object with a userStories key",
            path.display()
        ),
    };

    validate_stories(&stories)?;
    Ok(stories)
}

fn validate_stories(stories: &[ManifestStory]) -> Result<()> {
    if stories.is_empty() {
        bail!("manifest contains no stories");
    }

    let mut errors: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for story in stories {
        if story.id.trim().is_empty() {
            errors.push(format!("story '{}' has an empty id", story.title));
            continue;
        }
        if !seen.insert(story.id.as_str()) {
            errors.push(format!("duplicate story id '{}'", story.id));
        }
    }

    let all_ids: HashSet<&str> = stories.iter().map(|s| s.id.as_str()).collect();
    for story in stories {
        for dep in &story.depends_on {
            if !all_ids.contains(dep.as_str()) {
                errors.push(format!(
                    "story '{}' depends on '{}' which does not exist",
                    story.id, dep
                ));
            }
        }
    }

    if !errors.is_empty() {
        bail!("invalid manifest: {}", errors.join("; "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_manifest(dir: &Path, content: &str) -> std::path::PathBuf {
        let path = dir.join("prd.json");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_rich_format() {
        let dir = tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"{
                "project": "demo",
                "branchName": "weaver/demo",
                "description": "demo project",
                "userStories": [
                    {"id": "US-001", "title": "First", "description": "d",
                     "acceptanceCriteria": ["works"], "priority": 1, "passes": false, "notes": ""},
                    {"id": "US-002", "title": "Second", "acceptanceCriteria": ["also works"],
                     "depends_on": ["US-001"]}
                ]
            }"#,
        );
        let stories = load_stories(&path).unwrap();
        assert_eq!(stories.len(), 2);
        assert_eq!(stories[0].acceptance_criteria, vec!["works"]);
        assert_eq!(stories[1].depends_on, vec!["US-001"]);
    }

    #[test]
    fn test_flat_format_with_snake_case_criteria() {
        let dir = tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"[{"id": "US-001", "title": "Solo", "acceptance_criteria": ["ok"]}]"#,
        );
        let stories = load_stories(&path).unwrap();
        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].acceptance_criteria, vec!["ok"]);
    }

    #[test]
    fn test_missing_id_is_fatal() {
        let dir = tempdir().unwrap();
        let path = write_manifest(dir.path(), r#"[{"id": "", "title": "No id"}]"#);
        let err = load_stories(&path).unwrap_err();
        assert!(err.to_string().contains("empty id"));
    }

    #[test]
    fn test_duplicate_id_is_fatal() {
        let dir = tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"[{"id": "US-001", "title": "a"}, {"id": "US-001", "title": "b"}]"#,
        );
        let err = load_stories(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_unknown_dependency_is_fatal() {
        let dir = tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"[{"id": "US-001", "title": "a", "depends_on": ["US-404"]}]"#,
        );
        let err = load_stories(&path).unwrap_err();
        assert!(err.to_string().contains("US-404"));
    }

    #[test]
    fn test_empty_manifest_is_fatal() {
        let dir = tempdir().unwrap();
        let path = write_manifest(dir.path(), "[]");
        assert!(load_stories(&path).is_err());
    }

    #[test]
    fn test_scalar_manifest_rejected() {
        let dir = tempdir().unwrap();
        let path = write_manifest(dir.path(), r#""just a string""#);
        let err = load_stories(&path).unwrap_err();
        assert!(err.to_string().contains("unrecognized manifest format"));
    }
}
