use std::path::{Path, PathBuf};

use gateway_core::Template;
use tracing::warn;

/// One JSON file per template, basename = template name + `.json` (§6
/// "Persisted state layout").
pub fn template_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

/// Write-through for `POST /api/templates`. Creates `dir` if it doesn't
/// exist yet so a fresh deployment doesn't need to pre-create it.
pub async fn save_template(dir: &Path, template: &Template) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let body = serde_json::to_vec_pretty(template)
        .expect("Template serialization is infallible for well-formed structs");
    tokio::fs::write(template_path(dir, &template.name), body).await
}

/// Write-through for `DELETE /api/templates/{name}`. Missing files are not
/// an error — deleting something already gone is a no-op.
pub async fn delete_template(dir: &Path, name: &str) -> std::io::Result<()> {
    match tokio::fs::remove_file(template_path(dir, name)).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Loads every `*.json` file in `dir` as a [`Template`] at startup.
/// A file that fails to parse is logged and skipped rather than aborting
/// the whole load — one bad file shouldn't take every other template down
/// with it.
pub async fn load_templates_dir(dir: &Path) -> std::io::Result<Vec<Template>> {
    let mut templates = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(templates),
        Err(err) => return Err(err),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = tokio::fs::read(&path).await?;
        match serde_json::from_slice::<Template>(&bytes) {
            Ok(template) => templates.push(template),
            Err(err) => warn!(path = %path.display(), %err, "skipping unparsable template file"),
        }
    }

    Ok(templates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::TransportKind;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn template(name: &str) -> Template {
        Template {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            transport: TransportKind::Subprocess,
            command: Some("echo".to_string()),
            args: vec![],
            env: BTreeMap::new(),
            base_url: None,
            auth: None,
            timeout_ms: Template::default_timeout_ms(),
            retries: 0,
            trust_level: None,
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips_a_template() {
        let dir = tempdir().unwrap();
        save_template(dir.path(), &template("svc-a")).await.unwrap();

        let loaded = load_templates_dir(dir.path()).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "svc-a");
    }

    #[tokio::test]
    async fn delete_is_a_no_op_when_the_file_is_already_gone() {
        let dir = tempdir().unwrap();
        assert!(delete_template(dir.path(), "ghost").await.is_ok());
    }

    #[tokio::test]
    async fn loading_a_missing_directory_yields_an_empty_list() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let loaded = load_templates_dir(&missing).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_the_saved_file() {
        let dir = tempdir().unwrap();
        save_template(dir.path(), &template("svc-a")).await.unwrap();
        delete_template(dir.path(), "svc-a").await.unwrap();

        let loaded = load_templates_dir(dir.path()).await.unwrap();
        assert!(loaded.is_empty());
    }
}
