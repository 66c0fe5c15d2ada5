// Per-language launch configuration for the sandbox runner.
use anyhow::{bail, Context, Result};
use neuroforge_common::{EngineError, Language};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// How one language is compiled and run inside its container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageSpec {
    pub image: String,
    /// File name the source is materialized as under /code.
    pub source_file: String,
    /// Compile step, absent for interpreted languages.
    #[serde(default)]
    pub compile_command: Option<Vec<String>>,
    pub run_command: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogEntry {
    name: Language,
    #[serde(flatten)]
    spec: LanguageSpec,
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogJson {
    languages: Vec<CatalogEntry>,
}

/// Closed table of launchable languages. A `Language` value the table does
/// not contain is reported as unsupported before any sandbox is provisioned.
#[derive(Debug, Clone)]
pub struct LanguageCatalog {
    specs: HashMap<Language, LanguageSpec>,
}

impl LanguageCatalog {
    /// Built-in entries matching the stock neuroforge-* images.
    pub fn builtin() -> Self {
        let mut specs = HashMap::new();
        specs.insert(
            Language::Python,
            LanguageSpec {
                image: "neuroforge-python:latest".to_string(),
                source_file: "main.py".to_string(),
                compile_command: None,
                run_command: vec!["python3".into(), "-u".into(), "/code/main.py".into()],
            },
        );
        specs.insert(
            Language::Java,
            LanguageSpec {
                image: "neuroforge-java:latest".to_string(),
                source_file: "Main.java".to_string(),
                compile_command: Some(vec!["javac".into(), "/code/Main.java".into()]),
                run_command: vec!["java".into(), "-cp".into(), "/code".into(), "Main".into()],
            },
        );
        specs.insert(
            Language::Rust,
            LanguageSpec {
                image: "neuroforge-rust:latest".to_string(),
                source_file: "main.rs".to_string(),
                compile_command: Some(vec![
                    "rustc".into(),
                    "/code/main.rs".into(),
                    "-o".into(),
                    "/code/main".into(),
                ]),
                run_command: vec!["/code/main".into()],
            },
        );
        Self { specs }
    }

    /// Load overrides from a catalog.json file.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("language catalog not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path).context("failed to read catalog.json")?;
        let parsed: CatalogJson =
            serde_json::from_str(&content).context("failed to parse catalog.json")?;

        if parsed.languages.is_empty() {
            bail!("language catalog is empty: {}", config_path.display());
        }

        let mut specs = HashMap::new();
        for entry in parsed.languages {
            specs.insert(entry.name, entry.spec);
        }
        Ok(Self { specs })
    }

    /// Load config/catalog.json when present, otherwise the built-in table.
    pub fn load_default() -> Self {
        let default_path = Path::new("config/catalog.json");
        match Self::load(default_path) {
            Ok(catalog) => catalog,
            Err(_) => Self::builtin(),
        }
    }

    pub fn get(&self, language: Language) -> Result<&LanguageSpec, EngineError> {
        self.specs
            .get(&language)
            .ok_or(EngineError::UnsupportedLanguage(language))
    }

    pub fn list(&self) -> Vec<Language> {
        self.specs.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_covers_every_language_variant() {
        let catalog = LanguageCatalog::builtin();
        for lang in [Language::Python, Language::Java, Language::Rust] {
            let spec = catalog.get(lang).unwrap();
            assert!(!spec.image.is_empty());
            assert!(!spec.run_command.is_empty());
        }
    }

    #[test]
    fn interpreted_languages_have_no_compile_step() {
        let catalog = LanguageCatalog::builtin();
        assert!(catalog.get(Language::Python).unwrap().compile_command.is_none());
        assert!(catalog.get(Language::Rust).unwrap().compile_command.is_some());
        assert!(catalog.get(Language::Java).unwrap().compile_command.is_some());
    }

    #[test]
    fn pruned_catalog_reports_unsupported() {
        let json = r#"{
            "languages": [
                {
                    "name": "python",
                    "image": "neuroforge-python:latest",
                    "source_file": "main.py",
                    "run_command": ["python3", "-u", "/code/main.py"]
                }
            ]
        }"#;
        let parsed: CatalogJson = serde_json::from_str(json).unwrap();
        let mut specs = HashMap::new();
        for entry in parsed.languages {
            specs.insert(entry.name, entry.spec);
        }
        let catalog = LanguageCatalog { specs };

        assert!(catalog.get(Language::Python).is_ok());
        match catalog.get(Language::Java) {
            Err(EngineError::UnsupportedLanguage(Language::Java)) => {}
            other => panic!("expected UnsupportedLanguage, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_catalog_file_is_an_error() {
        assert!(LanguageCatalog::load(Path::new("/nonexistent/catalog.json")).is_err());
    }
}
