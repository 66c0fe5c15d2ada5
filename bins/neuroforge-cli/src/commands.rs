// CLI command implementations: thin glue over the engine.
use anyhow::{Context, Result};
use neuroforge_common::{Language, ResourceLimits, Submission, TestCase};
use neuroforge_engine::{Coordinator, EngineConfig, LanguageCatalog};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn load_catalog(catalog_path: Option<&Path>) -> Result<LanguageCatalog> {
    match catalog_path {
        Some(path) => LanguageCatalog::load(path)
            .with_context(|| format!("failed to load catalog from {}", path.display())),
        None => Ok(LanguageCatalog::load_default()),
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    file: &Path,
    language: &str,
    problem: &str,
    input: Option<&str>,
    expect: Option<&str>,
    wall_time_ms: Option<u64>,
    memory_mb: Option<u64>,
    cancel_after_ms: Option<u64>,
    catalog_path: Option<&Path>,
) -> Result<()> {
    let language: Language = language
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))
        .context("valid options: python, java, rust")?;

    let code = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let catalog = load_catalog(catalog_path)?;
    let config = EngineConfig::from_env();

    let mut submission = Submission::new(problem, language, code);
    if input.is_some() || expect.is_some() {
        submission.test_cases = vec![TestCase {
            id: 1,
            input: input.unwrap_or("").to_string(),
            expected_output: expect.unwrap_or("").to_string(),
        }];
    }
    if wall_time_ms.is_some() || memory_mb.is_some() {
        let mut limits = config.default_limits;
        if let Some(wall) = wall_time_ms {
            limits.wall_time_ms = wall;
            limits.cpu_time_ms = limits.cpu_time_ms.min(wall);
        }
        if let Some(mb) = memory_mb {
            limits.memory_bytes = mb * 1024 * 1024;
        }
        submission.limits = Some(limits);
    }

    info!(
        submission_id = %submission.id,
        language = %language,
        file = %file.display(),
        "submitting"
    );

    let coordinator = Coordinator::new(config, catalog)?;

    let cancel = CancellationToken::new();
    if let Some(after_ms) = cancel_after_ms {
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(after_ms)).await;
            trigger.cancel();
        });
    }

    let outcome = coordinator.execute_with_cancel(submission, cancel).await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

pub fn languages(catalog_path: Option<&Path>) -> Result<()> {
    let catalog = load_catalog(catalog_path)?;
    let mut names: Vec<String> = catalog.list().iter().map(|l| l.to_string()).collect();
    names.sort();
    for name in names {
        println!("{}", name);
    }
    Ok(())
}
