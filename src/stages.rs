use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::fetcher::{FetchError, FetchedRepo, RepositoryFetcher, is_readme_name};
use crate::models::RepoLocator;

/// Longest readme excerpt carried in the stage payload.
const README_EXCERPT_LIMIT: usize = 4000;

/// Outcome of one stage execution. Retry policy lives in the orchestrator;
/// stages only classify their failures.
pub enum StageOutcome {
    Ok(Value),
    Retryable(anyhow::Error),
    Fatal(anyhow::Error),
}

/// Accumulated context flowing through a job's pipeline. Later stages read
/// what earlier stages produced.
pub struct StageContext {
    pub locator: RepoLocator,
    pub repo: Option<FetchedRepo>,
    /// (stage name, payload) for every completed stage, in order.
    pub completed: Vec<(String, Value)>,
}

impl StageContext {
    pub fn new(locator: RepoLocator) -> Self {
        Self {
            locator,
            repo: None,
            completed: Vec::new(),
        }
    }

    pub fn payload_of(&self, stage: &str) -> Option<&Value> {
        self.completed
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, payload)| payload)
    }
}

/// One discrete analysis step. Stages run sequentially per job; a stage
/// never observes a partially-executed predecessor.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, ctx: &mut StageContext) -> StageOutcome;
}

/// The fixed pipeline, in execution order.
pub fn default_stages(fetcher: Arc<dyn RepositoryFetcher>) -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(FetchStage { fetcher }),
        Box::new(ReadmeStage),
        Box::new(StructureStage),
        Box::new(DetectLanguageStage),
        Box::new(DependenciesStage),
        Box::new(SummaryStage),
    ]
}

// ── fetch ─────────────────────────────────────────────────────────────

pub struct FetchStage {
    pub fetcher: Arc<dyn RepositoryFetcher>,
}

#[async_trait]
impl Stage for FetchStage {
    fn name(&self) -> &'static str {
        "fetch"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageOutcome {
        match self.fetcher.fetch(&ctx.locator).await {
            Ok(repo) => {
                let payload = json!({
                    "owner": repo.owner,
                    "name": repo.name,
                    "description": repo.description,
                    "default_branch": repo.default_branch,
                    "file_count": repo.files.len(),
                    "truncated": repo.truncated,
                });
                ctx.repo = Some(repo);
                StageOutcome::Ok(payload)
            }
            // An absent or oversized repository will not appear on retry.
            Err(err @ (FetchError::NotFound(_) | FetchError::TooLarge(_))) => {
                StageOutcome::Fatal(err.into())
            }
            Err(err) => StageOutcome::Retryable(err.into()),
        }
    }
}

// ── readme ────────────────────────────────────────────────────────────

pub struct ReadmeStage;

#[async_trait]
impl Stage for ReadmeStage {
    fn name(&self) -> &'static str {
        "readme"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageOutcome {
        let Some(repo) = ctx.repo.as_ref() else {
            return StageOutcome::Fatal(anyhow::anyhow!("readme stage ran before fetch"));
        };
        // Prefer a root-level readme over nested ones.
        let mut candidates: Vec<&crate::fetcher::RepoFile> = repo
            .files
            .iter()
            .filter(|f| is_readme_name(f.path.rsplit('/').next().unwrap_or(&f.path)))
            .collect();
        candidates.sort_by_key(|f| f.path.matches('/').count());

        let payload = match candidates.first() {
            Some(file) => {
                let excerpt = file.content.as_deref().map(|c| {
                    let mut end = c.len().min(README_EXCERPT_LIMIT);
                    while !c.is_char_boundary(end) {
                        end -= 1;
                    }
                    c[..end].to_string()
                });
                json!({
                    "has_readme": true,
                    "path": file.path,
                    "excerpt": excerpt,
                })
            }
            None => json!({"has_readme": false}),
        };
        StageOutcome::Ok(payload)
    }
}

// ── structure ─────────────────────────────────────────────────────────

pub struct StructureStage;

#[async_trait]
impl Stage for StructureStage {
    fn name(&self) -> &'static str {
        "structure"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageOutcome {
        let Some(repo) = ctx.repo.as_ref() else {
            return StageOutcome::Fatal(anyhow::anyhow!("structure stage ran before fetch"));
        };

        let mut top_level: BTreeMap<String, usize> = BTreeMap::new();
        let mut root_files = 0usize;
        for file in &repo.files {
            match file.path.split_once('/') {
                Some((dir, _)) => *top_level.entry(dir.to_string()).or_default() += 1,
                None => root_files += 1,
            }
        }

        StageOutcome::Ok(json!({
            "total_files": repo.files.len(),
            "root_files": root_files,
            "directories": top_level,
        }))
    }
}

// ── detect_language ───────────────────────────────────────────────────

pub struct DetectLanguageStage;

fn language_for_extension(ext: &str) -> Option<&'static str> {
    match ext {
        "rs" => Some("Rust"),
        "py" => Some("Python"),
        "go" => Some("Go"),
        "ts" | "tsx" => Some("TypeScript"),
        "js" | "jsx" => Some("JavaScript"),
        "java" => Some("Java"),
        "rb" => Some("Ruby"),
        "c" | "h" => Some("C"),
        "cpp" => Some("C++"),
        "cs" => Some("C#"),
        "kt" => Some("Kotlin"),
        "swift" => Some("Swift"),
        _ => None,
    }
}

#[async_trait]
impl Stage for DetectLanguageStage {
    fn name(&self) -> &'static str {
        "detect_language"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageOutcome {
        let Some(repo) = ctx.repo.as_ref() else {
            return StageOutcome::Fatal(anyhow::anyhow!(
                "detect_language stage ran before fetch"
            ));
        };

        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for file in &repo.files {
            let Some((_, ext)) = file.path.rsplit_once('.') else {
                continue;
            };
            if let Some(language) = language_for_extension(&ext.to_ascii_lowercase()) {
                *counts.entry(language).or_default() += 1;
            }
        }

        // BTreeMap iteration makes tie-breaking deterministic across runs.
        let dominant = counts
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(language, _)| *language);

        StageOutcome::Ok(json!({
            "language": dominant,
            "languages": counts,
        }))
    }
}

// ── dependencies ──────────────────────────────────────────────────────

pub struct DependenciesStage;

fn parse_package_json(content: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<Value>(content) else {
        return Vec::new();
    };
    let mut deps = Vec::new();
    for key in ["dependencies", "devDependencies"] {
        if let Some(map) = value.get(key).and_then(Value::as_object) {
            deps.extend(map.keys().cloned());
        }
    }
    deps
}

fn parse_requirements_txt(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('-'))
        .map(|line| {
            line.split(|c: char| "=<>!~[; ".contains(c))
                .next()
                .unwrap_or(line)
                .to_string()
        })
        .filter(|name| !name.is_empty())
        .collect()
}

fn parse_cargo_toml(content: &str) -> Vec<String> {
    let mut deps = Vec::new();
    let mut in_deps = false;
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_deps = line == "[dependencies]" || line == "[dev-dependencies]";
            continue;
        }
        if in_deps && !line.is_empty() && !line.starts_with('#') {
            if let Some(name) = line.split('=').next() {
                let name = name.trim();
                if !name.is_empty() {
                    deps.push(name.to_string());
                }
            }
        }
    }
    deps
}

fn parse_go_mod(content: &str) -> Vec<String> {
    let mut deps = Vec::new();
    let mut in_block = false;
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with("require (") {
            in_block = true;
            continue;
        }
        if in_block {
            if line == ")" {
                in_block = false;
                continue;
            }
            if let Some(module) = line.split_whitespace().next() {
                deps.push(module.to_string());
            }
        } else if let Some(rest) = line.strip_prefix("require ") {
            if let Some(module) = rest.split_whitespace().next() {
                deps.push(module.to_string());
            }
        }
    }
    deps
}

#[async_trait]
impl Stage for DependenciesStage {
    fn name(&self) -> &'static str {
        "dependencies"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageOutcome {
        let Some(repo) = ctx.repo.as_ref() else {
            return StageOutcome::Fatal(anyhow::anyhow!("dependencies stage ran before fetch"));
        };

        let mut manifests = Vec::new();
        let mut dependencies = Vec::new();
        for file in &repo.files {
            let file_name = file.path.rsplit('/').next().unwrap_or(&file.path);
            let Some(content) = file.content.as_deref() else {
                continue;
            };
            let parsed = match file_name {
                "package.json" => parse_package_json(content),
                "requirements.txt" => parse_requirements_txt(content),
                "Cargo.toml" => parse_cargo_toml(content),
                "go.mod" => parse_go_mod(content),
                _ => continue,
            };
            manifests.push(file.path.clone());
            dependencies.extend(parsed);
        }
        dependencies.sort();
        dependencies.dedup();

        StageOutcome::Ok(json!({
            "manifests": manifests,
            "dependencies": dependencies,
        }))
    }
}

// ── summary ───────────────────────────────────────────────────────────

pub struct SummaryStage;

#[async_trait]
impl Stage for SummaryStage {
    fn name(&self) -> &'static str {
        "summary"
    }

    async fn run(&self, ctx: &mut StageContext) -> StageOutcome {
        let mut lines = vec![format!("Repository: {}", ctx.locator)];

        if let Some(fetch) = ctx.payload_of("fetch") {
            if let Some(desc) = fetch.get("description").and_then(Value::as_str) {
                lines.push(format!("Description: {}", desc));
            }
            if let Some(count) = fetch.get("file_count").and_then(Value::as_u64) {
                lines.push(format!("Analyzed files: {}", count));
            }
        }
        if let Some(language) = ctx
            .payload_of("detect_language")
            .and_then(|p| p.get("language"))
            .and_then(Value::as_str)
        {
            lines.push(format!("Primary language: {}", language));
        }
        if let Some(deps) = ctx
            .payload_of("dependencies")
            .and_then(|p| p.get("dependencies"))
            .and_then(Value::as_array)
        {
            if !deps.is_empty() {
                let names: Vec<&str> = deps.iter().filter_map(Value::as_str).take(15).collect();
                lines.push(format!("Key dependencies: {}", names.join(", ")));
            }
        }
        if let Some(structure) = ctx.payload_of("structure") {
            if let Some(dirs) = structure.get("directories").and_then(Value::as_object) {
                if !dirs.is_empty() {
                    let names: Vec<&str> = dirs.keys().map(String::as_str).take(10).collect();
                    lines.push(format!("Top-level directories: {}", names.join(", ")));
                }
            }
        }
        if ctx
            .payload_of("readme")
            .and_then(|p| p.get("has_readme"))
            .and_then(Value::as_bool)
            == Some(false)
        {
            lines.push("No readme found.".to_string());
        }

        StageOutcome::Ok(json!({"summary": lines.join("\n")}))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{FixtureFetcher, RepoFile};

    fn sample_repo() -> FetchedRepo {
        FetchedRepo {
            owner: "org".to_string(),
            name: "repo".to_string(),
            description: Some("A sample service".to_string()),
            default_branch: "main".to_string(),
            files: vec![
                RepoFile {
                    path: "README.md".to_string(),
                    size: 24,
                    content: Some("# Sample\nA Go service.".to_string()),
                },
                RepoFile {
                    path: "go.mod".to_string(),
                    size: 64,
                    content: Some(
                        "module example.com/repo\n\nrequire (\n\tgithub.com/gin-gonic/gin v1.9.0\n)\n"
                            .to_string(),
                    ),
                },
                RepoFile {
                    path: "cmd/server/main.go".to_string(),
                    size: 100,
                    content: None,
                },
                RepoFile {
                    path: "internal/handler.go".to_string(),
                    size: 80,
                    content: None,
                },
            ],
            truncated: false,
        }
    }

    async fn context_with_repo() -> StageContext {
        let mut ctx = StageContext::new(RepoLocator::parse("org/repo").unwrap());
        ctx.repo = Some(sample_repo());
        ctx
    }

    fn payload(outcome: StageOutcome) -> Value {
        match outcome {
            StageOutcome::Ok(value) => value,
            StageOutcome::Retryable(err) => panic!("unexpected retryable failure: {}", err),
            StageOutcome::Fatal(err) => panic!("unexpected fatal failure: {}", err),
        }
    }

    #[tokio::test]
    async fn test_fetch_stage_populates_context() {
        let fetcher = Arc::new(FixtureFetcher::new(sample_repo()));
        let stage = FetchStage { fetcher };
        let mut ctx = StageContext::new(RepoLocator::parse("org/repo").unwrap());
        let value = payload(stage.run(&mut ctx).await);
        assert_eq!(value["file_count"], 4);
        assert_eq!(value["default_branch"], "main");
        assert!(ctx.repo.is_some());
    }

    #[tokio::test]
    async fn test_fetch_stage_classifies_not_found_as_fatal() {
        let fetcher = Arc::new(crate::fetcher::FailingFetcher {
            error_kind: crate::fetcher::FailingKind::NotFound,
        });
        let stage = FetchStage { fetcher };
        let mut ctx = StageContext::new(RepoLocator::parse("org/gone").unwrap());
        assert!(matches!(stage.run(&mut ctx).await, StageOutcome::Fatal(_)));
    }

    #[tokio::test]
    async fn test_fetch_stage_classifies_rate_limit_as_retryable() {
        let fetcher = Arc::new(crate::fetcher::FailingFetcher {
            error_kind: crate::fetcher::FailingKind::RateLimited,
        });
        let stage = FetchStage { fetcher };
        let mut ctx = StageContext::new(RepoLocator::parse("org/repo").unwrap());
        assert!(matches!(
            stage.run(&mut ctx).await,
            StageOutcome::Retryable(_)
        ));
    }

    #[tokio::test]
    async fn test_readme_stage_prefers_root_readme() {
        let mut ctx = context_with_repo().await;
        if let Some(repo) = ctx.repo.as_mut() {
            repo.files.push(RepoFile {
                path: "docs/README.md".to_string(),
                size: 5,
                content: Some("nested".to_string()),
            });
        }
        let value = payload(ReadmeStage.run(&mut ctx).await);
        assert_eq!(value["has_readme"], true);
        assert_eq!(value["path"], "README.md");
        assert!(value["excerpt"].as_str().unwrap().contains("Go service"));
    }

    #[tokio::test]
    async fn test_readme_stage_reports_absence() {
        let mut ctx = context_with_repo().await;
        if let Some(repo) = ctx.repo.as_mut() {
            repo.files.retain(|f| !f.path.contains("README"));
        }
        let value = payload(ReadmeStage.run(&mut ctx).await);
        assert_eq!(value["has_readme"], false);
    }

    #[tokio::test]
    async fn test_stage_before_fetch_is_fatal() {
        let mut ctx = StageContext::new(RepoLocator::parse("org/repo").unwrap());
        assert!(matches!(
            ReadmeStage.run(&mut ctx).await,
            StageOutcome::Fatal(_)
        ));
        assert!(matches!(
            DetectLanguageStage.run(&mut ctx).await,
            StageOutcome::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn test_structure_stage_counts_directories() {
        let mut ctx = context_with_repo().await;
        let value = payload(StructureStage.run(&mut ctx).await);
        assert_eq!(value["total_files"], 4);
        assert_eq!(value["root_files"], 2);
        assert_eq!(value["directories"]["cmd"], 1);
        assert_eq!(value["directories"]["internal"], 1);
    }

    #[tokio::test]
    async fn test_detect_language_picks_dominant() {
        let mut ctx = context_with_repo().await;
        let value = payload(DetectLanguageStage.run(&mut ctx).await);
        assert_eq!(value["language"], "Go");
        assert_eq!(value["languages"]["Go"], 2);
    }

    #[tokio::test]
    async fn test_dependencies_stage_parses_go_mod() {
        let mut ctx = context_with_repo().await;
        let value = payload(DependenciesStage.run(&mut ctx).await);
        assert_eq!(value["manifests"][0], "go.mod");
        assert_eq!(value["dependencies"][0], "github.com/gin-gonic/gin");
    }

    #[test]
    fn test_parse_package_json() {
        let deps = parse_package_json(
            r#"{"dependencies": {"react": "^18.0.0"}, "devDependencies": {"vite": "^5.0.0"}}"#,
        );
        assert!(deps.contains(&"react".to_string()));
        assert!(deps.contains(&"vite".to_string()));
        assert!(parse_package_json("not json").is_empty());
    }

    #[test]
    fn test_parse_requirements_txt() {
        let deps = parse_requirements_txt("fastapi==0.110.0\n# comment\nuvicorn[standard]>=0.27\n\n-r other.txt\n");
        assert_eq!(deps, vec!["fastapi", "uvicorn"]);
    }

    #[test]
    fn test_parse_cargo_toml() {
        let deps = parse_cargo_toml(
            "[package]\nname = \"x\"\n\n[dependencies]\ntokio = { version = \"1\" }\nserde = \"1\"\n\n[features]\ndefault = []\n",
        );
        assert_eq!(deps, vec!["tokio", "serde"]);
    }

    #[test]
    fn test_parse_go_mod_single_and_block() {
        let deps = parse_go_mod("module m\n\nrequire github.com/a/b v1.0.0\nrequire (\n\tgithub.com/c/d v2.0.0\n)\n");
        assert_eq!(deps, vec!["github.com/a/b", "github.com/c/d"]);
    }

    #[tokio::test]
    async fn test_summary_stage_composes_from_prior_payloads() {
        let mut ctx = context_with_repo().await;
        for stage in [
            Box::new(FetchStage {
                fetcher: Arc::new(FixtureFetcher::new(sample_repo())),
            }) as Box<dyn Stage>,
            Box::new(ReadmeStage),
            Box::new(StructureStage),
            Box::new(DetectLanguageStage),
            Box::new(DependenciesStage),
        ] {
            let value = payload(stage.run(&mut ctx).await);
            ctx.completed.push((stage.name().to_string(), value));
        }
        let value = payload(SummaryStage.run(&mut ctx).await);
        let summary = value["summary"].as_str().unwrap();
        assert!(summary.contains("org/repo"));
        assert!(summary.contains("Primary language: Go"));
        assert!(summary.contains("github.com/gin-gonic/gin"));
    }

    #[test]
    fn test_default_stages_order() {
        let stages = default_stages(Arc::new(FixtureFetcher::new(sample_repo())));
        let names: Vec<&str> = stages.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "fetch",
                "readme",
                "structure",
                "detect_language",
                "dependencies",
                "summary"
            ]
        );
    }
}
