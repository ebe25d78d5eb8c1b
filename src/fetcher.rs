use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::models::RepoLocator;

const GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("repolens/", env!("CARGO_PKG_VERSION"));

/// Hard cap on raw tree entries before filtering; larger repositories are
/// rejected as `TooLarge`.
const MAX_TREE_ENTRIES: usize = 50_000;

/// Directories that are skipped entirely during analysis: vendored
/// dependencies, build output, caches, and test fixtures.
pub const EXCLUDED_DIRS: &[&str] = &[
    "tests",
    "test",
    "example",
    "examples",
    ".venv",
    "venv",
    ".git",
    ".vscode",
    "cypress",
    "node_modules",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    "dist",
    "build",
    ".tox",
    "target",
    "vendor",
];

/// File extensions worth keeping in the tree listing.
const SOURCE_EXTENSIONS: &[&str] = &[
    "py", "ts", "tsx", "js", "jsx", "rs", "go", "java", "rb", "c", "h", "cpp", "cs", "kt",
    "swift", "md", "txt", "toml", "yaml", "yml", "json",
];

/// Manifest files whose contents are fetched for dependency extraction.
const PACKAGE_FILES: &[&str] = &["package.json", "requirements.txt", "Cargo.toml", "go.mod"];

/// Failures from the repository fetch boundary, typed so the fetch stage can
/// classify them: `NotFound` and `TooLarge` are fatal, the rest are worth a
/// retry.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("repository {0} not found or not accessible")]
    NotFound(String),

    #[error("rate limited by the upstream API")]
    RateLimited,

    #[error("repository too large to analyze: {0}")]
    TooLarge(String),

    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),

    #[error(transparent)]
    Network(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct RepoFile {
    pub path: String,
    pub size: u64,
    /// Only populated for the readme and manifest files.
    pub content: Option<String>,
}

/// Snapshot of a remote repository, bounded by the fetcher's limits.
#[derive(Debug, Clone)]
pub struct FetchedRepo {
    pub owner: String,
    pub name: String,
    pub description: Option<String>,
    pub default_branch: String,
    pub files: Vec<RepoFile>,
    /// True when the listing was cut off by the API or by `max_files`.
    pub truncated: bool,
}

#[async_trait]
pub trait RepositoryFetcher: Send + Sync {
    async fn fetch(&self, locator: &RepoLocator) -> Result<FetchedRepo, FetchError>;
}

// ── GitHub REST implementation ────────────────────────────────────────

pub struct GitHubFetcher {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    max_files: usize,
    max_file_bytes: u64,
}

#[derive(Deserialize)]
struct RepoMetadata {
    name: String,
    description: Option<String>,
    default_branch: String,
}

#[derive(Deserialize)]
struct TreeResponse {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: u64,
}

impl GitHubFetcher {
    pub fn new(token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build GitHub HTTP client")?;
        Ok(Self {
            client,
            base_url: GITHUB_API_URL.to_string(),
            token,
            max_files: 2000,
            max_file_bytes: 512 * 1024,
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json");
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn repo_metadata(&self, locator: &RepoLocator) -> Result<RepoMetadata, FetchError> {
        let url = format!("{}/repos/{}/{}", self.base_url, locator.owner, locator.name);
        let resp = self.get(&url).send().await?;
        match resp.status().as_u16() {
            200 => Ok(resp.json::<RepoMetadata>().await?),
            404 => Err(FetchError::NotFound(locator.to_string())),
            403 | 429 => Err(FetchError::RateLimited),
            status => Err(FetchError::UpstreamStatus(status)),
        }
    }

    async fn tree(
        &self,
        locator: &RepoLocator,
        branch: &str,
    ) -> Result<TreeResponse, FetchError> {
        let url = format!(
            "{}/repos/{}/{}/git/trees/{}?recursive=1",
            self.base_url, locator.owner, locator.name, branch
        );
        let resp = self.get(&url).send().await?;
        match resp.status().as_u16() {
            200 => Ok(resp.json::<TreeResponse>().await?),
            404 => Err(FetchError::NotFound(locator.to_string())),
            403 | 429 => Err(FetchError::RateLimited),
            status => Err(FetchError::UpstreamStatus(status)),
        }
    }

    /// Fetch one file's raw content. Failures here degrade the analysis
    /// instead of failing it, so the result is an Option.
    async fn file_content(&self, locator: &RepoLocator, path: &str) -> Option<String> {
        let url = format!(
            "{}/repos/{}/{}/contents/{}",
            self.base_url, locator.owner, locator.name, path
        );
        let resp = self
            .get(&url)
            .header("Accept", "application/vnd.github.raw")
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            tracing::debug!(path, status = resp.status().as_u16(), "skipping file content");
            return None;
        }
        resp.text().await.ok()
    }
}

/// Whether a tree path should be kept for analysis.
fn is_relevant_path(path: &str) -> bool {
    let excluded = path
        .split('/')
        .any(|segment| EXCLUDED_DIRS.contains(&segment));
    if excluded {
        return false;
    }
    let file_name = path.rsplit('/').next().unwrap_or(path);
    if PACKAGE_FILES.contains(&file_name) || is_readme_name(file_name) {
        return true;
    }
    match file_name.rsplit_once('.') {
        Some((_, ext)) => SOURCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        None => false,
    }
}

/// "README", "readme.md", "Readme.rst" and friends.
pub fn is_readme_name(file_name: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    lower == "readme" || lower.starts_with("readme.")
}

/// Whether content should be fetched for this path (readme + manifests).
fn wants_content(path: &str) -> bool {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    PACKAGE_FILES.contains(&file_name) || is_readme_name(file_name)
}

#[async_trait]
impl RepositoryFetcher for GitHubFetcher {
    async fn fetch(&self, locator: &RepoLocator) -> Result<FetchedRepo, FetchError> {
        let meta = self.repo_metadata(locator).await?;
        let tree = self.tree(locator, &meta.default_branch).await?;
        if tree.tree.len() > MAX_TREE_ENTRIES {
            return Err(FetchError::TooLarge(format!(
                "{} ({} tree entries)",
                locator,
                tree.tree.len()
            )));
        }

        let mut entries: Vec<TreeEntry> = tree
            .tree
            .into_iter()
            .filter(|e| e.kind == "blob" && is_relevant_path(&e.path))
            .collect();
        let mut truncated = tree.truncated;
        if entries.len() > self.max_files {
            entries.truncate(self.max_files);
            truncated = true;
        }

        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            let content = if wants_content(&entry.path) && entry.size <= self.max_file_bytes {
                self.file_content(locator, &entry.path).await
            } else {
                None
            };
            files.push(RepoFile {
                path: entry.path,
                size: entry.size,
                content,
            });
        }

        tracing::info!(
            repo = %locator,
            file_count = files.len(),
            truncated,
            "fetched repository tree"
        );

        Ok(FetchedRepo {
            owner: locator.owner.clone(),
            name: meta.name,
            description: meta.description,
            default_branch: meta.default_branch,
            files,
            truncated,
        })
    }
}

// ── Fixture implementation ────────────────────────────────────────────

/// Serves a canned repository. Used by the test suite and useful for
/// offline runs; an optional gate semaphore lets tests hold fetches open
/// to observe the worker pool mid-flight.
pub struct FixtureFetcher {
    repo: FetchedRepo,
    gate: Option<std::sync::Arc<tokio::sync::Semaphore>>,
}

impl FixtureFetcher {
    pub fn new(repo: FetchedRepo) -> Self {
        Self { repo, gate: None }
    }

    /// Each fetch consumes one permit from the gate before returning.
    pub fn gated(repo: FetchedRepo, gate: std::sync::Arc<tokio::sync::Semaphore>) -> Self {
        Self {
            repo,
            gate: Some(gate),
        }
    }
}

#[async_trait]
impl RepositoryFetcher for FixtureFetcher {
    async fn fetch(&self, _locator: &RepoLocator) -> Result<FetchedRepo, FetchError> {
        if let Some(ref gate) = self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| anyhow::anyhow!("fetch gate closed"))?;
            permit.forget();
        }
        Ok(self.repo.clone())
    }
}

/// A fetcher that always fails; used to exercise retry and failure paths.
pub struct FailingFetcher {
    pub error_kind: FailingKind,
}

#[derive(Clone, Copy)]
pub enum FailingKind {
    NotFound,
    RateLimited,
}

#[async_trait]
impl RepositoryFetcher for FailingFetcher {
    async fn fetch(&self, locator: &RepoLocator) -> Result<FetchedRepo, FetchError> {
        match self.error_kind {
            FailingKind::NotFound => Err(FetchError::NotFound(locator.to_string())),
            FailingKind::RateLimited => Err(FetchError::RateLimited),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excluded_directories_are_filtered() {
        assert!(!is_relevant_path("node_modules/react/index.js"));
        assert!(!is_relevant_path("src/__pycache__/mod.py"));
        assert!(!is_relevant_path("tests/test_api.py"));
        assert!(!is_relevant_path(".git/config"));
        assert!(!is_relevant_path("target/debug/build.rs"));
    }

    #[test]
    fn test_relevant_source_paths_are_kept() {
        assert!(is_relevant_path("src/main.rs"));
        assert!(is_relevant_path("app/models/user.py"));
        assert!(is_relevant_path("web/src/App.tsx"));
        assert!(is_relevant_path("docs/guide.md"));
        assert!(is_relevant_path("README.md"));
        assert!(is_relevant_path("package.json"));
        assert!(is_relevant_path("go.mod"));
    }

    #[test]
    fn test_irrelevant_extensions_are_dropped() {
        assert!(!is_relevant_path("logo.png"));
        assert!(!is_relevant_path("binary.exe"));
        assert!(!is_relevant_path("Makefile"));
    }

    #[test]
    fn test_readme_name_matching() {
        assert!(is_readme_name("README.md"));
        assert!(is_readme_name("readme"));
        assert!(is_readme_name("Readme.rst"));
        assert!(!is_readme_name("readme-generator.py"));
        assert!(!is_readme_name("NOTREADME.md"));
    }

    #[test]
    fn test_content_wanted_only_for_readme_and_manifests() {
        assert!(wants_content("README.md"));
        assert!(wants_content("backend/requirements.txt"));
        assert!(wants_content("Cargo.toml"));
        assert!(!wants_content("src/main.rs"));
        assert!(!wants_content("docs/guide.md"));
    }

    #[tokio::test]
    async fn test_fixture_fetcher_returns_canned_repo() {
        let repo = FetchedRepo {
            owner: "org".to_string(),
            name: "repo".to_string(),
            description: None,
            default_branch: "main".to_string(),
            files: vec![RepoFile {
                path: "main.go".to_string(),
                size: 10,
                content: None,
            }],
            truncated: false,
        };
        let fetcher = FixtureFetcher::new(repo);
        let locator = RepoLocator::parse("org/repo").unwrap();
        let fetched = fetcher.fetch(&locator).await.unwrap();
        assert_eq!(fetched.files.len(), 1);
        assert_eq!(fetched.default_branch, "main");
    }

    #[tokio::test]
    async fn test_failing_fetcher_kinds() {
        let locator = RepoLocator::parse("org/repo").unwrap();
        let fetcher = FailingFetcher {
            error_kind: FailingKind::NotFound,
        };
        assert!(matches!(
            fetcher.fetch(&locator).await.unwrap_err(),
            FetchError::NotFound(_)
        ));
        let fetcher = FailingFetcher {
            error_kind: FailingKind::RateLimited,
        };
        assert!(matches!(
            fetcher.fetch(&locator).await.unwrap_err(),
            FetchError::RateLimited
        ));
    }
}
