//! Git metadata enrichment for outgoing envelopes.
//!
//! Branch and commit are cached for a short TTL so long-running sessions pick
//! up branch switches. The repository slug is resolved once per process.
//! Resolution failures leave the field empty; enrichment never fails emission.

use crate::envelope::{Envelope, GitMetadata};
use crate::sync::ProjectIdentity;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Default lifetime of cached branch/commit lookups.
pub const DEFAULT_GIT_CACHE_TTL: Duration = Duration::from_secs(2);

/// Read-only queries against the working copy.
pub trait GitContext: Send + Sync {
    fn resolve_branch(&self) -> Option<String>;
    fn resolve_commit(&self) -> Option<String>;
    fn resolve_repo_slug(&self) -> Option<String>;
}

/// Resolves git context by running the `git` binary in a working directory.
#[derive(Debug, Clone)]
pub struct CommandGitContext {
    working_dir: PathBuf,
}

impl CommandGitContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Trimmed stdout of a successful git invocation.
    fn git(&self, args: &[&str]) -> Option<String> {
        let output = Command::new("git")
            .current_dir(&self.working_dir)
            .args(args)
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

impl GitContext for CommandGitContext {
    fn resolve_branch(&self) -> Option<String> {
        // Detached HEAD reports "HEAD".
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .filter(|branch| branch != "HEAD")
    }

    fn resolve_commit(&self) -> Option<String> {
        self.git(&["rev-parse", "HEAD"])
    }

    fn resolve_repo_slug(&self) -> Option<String> {
        self.git(&["config", "--get", "remote.origin.url"])
            .and_then(|url| parse_repo_slug(&url))
    }
}

/// Extracts `owner/name` from an scp-style or URL remote.
///
/// `git@github.com:acme/widgets.git` and
/// `https://github.com/acme/widgets` both yield `acme/widgets`.
pub fn parse_repo_slug(url: &str) -> Option<String> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| {
            Regex::new(r"^(?:[A-Za-z][A-Za-z0-9+.-]*://)?(?:[^@/]+@)?[^:/]+(?::\d+)?[:/](.+?)(?:\.git)?/?$")
                .ok()
        })
        .as_ref()?;

    let captures = pattern.captures(url.trim())?;
    let slug = captures.get(1)?.as_str().trim_matches('/');
    (!slug.is_empty()).then(|| slug.to_string())
}

#[derive(Debug, Clone)]
struct CachedHead {
    branch: Option<String>,
    commit: Option<String>,
    resolved_at: Instant,
}

/// Stamps git metadata and project identity onto envelopes.
pub struct MetadataEnricher {
    git: Arc<dyn GitContext>,
    ttl: Duration,
    head: Mutex<Option<CachedHead>>,
    repo_slug: OnceLock<Option<String>>,
    repo_slug_override: Option<String>,
}

impl MetadataEnricher {
    pub fn new(git: Arc<dyn GitContext>, ttl: Duration, repo_slug_override: Option<String>) -> Self {
        Self {
            git,
            ttl,
            head: Mutex::new(None),
            repo_slug: OnceLock::new(),
            repo_slug_override,
        }
    }

    /// Current branch, commit and repository slug.
    pub fn metadata(&self) -> GitMetadata {
        let (git_branch, head_commit_sha) = self.head();
        GitMetadata {
            git_branch,
            head_commit_sha,
            repo_slug: self.repo_slug(),
        }
    }

    /// Fills enrichment fields. Identity fields already set are kept.
    pub fn enrich(&self, envelope: &mut Envelope, identity: Option<&ProjectIdentity>) {
        envelope.git = self.metadata();

        let Some(identity) = identity else {
            return;
        };
        if envelope.project_uuid.is_none() {
            envelope.project_uuid = Some(identity.project_uuid);
        }
        if envelope.project_slug.is_none() {
            envelope.project_slug.clone_from(&identity.project_slug);
        }
        if envelope.team_slug.is_none() {
            envelope.team_slug.clone_from(&identity.team_slug);
        }
    }

    fn head(&self) -> (Option<String>, Option<String>) {
        let mut cached = self.head.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(head) = cached.as_ref() {
            if head.resolved_at.elapsed() < self.ttl {
                return (head.branch.clone(), head.commit.clone());
            }
        }

        let head = CachedHead {
            branch: self.git.resolve_branch(),
            commit: self.git.resolve_commit(),
            resolved_at: Instant::now(),
        };
        tracing::trace!(branch = ?head.branch, commit = ?head.commit, "resolved git head");
        let resolved = (head.branch.clone(), head.commit.clone());
        *cached = Some(head);
        resolved
    }

    fn repo_slug(&self) -> Option<String> {
        self.repo_slug
            .get_or_init(|| match &self.repo_slug_override {
                Some(slug) => Some(slug.clone()),
                None => self.git.resolve_repo_slug(),
            })
            .clone()
    }
}
