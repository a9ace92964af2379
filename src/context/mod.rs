//! Project context cache.
//!
//! Holds an immutable [`ProjectSnapshot`] of the project directory behind an
//! `Arc` that is swapped wholesale on refresh, so readers always see either
//! the previous snapshot or the new one. Refreshes are serialized by a
//! separate lock; a snapshot older than the TTL is refreshed on read.

pub mod scan;
pub mod scenario;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ContextConfig;

pub use scenario::{ContextField, ContextShape, FALLBACK_GUIDANCE, Scenario, ScenarioContext};

#[derive(Debug, Clone, Serialize)]
pub struct ProjectSnapshot {
    pub root: PathBuf,
    pub requirements: Vec<String>,
    pub requirement_docs: Vec<String>,
    pub category: String,
    pub framework: Option<String>,
    pub file_tree: Vec<String>,
    pub key_files: Vec<String>,
    pub entry_points: Vec<String>,
    pub dependencies: Vec<String>,
    /// Dependencies per manifest file; `dependencies` is their union.
    pub manifest_dependencies: BTreeMap<String, Vec<String>>,
    pub instruction_file: Option<String>,
    pub refreshed_at: DateTime<Utc>,
    pub generation: u64,
    /// `None` until the first refresh.
    #[serde(skip)]
    pub refreshed: Option<Instant>,
}

impl ProjectSnapshot {
    pub fn empty(root: PathBuf) -> Self {
        Self {
            root,
            requirements: Vec::new(),
            requirement_docs: Vec::new(),
            category: "unknown".to_string(),
            framework: None,
            file_tree: Vec::new(),
            key_files: Vec::new(),
            entry_points: Vec::new(),
            dependencies: Vec::new(),
            manifest_dependencies: BTreeMap::new(),
            instruction_file: None,
            refreshed_at: Utc::now(),
            generation: 0,
            refreshed: None,
        }
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.refreshed.is_none_or(|at| at.elapsed() > ttl)
    }
}

pub struct ContextCache {
    root: PathBuf,
    config: ContextConfig,
    snapshot: RwLock<Arc<ProjectSnapshot>>,
    refresh_lock: Mutex<()>,
}

impl ContextCache {
    pub fn new(root: &Path, config: ContextConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            snapshot: RwLock::new(Arc::new(ProjectSnapshot::empty(root.to_path_buf()))),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instruction_file_path(&self) -> PathBuf {
        self.root.join(&self.config.instruction_file)
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.refresh_ttl_secs)
    }

    fn current(&self) -> Arc<ProjectSnapshot> {
        self.snapshot.read().unwrap().clone()
    }

    /// The current snapshot, refreshed first if it is older than the TTL.
    pub fn snapshot(&self) -> Arc<ProjectSnapshot> {
        let snap = self.current();
        if !snap.is_stale(self.ttl()) {
            return snap;
        }
        let _guard = self.refresh_lock.lock().unwrap();
        // Another reader may have refreshed while we waited.
        let snap = self.current();
        if !snap.is_stale(self.ttl()) {
            return snap;
        }
        self.rebuild(&snap)
    }

    /// Re-scan the project unconditionally.
    pub fn refresh(&self) -> Arc<ProjectSnapshot> {
        let _guard = self.refresh_lock.lock().unwrap();
        let previous = self.current();
        self.rebuild(&previous)
    }

    /// Build and publish a new snapshot. Caller holds the refresh lock.
    fn rebuild(&self, previous: &ProjectSnapshot) -> Arc<ProjectSnapshot> {
        let started = Instant::now();
        let root = &self.root;

        let file_tree = match scan::scan_tree(root, self.config.max_depth) {
            Ok(tree) => tree,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "file tree scan failed; keeping previous");
                previous.file_tree.clone()
            }
        };

        let instruction_path = self.instruction_file_path();
        let instruction_file = match scan::read_instruction_file(&instruction_path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %instruction_path.display(), error = %e, "instruction file unreadable; keeping previous");
                previous.instruction_file.clone()
            }
        };

        let mut requirements = Vec::new();
        let mut requirement_docs = Vec::new();
        let mut docs_text = String::new();
        for doc in scan::find_requirement_docs(root) {
            let rel = doc
                .strip_prefix(root)
                .unwrap_or(&doc)
                .to_string_lossy()
                .replace('\\', "/");
            match std::fs::read_to_string(&doc) {
                Ok(text) => {
                    requirements.extend(scan::extract_requirements(&text));
                    docs_text.push_str(&text);
                    docs_text.push('\n');
                    requirement_docs.push(rel);
                }
                Err(e) => warn!(path = %doc.display(), error = %e, "requirement document unreadable"),
            }
        }
        if let Some(content) = &instruction_file {
            requirements.extend(scan::extract_requirements(content));
            docs_text.push_str(content);
        }
        let mut seen = HashSet::new();
        requirements.retain(|r| seen.insert(r.clone()));

        let mut manifest_dependencies = BTreeMap::new();
        for manifest in scan::MANIFESTS {
            match scan::read_manifest(root, manifest) {
                Ok(Some(deps)) => {
                    manifest_dependencies.insert(manifest.to_string(), deps);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(manifest, error = %format!("{e:#}"), "manifest unreadable; keeping previous");
                    if let Some(deps) = previous.manifest_dependencies.get(*manifest) {
                        manifest_dependencies.insert(manifest.to_string(), deps.clone());
                    }
                }
            }
        }
        let dependencies: Vec<String> = manifest_dependencies
            .values()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let (category, framework) = scan::infer_project(&docs_text, &dependencies);
        let mut extra_key_files = requirement_docs.clone();
        if instruction_file.is_some() {
            extra_key_files.push(self.config.instruction_file.clone());
        }
        let key_files = scan::key_files(&file_tree, &extra_key_files);
        let entry_points = scan::entry_points(root, &file_tree);

        let snapshot = Arc::new(ProjectSnapshot {
            root: root.clone(),
            requirements,
            requirement_docs,
            category,
            framework,
            file_tree,
            key_files,
            entry_points,
            dependencies,
            manifest_dependencies,
            instruction_file,
            refreshed_at: Utc::now(),
            generation: previous.generation + 1,
            refreshed: Some(Instant::now()),
        });

        *self.snapshot.write().unwrap() = snapshot.clone();
        info!(
            generation = snapshot.generation,
            requirements = snapshot.requirements.len(),
            files = snapshot.file_tree.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "project context refreshed"
        );
        snapshot
    }

    /// Context for `scenario`, rendered from a fresh snapshot.
    pub fn get_context_for(&self, scenario: Scenario, extra: Option<&str>) -> ScenarioContext {
        let snap = self.snapshot();
        debug!(scenario = %scenario, generation = snap.generation, "rendering context");
        scenario::render(&snap, scenario, extra, &self.config.instruction_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn cache_for(root: &Path) -> ContextCache {
        ContextCache::new(root, ContextConfig::default())
    }

    #[test]
    fn first_read_triggers_refresh() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("PRD.md"), "- Users can sign up\n").unwrap();
        let cache = cache_for(tmp.path());
        let snap = cache.snapshot();
        assert_eq!(snap.generation, 1);
        assert_eq!(snap.requirements, vec!["Users can sign up"]);
        assert_eq!(snap.requirement_docs, vec!["PRD.md"]);
    }

    #[test]
    fn fresh_snapshot_is_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_for(tmp.path());
        let a = cache.snapshot();
        let b = cache.snapshot();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn refresh_then_read_sees_new_content() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_for(tmp.path());
        assert!(cache.snapshot().instruction_file.is_none());

        fs::write(tmp.path().join("CLAUDE.md"), "1. Use Rust\n").unwrap();
        let refreshed = cache.refresh();
        assert_eq!(refreshed.generation, 2);
        let read = cache.snapshot();
        assert!(Arc::ptr_eq(&refreshed, &read));
        assert_eq!(read.instruction_file.as_deref(), Some("1. Use Rust\n"));
        assert!(read.requirements.contains(&"Use Rust".to_string()));
        assert!(read.key_files.contains(&"CLAUDE.md".to_string()));
    }

    #[test]
    fn zero_ttl_refreshes_on_every_read() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ContextConfig {
            refresh_ttl_secs: 0,
            ..ContextConfig::default()
        };
        let cache = ContextCache::new(tmp.path(), config);
        let first = cache.snapshot().generation;
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.snapshot().generation > first);
    }

    #[test]
    fn failed_source_keeps_previous_value() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("package.json"),
            r#"{"dependencies": {"express": "^4"}}"#,
        )
        .unwrap();
        let cache = cache_for(tmp.path());
        assert_eq!(cache.snapshot().dependencies, vec!["express"]);

        fs::write(tmp.path().join("package.json"), "{ broken").unwrap();
        let snap = cache.refresh();
        assert_eq!(snap.dependencies, vec!["express"]);
        assert_eq!(snap.framework.as_deref(), Some("Express"));
    }

    #[test]
    fn broken_manifest_does_not_hide_the_others() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("package.json"), "{ broken").unwrap();
        fs::write(
            tmp.path().join("Cargo.toml"),
            "[package]\nname = \"svc\"\n\n[dependencies]\naxum = \"0.7\"\n",
        )
        .unwrap();
        let cache = cache_for(tmp.path());
        let snap = cache.snapshot();
        assert_eq!(snap.dependencies, vec!["axum"]);
        assert_eq!(snap.framework.as_deref(), Some("Axum"));
        assert!(!snap.manifest_dependencies.contains_key("package.json"));
    }

    #[test]
    fn requirements_missing_with_empty_project_gives_guidance() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_for(tmp.path());
        let ctx = cache.get_context_for(Scenario::RequirementsMissing, None);
        assert_eq!(ctx.text, FALLBACK_GUIDANCE);
    }

    #[test]
    fn concurrent_readers_never_see_partial_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("PRD.md"), "- A feature\n- B feature\n").unwrap();
        let cache = Arc::new(cache_for(tmp.path()));
        cache.refresh();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        if i == 0 {
                            cache.refresh();
                        }
                        let snap = cache.snapshot();
                        assert_eq!(snap.requirements.len(), 2);
                        assert_eq!(snap.requirement_docs.len(), 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
