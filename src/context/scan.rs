//! Project scanning: file tree, requirement documents, dependencies and
//! project type inference.
//!
//! Every function here reads from disk and is independent of the others, so
//! a failure in one source leaves the rest of a refresh intact.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use walkdir::WalkDir;

/// Directories never descended into.
const SKIPPED_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "dist",
    "build",
    "out",
    "vendor",
    "coverage",
    "__pycache__",
    "venv",
    "env",
];

/// Cap on tree entries so huge repositories stay cheap to snapshot.
const MAX_TREE_ENTRIES: usize = 500;

const MAX_REQUIREMENTS: usize = 50;

pub const REQUIREMENT_DOCS: &[&str] = &[
    "PRD.md",
    "REQUIREMENTS.md",
    "requirements.md",
    "SPEC.md",
    "docs/requirements.md",
];

const KEY_FILES: &[&str] = &[
    "package.json",
    "Cargo.toml",
    "pyproject.toml",
    "requirements.txt",
    "go.mod",
    "README.md",
    "tsconfig.json",
    "vite.config.ts",
    "vite.config.js",
    "next.config.js",
    "next.config.mjs",
    "Dockerfile",
    "docker-compose.yml",
    "Makefile",
];

const ENTRY_POINTS: &[&str] = &[
    "main.rs",
    "lib.rs",
    "main.py",
    "app.py",
    "manage.py",
    "index.js",
    "index.ts",
    "main.js",
    "main.ts",
    "server.js",
    "server.ts",
    "App.tsx",
    "App.jsx",
    "main.go",
];

fn is_skipped(name: &str) -> bool {
    name.starts_with('.') || SKIPPED_DIRS.contains(&name)
}

/// Depth-bounded listing relative to `root`. Directories carry a trailing
/// `/`. Depth 1 lists only the root's direct children.
pub fn scan_tree(root: &Path, max_depth: usize) -> io::Result<Vec<String>> {
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped(&e.file_name().to_string_lossy()));

    let mut out = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // Unreadable subdirectories are listed but not descended.
            Err(e) if e.depth() > 0 => continue,
            Err(e) => return Err(e.into()),
        };
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if entry.file_type().is_dir() {
            out.push(format!("{rel}/"));
        } else {
            out.push(rel);
        }
        if out.len() >= MAX_TREE_ENTRIES {
            break;
        }
    }
    Ok(out)
}

fn basename(entry: &str) -> &str {
    entry.rsplit('/').next().unwrap_or(entry)
}

/// Well-known manifest and config files present in the tree.
pub fn key_files(tree: &[String], extra: &[String]) -> Vec<String> {
    let mut found: Vec<String> = tree
        .iter()
        .filter(|e| !e.ends_with('/') && KEY_FILES.contains(&basename(e)))
        .cloned()
        .collect();
    for e in extra {
        if !found.contains(e) {
            found.push(e.clone());
        }
    }
    found
}

/// Conventional program entry points present in the tree, plus the
/// `main` field of `package.json` if declared.
pub fn entry_points(root: &Path, tree: &[String]) -> Vec<String> {
    let mut found: Vec<String> = tree
        .iter()
        .filter(|e| !e.ends_with('/') && ENTRY_POINTS.contains(&basename(e)))
        .cloned()
        .collect();
    if let Ok(text) = fs::read_to_string(root.join("package.json")) {
        if let Ok(manifest) = serde_json::from_str::<serde_json::Value>(&text) {
            if let Some(main) = manifest.get("main").and_then(|m| m.as_str()) {
                let main = main.trim_start_matches("./").to_string();
                if !found.contains(&main) {
                    found.push(main);
                }
            }
        }
    }
    found
}

/// Content of the sidecar instruction file, `None` if absent.
pub fn read_instruction_file(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn find_requirement_docs(root: &Path) -> Vec<PathBuf> {
    let mut seen = BTreeSet::new();
    REQUIREMENT_DOCS
        .iter()
        .map(|name| root.join(name))
        .filter(|p| p.is_file())
        // Case-insensitive filesystems report both spellings of the same file.
        .filter(|p| {
            let key = fs::canonicalize(p).unwrap_or_else(|_| p.clone());
            seen.insert(key)
        })
        .collect()
}

static NUMBERED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[.)]\s+(.+)$").expect("valid regex"));
static BULLETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-*+•]\s+(?:\[[ xX]\]\s+)?(.+)$").expect("valid regex"));
static OBLIGATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:must|shall|should|required|needs? to|has to|have to)\b")
        .expect("valid regex")
});
static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]\s+").expect("valid regex"));

/// Pull requirement statements out of a markdown document: numbered items,
/// bulleted items and sentences containing an obligation word. Headings and
/// fenced code are ignored. Order is preserved and duplicates dropped.
pub fn extract_requirements(text: &str) -> Vec<String> {
    fn push(s: &str, out: &mut Vec<String>) {
        let s = s.trim().trim_end_matches(['.', ';']).trim();
        if s.len() >= 4 && !out.iter().any(|o| o == s) && out.len() < MAX_REQUIREMENTS {
            out.push(s.to_string());
        }
    }

    let mut out: Vec<String> = Vec::new();

    let mut in_fence = false;
    for raw in text.lines() {
        let line = raw.trim();
        if line.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence || line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(caps) = NUMBERED.captures(line) {
            push(&caps[1], &mut out);
        } else if let Some(caps) = BULLETED.captures(line) {
            push(&caps[1], &mut out);
        } else {
            for sentence in SENTENCE_END.split(line) {
                if OBLIGATION.is_match(sentence) {
                    push(sentence, &mut out);
                }
            }
        }
    }
    out
}

fn requirement_name(spec: &str) -> Option<String> {
    let name: String = spec
        .trim()
        .chars()
        .take_while(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    (!name.is_empty()).then_some(name)
}

/// Dependency manifests read from the project root.
pub const MANIFESTS: &[&str] = &["package.json", "Cargo.toml", "requirements.txt", "pyproject.toml"];

/// Dependency names declared by one of [`MANIFESTS`], sorted. `Ok(None)` if
/// the project has no such file.
pub fn read_manifest(root: &Path, manifest: &str) -> Result<Option<Vec<String>>> {
    let path = root.join(manifest);
    if !path.is_file() {
        return Ok(None);
    }
    let text =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let deps = match manifest {
        "package.json" => package_json_deps(&text),
        "Cargo.toml" => cargo_toml_deps(&text),
        "requirements.txt" => Ok(requirements_txt_deps(&text)),
        "pyproject.toml" => pyproject_deps(&text),
        other => anyhow::bail!("unsupported manifest: {other}"),
    }
    .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(deps.into_iter().collect()))
}

fn package_json_deps(text: &str) -> Result<BTreeSet<String>> {
    let manifest: serde_json::Value = serde_json::from_str(text)?;
    let mut deps = BTreeSet::new();
    for section in ["dependencies", "devDependencies"] {
        if let Some(map) = manifest.get(section).and_then(|v| v.as_object()) {
            deps.extend(map.keys().cloned());
        }
    }
    Ok(deps)
}

fn cargo_toml_deps(text: &str) -> Result<BTreeSet<String>> {
    let manifest: toml::Table = toml::from_str(text)?;
    let mut deps = BTreeSet::new();
    for section in ["dependencies", "dev-dependencies"] {
        if let Some(table) = manifest.get(section).and_then(|v| v.as_table()) {
            deps.extend(table.keys().cloned());
        }
    }
    Ok(deps)
}

fn requirements_txt_deps(text: &str) -> BTreeSet<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('-'))
        .filter_map(requirement_name)
        .collect()
}

fn pyproject_deps(text: &str) -> Result<BTreeSet<String>> {
    let manifest: toml::Table = toml::from_str(text)?;
    let mut deps = BTreeSet::new();
    if let Some(list) = manifest
        .get("project")
        .and_then(|p| p.get("dependencies"))
        .and_then(|d| d.as_array())
    {
        deps.extend(list.iter().filter_map(|v| v.as_str()).filter_map(requirement_name));
    }
    if let Some(table) = manifest
        .get("tool")
        .and_then(|t| t.get("poetry"))
        .and_then(|p| p.get("dependencies"))
        .and_then(|d| d.as_table())
    {
        deps.extend(table.keys().filter(|k| *k != "python").cloned());
    }
    Ok(deps)
}

/// Framework label and the project category it implies.
const FRAMEWORKS: &[(&str, &str, &str)] = &[
    ("next", "Next.js", "web-app"),
    ("react-native", "React Native", "mobile"),
    ("@tauri-apps/api", "Tauri", "desktop"),
    ("tauri", "Tauri", "desktop"),
    ("electron", "Electron", "desktop"),
    ("@angular/core", "Angular", "web-app"),
    ("svelte", "Svelte", "web-app"),
    ("vue", "Vue", "web-app"),
    ("react", "React", "web-app"),
    ("express", "Express", "api"),
    ("fastify", "Fastify", "api"),
    ("fastapi", "FastAPI", "api"),
    ("django", "Django", "web-app"),
    ("flask", "Flask", "api"),
    ("axum", "Axum", "api"),
    ("actix-web", "Actix Web", "api"),
    ("clap", "clap", "cli"),
];

static CATEGORY_KEYWORDS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)\b(?:mobile app|ios|android)\b", "mobile"),
        (
            r"(?i)\b(?:web ?app|website|web application|dashboard|landing page|frontend)\b",
            "web-app",
        ),
        (r"(?i)\b(?:api|endpoints?|rest|graphql|backend|microservice)\b", "api"),
        (r"(?i)\b(?:cli|command[- ]line|terminal tool)\b", "cli"),
        (r"(?i)\b(?:library|sdk|crate)\b", "library"),
    ]
    .into_iter()
    .filter_map(|(re, cat)| Regex::new(re).ok().map(|re| (re, cat)))
    .collect()
});

/// Infer `(category, framework)` from declared dependencies first, then from
/// keywords in the requirement text.
pub fn infer_project(docs_text: &str, dependencies: &[String]) -> (String, Option<String>) {
    for (dep, framework, category) in FRAMEWORKS {
        if dependencies.iter().any(|d| d == dep) {
            return (category.to_string(), Some(framework.to_string()));
        }
    }
    let category = CATEGORY_KEYWORDS
        .iter()
        .find(|(re, _)| re.is_match(docs_text))
        .map(|(_, cat)| *cat)
        .unwrap_or("unknown");
    (category.to_string(), None)
}
