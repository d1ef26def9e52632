use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::warn;

/// Metadata parsed from a skill's frontmatter.
#[derive(Debug, Clone)]
pub struct SkillInfo {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
    pub source: SkillSource,
    pub always: bool,
    pub available: bool,
    pub missing_requirements: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillSource {
    Workspace,
    Shared,
}

impl std::fmt::Display for SkillSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkillSource::Workspace => write!(f, "workspace"),
            SkillSource::Shared => write!(f, "shared"),
        }
    }
}

/// Loads markdown skills (`<dir>/<name>/SKILL.md`) from the workspace and an
/// optional shared directory. Workspace skills shadow shared ones by name.
pub struct SkillsLoader {
    roots: Vec<(PathBuf, SkillSource)>,
    frontmatter_re: Regex,
}

impl SkillsLoader {
    pub fn new(workspace: &Path, shared_skills: Option<&Path>) -> Result<Self, regex::Error> {
        let mut roots = vec![(workspace.join("skills"), SkillSource::Workspace)];
        if let Some(shared) = shared_skills {
            roots.push((shared.to_path_buf(), SkillSource::Shared));
        }
        Ok(Self {
            roots,
            frontmatter_re: Regex::new(r"(?s)^---\r?\n(.*?)\r?\n---")?,
        })
    }

    /// All skills, workspace first, deduplicated by name.
    pub fn list_skills(&self) -> Vec<SkillInfo> {
        let mut seen = HashSet::new();
        let mut skills = Vec::new();
        for (root, source) in &self.roots {
            for skill in self.scan_dir(root, *source) {
                if seen.insert(skill.name.clone()) {
                    skills.push(skill);
                }
            }
        }
        skills
    }

    /// Names of available skills marked `always: true`.
    pub fn get_always_skills(&self) -> Vec<String> {
        self.list_skills()
            .into_iter()
            .filter(|s| s.always && s.available)
            .map(|s| s.name)
            .collect()
    }

    pub fn load_skill(&self, name: &str) -> Option<String> {
        self.roots
            .iter()
            .map(|(root, _)| root.join(name).join("SKILL.md"))
            .find(|p| p.is_file())
            .and_then(|p| std::fs::read_to_string(p).ok())
    }

    /// Concatenate the named skills' bodies for the prompt, frontmatter removed.
    pub fn load_skills_for_context(&self, names: &[String]) -> String {
        names
            .iter()
            .filter_map(|name| {
                self.load_skill(name)
                    .map(|content| format!("### Skill: {name}\n\n{}", self.strip_frontmatter(&content)))
            })
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }

    /// One line per on-demand skill. Always-on skills are loaded in full
    /// elsewhere and left out here.
    pub fn build_skills_summary(&self) -> String {
        self.list_skills()
            .iter()
            .filter(|s| !s.always)
            .map(|s| {
                let mut line = format!("- **{}**: {} (`{}`)", s.name, s.description, s.path.display());
                if !s.available {
                    line.push_str(&format!(" [needs: {}]", s.missing_requirements.join(", ")));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn scan_dir(&self, dir: &Path, source: SkillSource) -> Vec<SkillInfo> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };

        let mut found: Vec<SkillInfo> = entries
            .flatten()
            .filter_map(|entry| {
                let skill_file = entry.path().join("SKILL.md");
                if !skill_file.is_file() {
                    return None;
                }
                let name = entry.file_name().to_str()?.to_string();
                let content = match std::fs::read_to_string(&skill_file) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("Failed to read skill {name}: {e}");
                        return None;
                    }
                };
                let meta = self.parse_frontmatter(&content);
                let (available, missing_requirements) = check_requirements(&meta);
                Some(SkillInfo {
                    name,
                    description: meta.get("description").cloned().unwrap_or_default(),
                    path: skill_file,
                    source,
                    always: meta.get("always").is_some_and(|v| v == "true"),
                    available,
                    missing_requirements,
                })
            })
            .collect();
        // read_dir order is platform-dependent; keep prompts stable.
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    fn parse_frontmatter(&self, content: &str) -> HashMap<String, String> {
        let Some(block) = self.frontmatter_re.captures(content).and_then(|c| c.get(1)) else {
            return HashMap::new();
        };
        block
            .as_str()
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| {
                (
                    k.trim().to_string(),
                    v.trim().trim_matches('"').trim_matches('\'').to_string(),
                )
            })
            .collect()
    }

    fn strip_frontmatter<'a>(&self, content: &'a str) -> &'a str {
        match self.frontmatter_re.find(content) {
            Some(m) => content[m.end()..].trim_start(),
            None => content,
        }
    }
}

/// Check `metadata: {"switchyard": {"requires": {"bins": [..], "env": [..]}}}`.
fn check_requirements(meta: &HashMap<String, String>) -> (bool, Vec<String>) {
    let requires = meta
        .get("metadata")
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
        .and_then(|v| v.get("switchyard").and_then(|s| s.get("requires")).cloned());
    let Some(requires) = requires else {
        return (true, Vec::new());
    };

    let list = |key: &str| -> Vec<String> {
        requires
            .get(key)
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    };

    let mut missing: Vec<String> = list("bins")
        .into_iter()
        .filter(|bin| which::which(bin).is_err())
        .map(|bin| format!("CLI: {bin}"))
        .collect();
    missing.extend(
        list("env")
            .into_iter()
            .filter(|var| std::env::var(var).is_err())
            .map(|var| format!("ENV: {var}")),
    );
    (missing.is_empty(), missing)
}
