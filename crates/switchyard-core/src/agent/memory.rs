use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Days, Local, NaiveDate};

/// Daily notes older than this many days are left out of retrieval.
const DAILY_WINDOW_DAYS: u64 = 7;

const DAILY_SEPARATOR: &str = "\n\n---\n\n";

/// Where a retrieved memory entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySource {
    LongTerm,
    History,
    Daily,
}

/// One paragraph of memory, scored against a query.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    pub text: String,
    pub source: MemorySource,
    /// Higher is newer. Long-term facts precede every history entry, and
    /// daily notes follow it.
    pub recency: usize,
    /// Number of distinct query keywords the entry mentions.
    pub score: usize,
}

/// File-backed memory under `<workspace>/memory/`: MEMORY.md (facts),
/// HISTORY.md (append-only event log) and one `YYYY-MM-DD.md` per day of notes.
#[derive(Clone)]
pub struct MemoryStore {
    dir: PathBuf,
    memory_path: PathBuf,
    history_path: PathBuf,
}

impl MemoryStore {
    pub fn new(workspace: &Path) -> Self {
        let dir = workspace.join("memory");
        Self {
            memory_path: dir.join("MEMORY.md"),
            history_path: dir.join("HISTORY.md"),
            dir,
        }
    }

    pub fn memory_path(&self) -> &Path {
        &self.memory_path
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }

    fn read_optional(path: &Path) -> Result<String> {
        match std::fs::read_to_string(path) {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn read_long_term(&self) -> Result<String> {
        Self::read_optional(&self.memory_path)
    }

    pub fn read_history(&self) -> Result<String> {
        Self::read_optional(&self.history_path)
    }

    pub fn write_long_term(&self, content: &str) -> Result<()> {
        if let Some(parent) = self.memory_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(std::fs::write(&self.memory_path, content)?)
    }

    pub fn append_history(&self, entry: &str) -> Result<()> {
        use std::io::Write;
        if let Some(parent) = self.history_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)?;
        writeln!(file, "\n{entry}")?;
        Ok(())
    }

    pub fn daily_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    pub fn today_path(&self) -> PathBuf {
        self.daily_path(today())
    }

    pub fn read_daily(&self, date: NaiveDate) -> Result<String> {
        Self::read_optional(&self.daily_path(date))
    }

    pub fn read_today(&self) -> Result<String> {
        self.read_daily(today())
    }

    /// Append a note to `date`'s file, starting it with a `# YYYY-MM-DD`
    /// heading when it does not exist yet.
    pub fn append_daily(&self, date: NaiveDate, note: &str) -> Result<()> {
        use std::io::Write;
        std::fs::create_dir_all(&self.dir)?;
        let path = self.daily_path(date);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "# {}", date.format("%Y-%m-%d"))?;
        }
        writeln!(file, "\n{note}")?;
        Ok(())
    }

    pub fn append_today(&self, note: &str) -> Result<()> {
        self.append_daily(today(), note)
    }

    /// Daily notes from the last `days` days, newest first, separated by `---`.
    pub fn get_recent_memories(&self, days: u64) -> Result<String> {
        self.recent_memories_as_of(today(), days)
    }

    fn recent_memories_as_of(&self, today: NaiveDate, days: u64) -> Result<String> {
        let mut notes = Vec::new();
        for date in window(today, days) {
            let text = self.read_daily(date)?;
            if !text.trim().is_empty() {
                notes.push(text);
            }
        }
        Ok(notes.join(DAILY_SEPARATOR))
    }

    /// Every daily note file in the memory directory, newest first.
    pub fn list_memory_files(&self) -> Result<Vec<PathBuf>> {
        let dir = match std::fs::read_dir(&self.dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to list {}", self.dir.display()))
            }
        };
        let mut dated: Vec<(NaiveDate, PathBuf)> = Vec::new();
        for item in dir {
            let path = item?.path();
            let date = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".md"))
                .and_then(|stem| NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok());
            if let Some(date) = date {
                dated.push((date, path));
            }
        }
        dated.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(dated.into_iter().map(|(_, path)| path).collect())
    }

    /// Every paragraph from MEMORY.md, HISTORY.md and the last week of daily
    /// notes, oldest first.
    pub fn entries(&self) -> Result<Vec<MemoryEntry>> {
        self.entries_as_of(today())
    }

    fn entries_as_of(&self, today: NaiveDate) -> Result<Vec<MemoryEntry>> {
        let long_term = self.read_long_term()?;
        let history = self.read_history()?;
        let mut daily: Vec<(NaiveDate, String)> = Vec::new();
        for date in window(today, DAILY_WINDOW_DAYS) {
            daily.push((date, self.read_daily(date)?));
        }
        daily.reverse();

        let mut tagged: Vec<(String, MemorySource)> = paragraphs(&long_term)
            .map(|p| (p.to_string(), MemorySource::LongTerm))
            .chain(paragraphs(&history).map(|p| (p.to_string(), MemorySource::History)))
            .collect();
        for (date, text) in &daily {
            tagged.extend(
                paragraphs(text)
                    .map(|p| (format!("[{}] {p}", date.format("%Y-%m-%d")), MemorySource::Daily)),
            );
        }

        Ok(tagged
            .into_iter()
            .enumerate()
            .map(|(recency, (text, source))| MemoryEntry {
                text,
                source,
                recency,
                score: 0,
            })
            .collect())
    }

    /// Up to `limit` entries ranked by keyword overlap with `query`, ties
    /// broken by recency. Entries sharing no keyword rank below every match
    /// but are still eligible, newest first.
    pub fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>> {
        self.retrieve_as_of(today(), query, limit)
    }

    fn retrieve_as_of(&self, today: NaiveDate, query: &str, limit: usize) -> Result<Vec<MemoryEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let wanted = keywords(query);
        let mut entries = self.entries_as_of(today)?;
        for entry in &mut entries {
            let have = keywords(&entry.text);
            entry.score = wanted.intersection(&have).count();
        }
        entries.sort_by(|a, b| b.score.cmp(&a.score).then(b.recency.cmp(&a.recency)));
        entries.truncate(limit);
        Ok(entries)
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// `today` and the `days - 1` days before it, newest first.
fn window(today: NaiveDate, days: u64) -> impl Iterator<Item = NaiveDate> {
    (0..days).filter_map(move |back| today.checked_sub_days(Days::new(back)))
}

/// Blank-line separated blocks, skipping bare headings.
fn paragraphs(text: &str) -> impl Iterator<Item = &str> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter(|p| !(p.starts_with('#') && !p.contains('\n')))
}

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}
