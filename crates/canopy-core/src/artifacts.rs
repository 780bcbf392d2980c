//! Artifact extraction: URLs, local dev servers and `path:line[:col]`
//! references found in terminal output.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;

use crate::protocol::Artifact;
use crate::protocol::ArtifactKind;

/// How many recent artifacts each terminal remembers for deduplication.
pub const DEFAULT_DEDUP_WINDOW: usize = 256;

#[allow(clippy::expect_used)]
static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s<>"'`)\]]+"#).expect("Invalid URL regex")
});

#[allow(clippy::expect_used)]
static LOCAL_HOST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1\])(?::\d+)?(?:/|$)")
        .expect("Invalid local host regex")
});

#[allow(clippy::expect_used)]
static FILE_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:^|[\s(\[])((?:\.{1,2}/|/)?(?:[\w.\-]+/)*[\w\-][\w.\-]*\.[A-Za-z][A-Za-z0-9]*):(\d+)(?::(\d+))?",
    )
    .expect("Invalid file reference regex")
});

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, max_size: usize) -> Option<T> {
    let evicted = if queue.len() >= max_size {
        queue.pop_front()
    } else {
        None
    };
    queue.push_back(item);
    evicted
}

fn trim_url(raw: &str) -> &str {
    raw.trim_end_matches(['.', ',', ';', ':', '!', '?'])
}

/// Pull every artifact out of one line, in order of appearance, without
/// deduplication.
pub fn scan_line(line: &str) -> Vec<Artifact> {
    let mut found = Vec::new();
    let mut masked = line.to_string();

    for m in URL_RE.find_iter(line) {
        let url = trim_url(m.as_str());
        if url.len() <= "https://".len() {
            continue;
        }
        let kind = if LOCAL_HOST_RE.is_match(url) {
            ArtifactKind::DevServer
        } else {
            ArtifactKind::Url
        };
        found.push(Artifact {
            kind,
            value: url.to_string(),
            line: None,
            column: None,
        });
        masked.replace_range(m.range(), &" ".repeat(m.len()));
    }

    for caps in FILE_REF_RE.captures_iter(&masked) {
        let Some(path) = caps.get(1) else {
            continue;
        };
        let line_no = caps.get(2).and_then(|m| m.as_str().parse().ok());
        let column = caps.get(3).and_then(|m| m.as_str().parse().ok());
        found.push(Artifact {
            kind: ArtifactKind::FileReference,
            value: path.as_str().to_string(),
            line: line_no,
            column,
        });
    }

    found
}

/// Per-terminal extractor that suppresses artifacts it has reported
/// recently.
#[derive(Debug, Clone)]
pub struct ArtifactExtractor {
    recent: VecDeque<Artifact>,
    seen: HashSet<Artifact>,
    window: usize,
}

impl ArtifactExtractor {
    pub fn new(window: usize) -> Self {
        Self {
            recent: VecDeque::new(),
            seen: HashSet::new(),
            window: window.max(1),
        }
    }

    /// New artifacts in `lines`, each reported once per window.
    pub fn extract<S: AsRef<str>>(&mut self, lines: &[S]) -> Vec<Artifact> {
        let mut fresh = Vec::new();
        for line in lines {
            for artifact in scan_line(line.as_ref()) {
                if self.seen.contains(&artifact) {
                    continue;
                }
                self.seen.insert(artifact.clone());
                if let Some(evicted) =
                    push_bounded(&mut self.recent, artifact.clone(), self.window)
                {
                    self.seen.remove(&evicted);
                }
                fresh.push(artifact);
            }
        }
        fresh
    }

    pub fn clear(&mut self) {
        self.recent.clear();
        self.seen.clear();
    }
}

impl Default for ArtifactExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}
