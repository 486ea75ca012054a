//! Text sources that task contexts are assembled from.
//!
//! Two sources are provided: [`FileCorpus`] reads paragraphs of real text from
//! a directory of `.txt` files, and [`SyntheticCorpus`] produces seeded filler
//! prose made of invented words, so no passage can be answered from world
//! knowledge.

use crate::limits::MAX_CORPUS_FILE_BYTES;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("failed to read corpus at {0}: {1}")]
    Io(PathBuf, String),

    #[error("corpus at {0} contains no usable paragraphs")]
    Empty(PathBuf),
}

/// A source of passages. Implementations draw from the caller's RNG so that
/// a task seed fully determines the context.
pub trait CorpusSource: Send + Sync {
    fn name(&self) -> &str;

    fn sample(&self, rng: &mut StdRng) -> Option<String>;
}

/// Paragraphs loaded once from `.txt` files.
pub struct FileCorpus {
    name: String,
    paragraphs: Vec<String>,
}

impl FileCorpus {
    pub fn from_paragraphs(name: impl Into<String>, paragraphs: Vec<String>) -> Self {
        Self {
            name: name.into(),
            paragraphs: paragraphs
                .into_iter()
                .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Load every `.txt` file directly under `dir`, split on blank lines.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, CorpusError> {
        let dir = dir.as_ref();
        let entries =
            std::fs::read_dir(dir).map_err(|e| CorpusError::Io(dir.to_path_buf(), e.to_string()))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("txt"))
            .collect();
        files.sort();

        let mut paragraphs = Vec::new();
        for path in &files {
            let size = std::fs::metadata(path)
                .map_err(|e| CorpusError::Io(path.clone(), e.to_string()))?
                .len();
            if size > MAX_CORPUS_FILE_BYTES {
                warn!(
                    "Skipping corpus file {} ({} bytes exceeds limit)",
                    path.display(),
                    size
                );
                continue;
            }
            let text = std::fs::read_to_string(path)
                .map_err(|e| CorpusError::Io(path.clone(), e.to_string()))?;
            paragraphs.extend(text.split("\n\n").map(str::to_string));
        }

        let corpus = Self::from_paragraphs(dir.display().to_string(), paragraphs);
        if corpus.paragraphs.is_empty() {
            return Err(CorpusError::Empty(dir.to_path_buf()));
        }
        info!(
            "Loaded corpus {} ({} files, {} paragraphs)",
            corpus.name,
            files.len(),
            corpus.paragraphs.len()
        );
        Ok(corpus)
    }

    pub fn len(&self) -> usize {
        self.paragraphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paragraphs.is_empty()
    }
}

impl CorpusSource for FileCorpus {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample(&self, rng: &mut StdRng) -> Option<String> {
        self.paragraphs.choose(rng).cloned()
    }
}

const SYLLABLES: &[&str] = &[
    "ka", "lo", "ven", "tor", "mi", "sa", "rel", "qua", "dor", "bix", "nu", "fen", "zal", "or",
    "pim", "tas", "gre", "hul", "yan", "vek", "sor", "lin", "mar", "dex",
];

const ADJECTIVES: &[&str] = &[
    "quiet", "amber", "brisk", "hollow", "narrow", "distant", "silver", "patient", "restless",
    "faded", "crooked", "gentle", "northern", "heavy", "bright", "sudden",
];

const NOUNS: &[&str] = &[
    "harbor", "ledger", "lantern", "orchard", "archive", "caravan", "workshop", "bridge", "tower",
    "market", "river", "engine", "garden", "council", "courier", "furnace", "valley", "library",
];

const VERBS: &[&str] = &[
    "guarded", "described", "repaired", "followed", "measured", "crossed", "painted", "recorded",
    "visited", "traded", "borrowed", "mapped", "questioned", "carried", "ignored", "welcomed",
];

const PLACES: &[&str] = &[
    "the eastern gate",
    "the old quarry",
    "the salt road",
    "the upper terrace",
    "the shallow ford",
    "the clock square",
    "the western pier",
    "the grain hall",
];

/// A capitalized invented name, e.g. `Venqua` or `Torbixsa`.
pub fn synthetic_name(rng: &mut StdRng) -> String {
    let parts = rng.gen_range(2..=3);
    let mut name = String::new();
    for _ in 0..parts {
        name.push_str(SYLLABLES.choose(rng).copied().unwrap_or("ka"));
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => name,
    }
}

/// Seeded filler prose about invented people and places.
#[derive(Debug, Clone)]
pub struct SyntheticCorpus {
    sentences_per_passage: (usize, usize),
}

impl SyntheticCorpus {
    pub fn new() -> Self {
        Self {
            sentences_per_passage: (3, 7),
        }
    }

    fn sentence(rng: &mut StdRng) -> String {
        let pick = |rng: &mut StdRng, words: &[&'static str]| -> &'static str {
            words.choose(rng).copied().unwrap_or("the")
        };
        let subject = synthetic_name(rng);
        match rng.gen_range(0..4) {
            0 => format!(
                "{} {} the {} {} near {}.",
                subject,
                pick(rng, VERBS),
                pick(rng, ADJECTIVES),
                pick(rng, NOUNS),
                pick(rng, PLACES)
            ),
            1 => format!(
                "By evening the {} {} of {} was {} by {}.",
                pick(rng, ADJECTIVES),
                pick(rng, NOUNS),
                subject,
                pick(rng, VERBS),
                synthetic_name(rng)
            ),
            2 => format!(
                "Nobody in {} remembered why the {} had been {} twice.",
                pick(rng, PLACES),
                pick(rng, NOUNS),
                pick(rng, VERBS)
            ),
            _ => format!(
                "{} kept a {} {} and {} it every {} morning.",
                subject,
                pick(rng, ADJECTIVES),
                pick(rng, NOUNS),
                pick(rng, VERBS),
                pick(rng, ADJECTIVES)
            ),
        }
    }
}

impl Default for SyntheticCorpus {
    fn default() -> Self {
        Self::new()
    }
}

impl CorpusSource for SyntheticCorpus {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn sample(&self, rng: &mut StdRng) -> Option<String> {
        let (lo, hi) = self.sentences_per_passage;
        let n = rng.gen_range(lo..=hi);
        let passage = (0..n)
            .map(|_| Self::sentence(rng))
            .collect::<Vec<_>>()
            .join(" ");
        debug!("synthetic passage of {} sentences", n);
        Some(passage)
    }
}

/// Split a passage into sentences on terminal punctuation.
pub fn split_sentences(passage: &str) -> Vec<String> {
    passage
        .split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
