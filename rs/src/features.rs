//! Feature extraction
//!
//! Turns a [`ContentRecord`] into [`ContentFeatures`]: keyword frequencies,
//! environmental keyword scores, readability/structure metrics and the sparse
//! vector used for similarity math. Extraction never fails; content with no
//! usable text yields default features.

use crate::config::ExtractorConfig;
use crate::constants::{
    CONTENT_LENGTH_SATURATION, DEFAULT_READABILITY, STRUCTURE_HEADING_POINTS,
    STRUCTURE_LINK_POINTS, STRUCTURE_LIST_POINTS,
};
use crate::models::{
    ContentFeatures, ContentId, ContentRecord, EnvironmentalKeyword, SparseVector,
};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

lazy_static! {
    static ref TAG_RE: Regex = Regex::new(r"(?s)<[^>]*>").unwrap();
    static ref SYLLABLE_RE: Regex = Regex::new(r"[aeiouy]+").unwrap();
    static ref SENTENCE_RE: Regex = Regex::new(r"[.!?]+").unwrap();
    static ref HEADING_RE: Regex = Regex::new(r"(?mi)<h[1-6][\s>]|^\s{0,3}#{1,6}\s").unwrap();
    static ref LIST_RE: Regex =
        Regex::new(r"(?mi)<(ul|ol|li)[\s>]|^\s*([-*+]|\d+\.)\s+\S").unwrap();
    static ref LINK_RE: Regex =
        Regex::new(r#"(?i)<a\s[^>]*href|\[[^\]]+\]\([^)]+\)"#).unwrap();
    static ref IMAGE_RE: Regex = Regex::new(r"(?i)<img[\s>/]|!\[[^\]]*\]\([^)]+\)").unwrap();
    static ref VIDEO_RE: Regex =
        Regex::new(r"(?i)<(video|iframe|embed)[\s>]|\[(video|embed)[\s\]]").unwrap();
}

/// Document-frequency statistics used for IDF weighting
///
/// Supplied by the caller; the engine never scans the corpus itself.
pub trait CorpusStats: Send + Sync {
    fn total_documents(&self) -> usize;

    fn documents_containing(&self, term: &str) -> usize;

    /// `ln(total / containing)`, 0 when the term is absent from the corpus
    fn idf(&self, term: &str) -> f64 {
        let total = self.total_documents();
        let containing = self.documents_containing(term);
        if total == 0 || containing == 0 {
            return 0.0;
        }
        (total as f64 / containing as f64).ln().max(0.0)
    }
}

/// Corpus with no documents: every IDF is 0
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyCorpus;

impl CorpusStats for EmptyCorpus {
    fn total_documents(&self) -> usize {
        0
    }

    fn documents_containing(&self, _term: &str) -> usize {
        0
    }
}

/// Corpus statistics backed by a caller-supplied lookup function
pub struct CorpusLookup<F> {
    total: usize,
    lookup: F,
}

impl<F> CorpusLookup<F>
where
    F: Fn(&str) -> usize + Send + Sync,
{
    pub fn new(total: usize, lookup: F) -> Self {
        Self { total, lookup }
    }
}

impl<F> CorpusStats for CorpusLookup<F>
where
    F: Fn(&str) -> usize + Send + Sync,
{
    fn total_documents(&self) -> usize {
        self.total
    }

    fn documents_containing(&self, term: &str) -> usize {
        (self.lookup)(term)
    }
}

/// In-memory document-frequency table
#[derive(Debug, Clone, Default)]
pub struct CorpusIndex {
    total: usize,
    document_frequency: HashMap<String, usize>,
}

impl CorpusIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a set of records, tokenized the same way the extractor does
    pub fn build<'a, I>(extractor: &FeatureExtractor, records: I) -> Self
    where
        I: IntoIterator<Item = &'a ContentRecord>,
    {
        let mut index = Self::new();
        for record in records {
            index.add_document(extractor.tokenize(&extractor.plain_text(record)));
        }
        tracing::debug!(
            "Built corpus index: {} documents, {} distinct terms",
            index.total,
            index.document_frequency.len()
        );
        index
    }

    /// Statistics over stored items plus a batch about to be (re)analyzed.
    ///
    /// Stored rows whose id appears in `records` are replaced by the record,
    /// so re-analyzing one item sees the same corpus as a full batch run.
    pub fn with_stored<'a, I>(
        extractor: &FeatureExtractor,
        stored: &[ContentFeatures],
        records: I,
    ) -> Self
    where
        I: IntoIterator<Item = &'a ContentRecord>,
    {
        let records: Vec<&ContentRecord> = records.into_iter().collect();
        let replaced: HashSet<ContentId> = records.iter().map(|r| r.id).collect();
        let mut index = Self::new();
        for features in stored.iter().filter(|f| !replaced.contains(&f.content_id)) {
            index.add_document(features.terms.iter().cloned());
        }
        for record in records {
            index.add_document(extractor.tokenize(&extractor.plain_text(record)));
        }
        tracing::debug!(
            "Built corpus index over {} stored and new documents, {} distinct terms",
            index.total,
            index.document_frequency.len()
        );
        index
    }

    /// Count one document; repeated tokens within it count once
    pub fn add_document<I, S>(&mut self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let distinct: HashSet<String> = tokens.into_iter().map(Into::into).collect();
        for token in distinct {
            *self.document_frequency.entry(token).or_insert(0) += 1;
        }
        self.total += 1;
    }
}

impl CorpusStats for CorpusIndex {
    fn total_documents(&self) -> usize {
        self.total
    }

    fn documents_containing(&self, term: &str) -> usize {
        self.document_frequency.get(term).copied().unwrap_or(0)
    }
}

/// Extracts [`ContentFeatures`] from raw content
#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor {
    config: ExtractorConfig,
}

impl FeatureExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Derive the full feature bag for one content item
    pub fn extract(&self, record: &ContentRecord, corpus: &dyn CorpusStats) -> ContentFeatures {
        let mut features = ContentFeatures::empty(record.id, record.content_type.clone());
        features.published = record.published;
        features.categories = normalize_set(&record.categories);
        features.tags = normalize_set(&record.tags);
        features.sustainability_rating = record
            .sustainability_rating
            .filter(|r| r.is_finite())
            .map(|r| r.clamp(0.0, 1.0))
            .unwrap_or(0.0);

        let body = strip_markup(&record.body);
        let text = format!("{} {}", record.title, body);
        if text.trim().is_empty() {
            tracing::debug!("Content {} has no text, using default features", record.id);
            features.has_image = record.has_featured_image;
            features.content_vector = self.build_vector(&features, corpus);
            return features;
        }

        let tokens = self.tokenize(&text);
        features.keyword_frequencies = self.top_keywords(&tokens);
        features.terms = tokens.into_iter().collect();
        features.environmental_keywords = self.environmental_keywords(&text);
        features.environmental_score = self.environmental_score(&features);
        features.word_count = body.split_whitespace().count();
        features.readability_score = readability_score(&body);
        features.structure_score = structure_score(&record.body);
        features.has_image = record.has_featured_image || IMAGE_RE.is_match(&record.body);
        features.has_video = VIDEO_RE.is_match(&record.body);
        features.content_vector = self.build_vector(&features, corpus);

        tracing::debug!(
            "Extracted features for content {}: {} keywords, environmental score {}",
            record.id,
            features.keyword_frequencies.len(),
            features.environmental_score
        );
        features
    }

    /// Title and markup-free body, as used for tokenization
    pub fn plain_text(&self, record: &ContentRecord) -> String {
        format!("{} {}", record.title, strip_markup(&record.body))
    }

    /// Lowercase alphanumeric tokens, minus short tokens and stop words
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| token.chars().count() > self.config.min_token_chars)
            .filter(|token| !self.config.stop_words.contains(*token))
            .map(str::to_string)
            .collect()
    }

    /// Top-K tokens by count; ties keep first-seen order
    fn top_keywords(&self, tokens: &[String]) -> Vec<(String, u32)> {
        let mut order: Vec<(String, u32)> = Vec::new();
        let mut position: HashMap<&str, usize> = HashMap::new();
        for token in tokens {
            match position.get(token.as_str()) {
                Some(&i) => order[i].1 += 1,
                None => {
                    position.insert(token.as_str(), order.len());
                    order.push((token.clone(), 1));
                }
            }
        }
        // Stable sort keeps first-seen order among equal counts
        order.sort_by(|a, b| b.1.cmp(&a.1));
        order.truncate(self.config.top_keywords);
        order
    }

    fn environmental_keywords(&self, text: &str) -> BTreeMap<String, EnvironmentalKeyword> {
        let lower = text.to_lowercase();
        self.config
            .environmental_keywords
            .iter()
            .filter_map(|(term, weight)| {
                let count = lower.matches(term.as_str()).count() as u32;
                (count > 0).then(|| {
                    (
                        term.clone(),
                        EnvironmentalKeyword {
                            count,
                            weight: *weight,
                            score: count as f64 * weight,
                        },
                    )
                })
            })
            .collect()
    }

    fn environmental_score(&self, features: &ContentFeatures) -> f64 {
        let keyword_total: f64 = features.environmental_keywords.values().map(|k| k.score).sum();

        let category_bonus = if features
            .categories
            .iter()
            .any(|c| self.config.environmental_categories.contains(c))
        {
            self.config.environmental_category_bonus
        } else {
            0.0
        };

        let tag_total: f64 = features
            .tags
            .iter()
            .filter_map(|t| self.config.environmental_keywords.get(t))
            .sum();

        let raw = keyword_total + category_bonus + tag_total;
        let normalized = (raw / self.config.max_environmental_raw * 100.0).min(100.0);
        round2(normalized.max(0.0))
    }

    fn build_vector(&self, features: &ContentFeatures, corpus: &dyn CorpusStats) -> SparseVector {
        let mut vector = SparseVector::new();

        let total_kept: u32 = features.keyword_frequencies.iter().map(|(_, c)| c).sum();
        if total_kept > 0 {
            for (keyword, count) in &features.keyword_frequencies {
                let tf = *count as f64 / total_kept as f64;
                vector.insert(format!("keyword_{keyword}"), tf * corpus.idf(keyword));
            }
        }
        for category in &features.categories {
            vector.insert(format!("category_{category}"), 1.0);
        }
        for tag in &features.tags {
            vector.insert(format!("tag_{tag}"), 1.0);
        }

        vector.insert("environmental_score", features.environmental_score / 100.0);
        vector.insert(
            "content_length",
            (features.word_count as f64 / CONTENT_LENGTH_SATURATION).min(1.0),
        );
        vector.insert("readability", features.readability_score / 100.0);
        vector.insert("has_image", if features.has_image { 1.0 } else { 0.0 });
        vector.insert("has_video", if features.has_video { 1.0 } else { 0.0 });
        vector
    }
}

/// Lowercased, trimmed, non-empty set of labels
pub fn normalize_set<S: AsRef<str>>(values: &[S]) -> BTreeSet<String> {
    values
        .iter()
        .map(|v| v.as_ref().trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Remove HTML tags, leaving their text content
pub fn strip_markup(body: &str) -> String {
    TAG_RE.replace_all(body, " ").into_owned()
}

/// Simplified Flesch Reading Ease, clamped to [0, 100]
pub fn readability_score(text: &str) -> f64 {
    let sentences = SENTENCE_RE
        .split(text)
        .filter(|s| s.chars().any(char::is_alphanumeric))
        .count();
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();

    if sentences == 0 || words.is_empty() {
        return DEFAULT_READABILITY;
    }

    let syllables: usize = words.iter().map(|w| count_syllables(w)).sum();
    let avg_sentence_len = words.len() as f64 / sentences as f64;
    let avg_syllables = syllables as f64 / words.len() as f64;

    let score = 206.835 - 1.015 * avg_sentence_len - 84.6 * avg_syllables;
    round2(score.clamp(0.0, 100.0))
}

/// Vowel groups in a lowercase word, at least 1
pub fn count_syllables(word: &str) -> usize {
    SYLLABLE_RE.find_iter(word).count().max(1)
}

/// Points for headings, lists and links found in the raw body, capped at 100
pub fn structure_score(body: &str) -> f64 {
    let mut score = 0.0;
    if HEADING_RE.is_match(body) {
        score += STRUCTURE_HEADING_POINTS;
    }
    if LIST_RE.is_match(body) {
        score += STRUCTURE_LIST_POINTS;
    }
    if LINK_RE.is_match(body) {
        score += STRUCTURE_LINK_POINTS;
    }
    f64::min(score, 100.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
