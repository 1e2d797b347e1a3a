// 🏢 Vendor Entity - Canonical employer names + fuzzy matching
//
// "ABC Staffing, LLC", "abc staffing llc" and "A.B.C. Staffing" are the
// same employer. The canonicalizer turns free text into one canonical name:
//
//   raw → clean → patches → stop-words → key
//   key → direct alias → exact canonical key → Jaro-Winkler argmax
//
// Patch and alias tables are ordered data, evaluated top-down.

use anyhow::{Context as AnyhowContext, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

/// Punctuation replaced by a space during cleaning
const PUNCTUATION: &[char] = &['.', ',', '&', '-', '_', '/'];

/// Legal-form and filler words dropped from the normalization key
const STOP_WORDS: &[&str] = &[
    "llc", "inc", "co", "corp", "corporation", "company", "ltd", "the", "and", "of",
];

pub const DEFAULT_EXACT_THRESHOLD: f64 = 0.93;
pub const DEFAULT_PREFIX_THRESHOLD: f64 = 0.88;
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

// ============================================================================
// VENDOR TABLE (rules as data)
// ============================================================================

/// One canonical vendor and the alias patterns that map onto it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorCanonicalEntry {
    /// The single deduplicated spelling used as ground truth
    pub canonical_name: String,

    /// Regexes evaluated against the normalization key
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl VendorCanonicalEntry {
    pub fn new(canonical_name: &str, aliases: &[&str]) -> Self {
        VendorCanonicalEntry {
            canonical_name: canonical_name.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Legacy spelling correction applied before stop-word removal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRule {
    pub pattern: String,
    pub replacement: String,
}

impl PatchRule {
    pub fn new(pattern: &str, replacement: &str) -> Self {
        PatchRule {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VendorTable {
    #[serde(default)]
    pub patches: Vec<PatchRule>,

    #[serde(default)]
    pub entries: Vec<VendorCanonicalEntry>,
}

impl VendorTable {
    /// Load a vendor table from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read vendor table: {:?}", path.as_ref()))?;

        serde_json::from_str(&content).context("Failed to parse vendor table JSON")
    }

    /// Vendors and spelling fixes seen in real roster imports
    pub fn with_defaults() -> Self {
        VendorTable {
            patches: vec![
                PatchRule::new(r"\bstaf+i?n?g\b", "staffing"),
                PatchRule::new(r"\bsvcs?\b", "services"),
                PatchRule::new(r"\bsrvcs\b", "services"),
                PatchRule::new(r"\bintl\b", "international"),
                PatchRule::new(r"\bsolns\b", "solutions"),
                PatchRule::new(r"\bwork force\b", "workforce"),
                PatchRule::new(r"\bwrkforce\b", "workforce"),
                PatchRule::new(r"\blabour\b", "labor"),
                PatchRule::new(r"\bcontractrs\b", "contractors"),
            ],
            entries: vec![
                VendorCanonicalEntry::new(
                    "ABC Staffing",
                    &[r"^abc( staffing)?$", r"^abc staffing (services|solutions)$"],
                ),
                VendorCanonicalEntry::new("Acme Labor Services", &[r"^acme( labor)?( services)?$"]),
                VendorCanonicalEntry::new("Kelly Services", &[r"^kelly( services)?$", r"^kelly temp"]),
                VendorCanonicalEntry::new(
                    "Pinnacle Workforce Solutions",
                    &[r"^pinnacle( workforce)?( solutions)?$"],
                ),
                VendorCanonicalEntry::new(
                    "Tradesmen International",
                    &[r"^tradesm[ae]n( international)?$"],
                ),
                VendorCanonicalEntry::new("Aerotek", &[r"^aero ?tek$"]),
                VendorCanonicalEntry::new("Blue Ridge Contractors", &[]),
                VendorCanonicalEntry::new("Summit Industrial Staffing", &[]),
            ],
        }
    }
}

// ============================================================================
// THRESHOLDS
// ============================================================================

/// Fuzzy acceptance thresholds
///
/// A best match is accepted when `score >= exact`, or when
/// `score >= prefix` and one key is a prefix of the other (truncated names).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchThresholds {
    pub exact: f64,
    pub prefix: f64,
}

impl MatchThresholds {
    pub fn accepts(&self, score: f64, is_prefix: bool) -> bool {
        score >= self.exact || (is_prefix && score >= self.prefix)
    }
}

impl Default for MatchThresholds {
    fn default() -> Self {
        MatchThresholds {
            exact: DEFAULT_EXACT_THRESHOLD,
            prefix: DEFAULT_PREFIX_THRESHOLD,
        }
    }
}

// ============================================================================
// CANONICALIZER
// ============================================================================

/// Vendor name canonicalizer with an owned, bounded memoization cache
///
/// The cache maps lowercased raw text to the resolved name. Writes are
/// idempotent (same input, same output) so last-writer-wins is enough.
pub struct VendorCanonicalizer {
    patches: Vec<(Regex, String)>,
    aliases: Vec<(Regex, String)>,
    canonical_keys: Vec<(String, String)>,
    thresholds: MatchThresholds,
    cache: RwLock<HashMap<String, String>>,
    cache_capacity: usize,
}

impl VendorCanonicalizer {
    /// Compile a vendor table into a canonicalizer
    pub fn new(table: &VendorTable, thresholds: MatchThresholds, cache_capacity: usize) -> Result<Self> {
        let patches = table
            .patches
            .iter()
            .map(|p| {
                Regex::new(&p.pattern)
                    .with_context(|| format!("Invalid patch pattern: {}", p.pattern))
                    .map(|re| (re, p.replacement.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut canonicalizer = VendorCanonicalizer {
            patches,
            aliases: Vec::new(),
            canonical_keys: Vec::new(),
            thresholds,
            cache: RwLock::new(HashMap::new()),
            cache_capacity,
        };

        for entry in &table.entries {
            for alias in &entry.aliases {
                let re = Regex::new(alias)
                    .with_context(|| format!("Invalid alias pattern for {}: {}", entry.canonical_name, alias))?;
                canonicalizer.aliases.push((re, entry.canonical_name.clone()));
            }
            let key = canonicalizer.normalization_key(&entry.canonical_name);
            canonicalizer
                .canonical_keys
                .push((key, entry.canonical_name.clone()));
        }

        Ok(canonicalizer)
    }

    /// Canonicalizer over the built-in vendor table with default thresholds
    pub fn with_defaults() -> Self {
        Self::new(
            &VendorTable::with_defaults(),
            MatchThresholds::default(),
            DEFAULT_CACHE_CAPACITY,
        )
        .expect("built-in vendor table compiles")
    }

    /// Resolve raw vendor text to its canonical name
    ///
    /// Blank input returns "" without touching the cache. Unknown vendors come
    /// back title-cased so spelling variants still collapse to one value.
    pub fn normalize(&self, raw: &str) -> String {
        if raw.trim().is_empty() {
            return String::new();
        }

        let cache_key = raw.trim().to_lowercase();
        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&cache_key)
        {
            return hit.clone();
        }

        let resolved = self.resolve_uncached(raw);
        self.remember(cache_key, resolved.clone());
        resolved
    }

    /// `normalize` for optional input; `None` behaves like blank text
    pub fn normalize_opt(&self, raw: Option<&str>) -> String {
        raw.map(|r| self.normalize(r)).unwrap_or_default()
    }

    /// Drop every memoized entry
    pub fn reset_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn thresholds(&self) -> MatchThresholds {
        self.thresholds
    }

    /// Canonical names in table order
    pub fn canonical_names(&self) -> Vec<String> {
        self.canonical_keys.iter().map(|(_, name)| name.clone()).collect()
    }

    fn remember(&self, key: String, value: String) {
        if self.cache_capacity == 0 {
            return;
        }
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.len() >= self.cache_capacity && !cache.contains_key(&key) {
            cache.clear();
        }
        cache.insert(key, value);
    }

    fn resolve_uncached(&self, raw: &str) -> String {
        let patched = self.patched_text(raw);
        let key = strip_stop_words(&patched);

        // 1. Direct alias (beats fuzzy)
        if let Some((_, name)) = self.aliases.iter().find(|(re, _)| re.is_match(&key)) {
            return name.clone();
        }

        // 2. Exact canonical key
        if let Some((_, name)) = self.canonical_keys.iter().find(|(k, _)| *k == key) {
            return name.clone();
        }

        // 3. Fuzzy argmax
        if let Some((score, canonical_key, name)) = self.best_fuzzy_match(&key) {
            let is_prefix = canonical_key.starts_with(&key) || key.starts_with(canonical_key);
            if self.thresholds.accepts(score, is_prefix) {
                tracing::debug!(raw, key = %key, canonical = %name, score, is_prefix, "fuzzy vendor match");
                return name.to_string();
            }
        }

        title_case(&patched)
    }

    fn best_fuzzy_match(&self, key: &str) -> Option<(f64, &str, &str)> {
        let mut best: Option<(f64, &str, &str)> = None;
        for (canonical_key, name) in &self.canonical_keys {
            let score = strsim::jaro_winkler(key, canonical_key);
            // Strict > keeps the earlier table entry on ties
            if best.map_or(true, |(s, _, _)| score > s) {
                best = Some((score, canonical_key.as_str(), name.as_str()));
            }
        }
        best
    }

    fn patched_text(&self, raw: &str) -> String {
        let mut text = clean_vendor_text(raw);
        for (re, replacement) in &self.patches {
            text = re.replace_all(&text, replacement.as_str()).into_owned();
        }
        collapse_whitespace(&text)
    }

    /// Full normalization key for raw text
    pub fn normalization_key(&self, raw: &str) -> String {
        strip_stop_words(&self.patched_text(raw))
    }
}

impl Default for VendorCanonicalizer {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Lowercase, replace punctuation with spaces, collapse whitespace and
/// merge runs of single-character tokens ("a b c" → "abc")
fn clean_vendor_text(raw: &str) -> String {
    let lowered: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if PUNCTUATION.contains(&c) { ' ' } else { c })
        .collect();

    let mut tokens: Vec<String> = Vec::new();
    let mut run = String::new();
    for token in lowered.split_whitespace() {
        if token.chars().count() == 1 {
            run.push_str(token);
            continue;
        }
        if !run.is_empty() {
            tokens.push(std::mem::take(&mut run));
        }
        tokens.push(token.to_string());
    }
    if !run.is_empty() {
        tokens.push(run);
    }

    tokens.join(" ")
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove stop-words; keeps the input if nothing would remain
fn strip_stop_words(s: &str) -> String {
    let kept: Vec<&str> = s
        .split_whitespace()
        .filter(|word| !STOP_WORDS.contains(word))
        .collect();

    if kept.is_empty() {
        s.to_string()
    } else {
        kept.join(" ")
    }
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_vendor_text() {
        assert_eq!(clean_vendor_text("ABC Staffing, LLC"), "abc staffing llc");
        assert_eq!(clean_vendor_text("  A.B.C.   Staffing "), "abc staffing");
        assert_eq!(clean_vendor_text("Smith/Jones_Co"), "smith jones co");
        assert_eq!(clean_vendor_text("J & J"), "jj");
    }

    #[test]
    fn test_strip_stop_words_keeps_something() {
        assert_eq!(strip_stop_words("abc staffing llc"), "abc staffing");
        assert_eq!(strip_stop_words("the company"), "the company");
    }

    #[test]
    fn test_blank_input_returns_empty() {
        let c = VendorCanonicalizer::with_defaults();
        assert_eq!(c.normalize(""), "");
        assert_eq!(c.normalize("   "), "");
        assert_eq!(c.normalize_opt(None), "");
        assert_eq!(c.cache_len(), 0);
    }

    #[test]
    fn test_legal_suffix_variants_match() {
        let c = VendorCanonicalizer::with_defaults();
        let a = c.normalize("ABC Staffing, LLC");
        let b = c.normalize("abc staffing llc");
        assert_eq!(a, b);
        assert_eq!(a, "ABC Staffing");
    }

    #[test]
    fn test_case_whitespace_punctuation_invariance() {
        let c = VendorCanonicalizer::with_defaults();
        let variants = [
            "Tradesmen International",
            "TRADESMEN   INTERNATIONAL",
            "tradesmen-international.",
            " Tradesmen, International ",
        ];
        for v in variants {
            assert_eq!(c.normalize(v), "Tradesmen International", "variant {:?}", v);
        }

        // Unknown vendors collapse too
        let unknown = ["Northwind Traders", "NORTHWIND, TRADERS.", "northwind   traders"];
        let first = c.normalize(unknown[0]);
        for v in unknown {
            assert_eq!(c.normalize(v), first);
        }
        assert_eq!(first, "Northwind Traders");
    }

    #[test]
    fn test_patches_run_before_alias() {
        let c = VendorCanonicalizer::with_defaults();
        assert_eq!(c.normalize("Tradesman Intl"), "Tradesmen International");
        assert_eq!(c.normalize("Acme Labour Svcs"), "Acme Labor Services");
        assert_eq!(c.normalize("Pinnacle Work Force Solns"), "Pinnacle Workforce Solutions");
    }

    #[test]
    fn test_alias_takes_priority_over_fuzzy() {
        let table = VendorTable {
            patches: vec![],
            entries: vec![
                VendorCanonicalEntry::new("Kelly Services", &[]),
                VendorCanonicalEntry::new("Kellogg Staffing", &[r"^kelly serv$"]),
            ],
        };
        let c = VendorCanonicalizer::new(&table, MatchThresholds::default(), 16).unwrap();
        // Fuzzy would pick Kelly Services; the alias wins
        assert_eq!(c.normalize("Kelly Serv"), "Kellogg Staffing");
    }

    #[test]
    fn test_fuzzy_typo_accepted() {
        let c = VendorCanonicalizer::with_defaults();
        assert_eq!(c.normalize("Pinacle Workforce Solutions"), "Pinnacle Workforce Solutions");
        assert_eq!(c.normalize("Blue Ridge Contracters"), "Blue Ridge Contractors");
    }

    #[test]
    fn test_fuzzy_truncated_prefix_accepted() {
        let c = VendorCanonicalizer::with_defaults();
        // jaro-winkler ~0.89: only the prefix rule lets this through
        assert_eq!(c.normalize("Summit Indus"), "Summit Industrial Staffing");
    }

    #[test]
    fn test_unrelated_name_not_matched() {
        let c = VendorCanonicalizer::with_defaults();
        assert_eq!(c.normalize("XYZ Corp."), "Xyz Corp");
        assert_eq!(c.normalize("Greenfield Landscaping"), "Greenfield Landscaping");
    }

    #[test]
    fn test_threshold_rules() {
        let t = MatchThresholds::default();
        assert!(t.accepts(0.95, false));
        assert!(t.accepts(0.93, false));
        assert!(!t.accepts(0.90, false));
        assert!(t.accepts(0.90, true));
        assert!(!t.accepts(0.85, true));
    }

    #[test]
    fn test_thresholds_are_configurable() {
        let strict = MatchThresholds { exact: 0.99, prefix: 0.99 };
        let c = VendorCanonicalizer::new(&VendorTable::with_defaults(), strict, 16).unwrap();
        assert_eq!(c.normalize("Summit Indus"), "Summit Indus");
    }

    #[test]
    fn test_cache_is_owned_and_resettable() {
        let c = VendorCanonicalizer::with_defaults();
        c.normalize("ABC Staffing, LLC");
        c.normalize("abc staffing, llc");
        assert_eq!(c.cache_len(), 1);

        c.reset_cache();
        assert_eq!(c.cache_len(), 0);
        assert_eq!(c.normalize("abc staffing, llc"), "ABC Staffing");
    }

    #[test]
    fn test_cache_is_bounded() {
        let c = VendorCanonicalizer::new(&VendorTable::with_defaults(), MatchThresholds::default(), 2).unwrap();
        c.normalize("one vendor");
        c.normalize("two vendor");
        assert_eq!(c.cache_len(), 2);
        c.normalize("three vendor");
        assert_eq!(c.cache_len(), 1);
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let table = VendorTable {
            patches: vec![PatchRule::new("(unclosed", "x")],
            entries: vec![],
        };
        assert!(VendorCanonicalizer::new(&table, MatchThresholds::default(), 16).is_err());
    }

    #[test]
    fn test_table_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vendors.json");
        fs::write(
            &path,
            r#"{"patches":[{"pattern":"\\bgrp\\b","replacement":"group"}],
                "entries":[{"canonical_name":"Delta Group","aliases":["^delta$"]}]}"#,
        )
        .unwrap();

        let table = VendorTable::from_file(&path).unwrap();
        let c = VendorCanonicalizer::new(&table, MatchThresholds::default(), 16).unwrap();
        assert_eq!(c.normalize("DELTA GRP"), "Delta Group");
        assert_eq!(c.normalize("Delta"), "Delta Group");
    }
}
