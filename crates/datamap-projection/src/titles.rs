//! Cluster titles from TF-IDF weighted uni- and bigrams.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::OnceLock;

use datamap_core::schema::Dataset;
use datamap_core::session::ClusterSummary;
use datamap_core::types::Item;

use crate::axes::normalize;

/// Inserted between fields and items so no n-gram spans two of them.
pub const FIELD_BOUNDARY: &str = "_stop_";
const JOINER: &str = " _stop_ ";
const MAX_FIELD_CHARS: usize = 512;
const CORPUS_MAX_DF: f32 = 0.5;
const CLUSTER_MAX_DF: f32 = 0.7;
const CANDIDATES: usize = 6;
const TITLE_WORDS: usize = 3;
const IMPORTANT_WORDS: usize = 5;

const UNIT_WORDS: &[&str] = &["abstract", "figure", "cm", "mm", "kg", "μm", "kg-1", "g-1", "wt%", "db", "kpa", "mah"];

const STOP_WORDS_EN: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been", "being", "between",
    "both", "but", "by", "can", "could", "did", "do", "does", "during", "each", "for", "from", "had", "has", "have",
    "here", "how", "however", "if", "in", "into", "is", "it", "its", "may", "more", "most", "no", "not", "of", "on",
    "one", "only", "or", "other", "our", "over", "such", "than", "that", "the", "their", "them", "then", "there",
    "these", "they", "this", "those", "through", "to", "two", "under", "up", "using", "via", "was", "we", "were",
    "what", "when", "where", "which", "while", "who", "will", "with", "within", "would",
];

const STOP_WORDS_DE: &[&str] = &[
    "aber", "als", "am", "an", "auch", "auf", "aus", "bei", "bis", "das", "dass", "dem", "den", "der", "des", "die",
    "durch", "ein", "eine", "einem", "einen", "einer", "es", "für", "hat", "im", "in", "ist", "mit", "nach", "nicht",
    "noch", "oder", "sich", "sie", "sind", "so", "über", "um", "und", "von", "vor", "war", "werden", "wie", "wird",
    "zu", "zum", "zur",
];

struct Patterns {
    html_tag: Regex,
    latex_math: Regex,
    plural_abbreviation: Regex,
    split: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        html_tag: Regex::new(r"(?i)<.{1,8}?>(.{1,100}?)</.{1,8}?>").expect("valid html regex"),
        latex_math: Regex::new(r"\$.{1,100}?\$").expect("valid latex regex"),
        plural_abbreviation: Regex::new(r"[A-Z]+?s\b").expect("valid plural regex"),
        split: Regex::new(r"[\s/]").expect("valid split regex"),
    })
}

fn is_numeric(word: &str) -> bool {
    let digits: String = word.chars().filter(|c| !matches!(c, '-' | '.' | ',')).collect();
    !digits.is_empty() && digits.chars().all(char::is_numeric)
}

/// `Word` becomes `word`; abbreviations like `MXene` stay.
fn lower_first_letter(word: &str) -> String {
    let mut chars = word.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };
    let rest = chars.as_str();
    let rest_lower = rest.chars().any(char::is_lowercase) && !rest.chars().any(char::is_uppercase);
    if first.is_uppercase() && rest_lower {
        word.to_lowercase()
    } else {
        word.to_string()
    }
}

/// Split text into title candidates, dropping markup, numbers, urls and unit words.
pub fn tokenize(text: &str) -> Vec<String> {
    let p = patterns();
    let text = text
        .replace(['−', '–'], "-")
        .replace("<sub>2</sub>", "₂")
        .replace("<sub>3</sub>", "₃")
        .replace("<sub>x</sub>", "ₓ");
    let text = p.html_tag.replace_all(&text, "$1");
    let text = p.latex_math.replace_all(&text, "");

    let mut words = Vec::new();
    for raw in p.split.split(&text) {
        let word = raw.trim().trim_matches(|c: char| "()[]{}<>'\".,;".contains(c));
        if word.chars().count() <= 1 || is_numeric(word) {
            continue;
        }
        if word.starts_with("www.") || word.starts_with("http") || word.contains('"') {
            continue;
        }
        let word = if p.plural_abbreviation.is_match(word) {
            let mut w = word.to_string();
            w.pop();
            w
        } else {
            word.to_string()
        };
        let word = lower_first_letter(&word);
        if !UNIT_WORDS.contains(&word.to_lowercase().as_str()) {
            words.push(word);
        }
    }
    words
}

/// Descriptive text of one item; fields are truncated and separated by the boundary token.
pub fn descriptive_text(item: &Item, fields: &[String]) -> String {
    fields
        .iter()
        .filter_map(|f| item.get(f).and_then(|v| v.to_text()))
        .filter(|t| !t.is_empty())
        .map(|t| t.chars().take(MAX_FIELD_CHARS).collect::<String>())
        .collect::<Vec<_>>()
        .join(JOINER)
}

#[derive(Debug, Clone, Default)]
pub struct TitleSettings {
    pub ignore_words: HashSet<String>,
    pub lower_case: bool,
}

impl TitleSettings {
    /// Static stop words for the datasets' languages plus their own ignore lists.
    pub fn for_datasets(datasets: &[Dataset]) -> Self {
        let mut ignore_words: HashSet<String> = HashSet::new();
        for ds in datasets {
            let stop_words = match ds.language.as_str() {
                "de" => STOP_WORDS_DE,
                _ => STOP_WORDS_EN,
            };
            ignore_words.extend(stop_words.iter().map(|w| (*w).to_string()));
            ignore_words.extend(ds.ignore_words.iter().map(|w| w.to_lowercase()));
        }
        let lower_case = datasets.iter().any(|d| d.use_lower_case);
        Self { ignore_words, lower_case }
    }
}

fn tokens_of(text: &str, settings: &TitleSettings, ignore: &HashSet<String>) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .map(|t| if settings.lower_case { t.to_lowercase() } else { t })
        .filter(|t| t == FIELD_BOUNDARY || !(settings.ignore_words.contains(&t.to_lowercase()) || ignore.contains(t)))
        .collect()
}

/// Words in at least half of all documents.
fn frequent_words(texts: &[String], settings: &TitleSettings) -> HashSet<String> {
    let mut df: BTreeMap<String, usize> = BTreeMap::new();
    for text in texts {
        let unique: BTreeSet<String> = tokens_of(text, settings, &HashSet::new()).into_iter().collect();
        for t in unique {
            *df.entry(t).or_default() += 1;
        }
    }
    let n = texts.len() as f32;
    df.into_iter()
        .filter(|(t, count)| t != FIELD_BOUNDARY && texts.len() > 1 && *count as f32 >= CORPUS_MAX_DF * n)
        .map(|(t, _)| t)
        .collect()
}

fn ngrams(tokens: &[String]) -> Vec<String> {
    let mut out: Vec<String> = tokens.iter().filter(|t| *t != FIELD_BOUNDARY).cloned().collect();
    for pair in tokens.windows(2) {
        if pair[0] != FIELD_BOUNDARY && pair[1] != FIELD_BOUNDARY {
            out.push(format!("{} {}", pair[0], pair[1]));
        }
    }
    out
}

/// Row-normalised TF-IDF weights per document, highest first.
fn tfidf(docs: &[Vec<String>]) -> Vec<Vec<(String, f32)>> {
    let n = docs.len();
    let counts: Vec<BTreeMap<&str, usize>> = docs
        .iter()
        .map(|terms| {
            let mut c: BTreeMap<&str, usize> = BTreeMap::new();
            for t in terms {
                *c.entry(t.as_str()).or_default() += 1;
            }
            c
        })
        .collect();
    let mut df: BTreeMap<&str, usize> = BTreeMap::new();
    for c in &counts {
        for t in c.keys() {
            *df.entry(*t).or_default() += 1;
        }
    }

    let build = |max_df: Option<f32>| -> Vec<Vec<(String, f32)>> {
        counts
            .iter()
            .map(|c| {
                let mut row: Vec<(String, f32)> = c
                    .iter()
                    .filter(|(t, _)| max_df.map_or(true, |m| df[*t] as f32 <= m * n as f32))
                    .map(|(t, tf)| {
                        let idf = ((1.0 + n as f32) / (1.0 + df[t] as f32)).ln() + 1.0;
                        ((*t).to_string(), *tf as f32 * idf)
                    })
                    .collect();
                let norm = row.iter().map(|(_, w)| w * w).sum::<f32>().sqrt();
                if norm > 0.0 {
                    row.iter_mut().for_each(|(_, w)| *w /= norm);
                }
                row.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                row
            })
            .collect()
    };
    let rows = build(Some(CLUSTER_MAX_DF));
    if rows.iter().all(Vec::is_empty) {
        build(None)
    } else {
        rows
    }
}

/// Replace terms contained in another candidate by the longer one, walking from the end.
pub fn merge_substrings(mut words: Vec<String>) -> Vec<String> {
    let mut i = words.len();
    while i > 0 {
        i -= 1;
        if i >= words.len() {
            continue;
        }
        let other = (0..words.len()).find(|&j| j != i && words[j] != words[i] && words[j].contains(words[i].as_str()));
        if let Some(j) = other {
            let longer = words[j].clone();
            words[i.min(j)] = longer;
            words.remove(i.max(j));
        }
    }
    words
}

fn format_title(words: &[String], count: usize, avg_score: f32) -> (String, String) {
    let suffix = format!("({count}x, {:.0}%)", avg_score * 100.0);
    let title = format!("{} {suffix}", words.join(", "));
    let html = match words.split_first() {
        Some((first, rest)) => {
            let mut html = format!("<span style=\"font-weight: bold;\">{first}</span>");
            for w in rest {
                html.push_str(", ");
                html.push_str(w);
            }
            format!("{html} {suffix}")
        }
        None => title.clone(),
    };
    (title, html)
}

struct Group {
    texts: Vec<String>,
    positions: Vec<[f32; 2]>,
    scores: Vec<f32>,
}

fn summarize(groups: Vec<Group>, settings: &TitleSettings, ignore: &HashSet<String>) -> Vec<ClusterSummary> {
    let docs: Vec<Vec<String>> = groups
        .iter()
        .map(|g| ngrams(&tokens_of(&g.texts.join(JOINER), settings, ignore)))
        .collect();
    let weights = tfidf(&docs);

    let mut summaries: Vec<ClusterSummary> = groups
        .iter()
        .zip(weights)
        .enumerate()
        .map(|(id, (group, row))| {
            let count = group.positions.len().max(1);
            let centroid = group.positions.iter().fold([0.0_f32; 2], |acc, p| [acc[0] + p[0], acc[1] + p[1]]);
            let centroid = [centroid[0] / count as f32, centroid[1] / count as f32];
            let min_score = group.scores.iter().copied().fold(f32::INFINITY, f32::min);
            let max_score = group.scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let avg_score = group.scores.iter().sum::<f32>() / count as f32;

            let candidates: Vec<String> = row.iter().take(CANDIDATES).map(|(t, _)| t.clone()).collect();
            let mut words = merge_substrings(candidates);
            words.truncate(TITLE_WORDS);
            let (title, title_html) = if words.is_empty() {
                let fallback = format!("Cluster {id}");
                (fallback.clone(), fallback)
            } else {
                format_title(&words, group.positions.len(), avg_score)
            };
            ClusterSummary {
                id: id as i32,
                title,
                title_html,
                centroid,
                min_score: if min_score.is_finite() { min_score } else { 0.0 },
                avg_score,
                max_score: if max_score.is_finite() { max_score } else { 0.0 },
                member_count: group.positions.len(),
                important_words: row.into_iter().take(IMPORTANT_WORDS).collect(),
            }
        })
        .collect();
    summaries.sort_by(|a, b| b.avg_score.total_cmp(&a.avg_score));
    summaries
}

/// Titles and statistics for every non-noise cluster, sorted by average score.
///
/// `texts`, `positions`, `scores` and `labels` are parallel per-point slices.
/// Scores are normalised over all points first.
pub fn cluster_summaries(
    texts: &[String],
    positions: &[[f32; 2]],
    scores: &[f32],
    labels: &[i32],
    settings: &TitleSettings,
) -> Vec<ClusterSummary> {
    let n_clusters = labels.iter().copied().max().map_or(0, |m| (m + 1).max(0) as usize);
    if n_clusters == 0 {
        return Vec::new();
    }
    let normalized = normalize(scores);
    let mut groups: Vec<Group> =
        (0..n_clusters).map(|_| Group { texts: Vec::new(), positions: Vec::new(), scores: Vec::new() }).collect();
    for (i, &label) in labels.iter().enumerate() {
        let Ok(idx) = usize::try_from(label) else {
            continue;
        };
        let group = &mut groups[idx];
        group.texts.push(texts.get(i).cloned().unwrap_or_default());
        group.positions.push(positions.get(i).copied().unwrap_or_default());
        group.scores.push(normalized.get(i).copied().unwrap_or(0.0));
    }
    let ignore = frequent_words(texts, settings);
    summarize(groups, settings, &ignore)
}

/// Title for a user selection within a finished map: the selection is
/// cluster 0 and everything else noise.
pub fn selection_summary(
    texts: &[String],
    positions: &[[f32; 2]],
    scores: &[f32],
    selected: &[bool],
    settings: &TitleSettings,
) -> Option<ClusterSummary> {
    let labels: Vec<i32> = (0..texts.len()).map(|i| if selected.get(i).copied().unwrap_or(false) { 0 } else { -1 }).collect();
    cluster_summaries(texts, positions, scores, &labels, settings).into_iter().next()
}
