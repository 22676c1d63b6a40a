//! Deterministic brainstorm synthesizer: clusters raw ideas into labeled
//! options.
//!
//! Purity is a hard contract: the same input must produce byte-identical
//! output, so every intermediate structure iterates in a defined order
//! (BTree maps/sets, input-order vectors) and all tie-breaks are explicit.
//! The stopword and ultra-common lists below are part of that contract —
//! editing them changes synthesizer output.

use crate::brainstorm::RawIdea;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Tokens dropped during idea tokenization. Also used by the briefing
/// keyword sanitizer.
pub(crate) const STOPWORDS: &[&str] = &[
    "the", "and", "for", "that", "with", "this", "from", "have", "will", "would", "could",
    "should", "about", "into", "over", "more", "less", "very", "just", "than", "then", "them",
    "they", "their", "there", "what", "when", "where", "which", "while", "your", "you", "our",
    "are", "was", "were", "been", "being", "has", "had", "not", "but", "can", "may", "might",
    "must", "its", "also", "each", "other", "some", "any", "all", "one", "two", "how", "why",
    "who", "these", "those", "because", "through", "during", "before", "after", "between",
    "out", "off", "own", "same", "too", "only", "such", "most", "few", "both", "now", "get",
    "use", "make", "need", "want", "like", "new", "way", "well", "even", "back", "know",
];

/// Words too generic to label a cluster with.
const ULTRA_COMMON: &[&str] = &[
    "idea", "ideas", "option", "options", "approach", "strategy", "plan", "thing", "things",
    "maybe", "perhaps", "really", "actually", "basically", "probably", "possibly", "improve",
    "better", "create", "build", "add", "try", "consider", "explore", "focus", "work", "start",
    "different", "problem", "solution", "team", "project", "process", "system",
];

const MAX_OPTIONS: usize = 10;
const MIN_CLUSTER_SIZE: usize = 3;
const ATTACH_THRESHOLD: usize = 2;

// ---------------------------------------------------------------------------
// Output payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrainstormOption {
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pros: Option<String>,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrainstormPayload {
    pub options: Vec<BrainstormOption>,
    pub recommendation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contrarian_view: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assumptions_to_validate: Option<Vec<String>>,
    pub notes: String,
}

#[derive(Debug, Clone, Default)]
pub struct SynthesisOptions {
    pub topic: String,
    pub techniques_used: Vec<String>,
    pub round_count: usize,
}

// ---------------------------------------------------------------------------
// Tokenization
// ---------------------------------------------------------------------------

fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace() || c == '-' {
                c
            } else {
                ' '
            }
        })
        .collect();
    cleaned
        .split_whitespace()
        .filter(|t| t.len() > 2 && !STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn title_case(s: &str) -> String {
    s.split(' ')
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

// ---------------------------------------------------------------------------
// Clustering
// ---------------------------------------------------------------------------

struct Cluster {
    /// Token multiset across member ideas.
    tokens: BTreeMap<String, usize>,
    categories: BTreeSet<String>,
    rounds: BTreeSet<i64>,
    /// Member indices into the input slice, insertion order.
    ideas: Vec<usize>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            tokens: BTreeMap::new(),
            categories: BTreeSet::new(),
            rounds: BTreeSet::new(),
            ideas: Vec::new(),
        }
    }

    fn absorb(&mut self, idea_idx: usize, idea: &RawIdea, idea_tokens: &[String]) {
        for token in idea_tokens {
            *self.tokens.entry(token.clone()).or_insert(0) += 1;
        }
        self.categories.insert(idea.category.clone());
        self.rounds.insert(idea.round_number);
        self.ideas.push(idea_idx);
    }

    fn merge(&mut self, other: Cluster) {
        for (token, count) in other.tokens {
            *self.tokens.entry(token).or_insert(0) += count;
        }
        self.categories.extend(other.categories);
        self.rounds.extend(other.rounds);
        self.ideas.extend(other.ideas);
    }

    /// Similarity of an idea to this cluster: distinct-token overlap plus a
    /// category bonus.
    fn affinity(&self, idea: &RawIdea, idea_tokens: &[String]) -> usize {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut overlap = 0usize;
        for token in idea_tokens {
            if seen.insert(token) && self.tokens.contains_key(token) {
                overlap += 1;
            }
        }
        let category_bonus = if self.categories.contains(&idea.category) { 2 } else { 0 };
        overlap + category_bonus
    }

    /// Cluster-to-cluster similarity used for small-cluster merging.
    fn overlap_with(&self, other: &Cluster) -> usize {
        let shared_tokens =
            other.tokens.keys().filter(|token| self.tokens.contains_key(*token)).count();
        let shared_categories =
            other.categories.iter().filter(|c| self.categories.contains(*c)).count();
        shared_tokens + shared_categories * 2
    }
}

fn build_clusters(ideas: &[RawIdea]) -> Vec<Cluster> {
    let tokenized: Vec<Vec<String>> = ideas.iter().map(|i| tokenize(&i.text)).collect();
    let mut clusters: Vec<Cluster> = Vec::new();

    for (idx, idea) in ideas.iter().enumerate() {
        let idea_tokens = &tokenized[idx];
        let mut best: Option<(usize, usize)> = None;
        for (cluster_idx, cluster) in clusters.iter().enumerate() {
            let score = cluster.affinity(idea, idea_tokens);
            // Strictly-greater keeps the earliest cluster on ties
            if score >= ATTACH_THRESHOLD && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((cluster_idx, score));
            }
        }
        match best {
            Some((cluster_idx, _)) => clusters[cluster_idx].absorb(idx, idea, idea_tokens),
            None => {
                let mut cluster = Cluster::new();
                cluster.absorb(idx, idea, idea_tokens);
                clusters.push(cluster);
            }
        }
    }
    clusters
}

fn merge_small_clusters(clusters: Vec<Cluster>) -> Vec<Cluster> {
    // Stable sort by size descending preserves input order within a size
    let mut ordered: Vec<Cluster> = clusters;
    ordered.sort_by_key(|c| std::cmp::Reverse(c.ideas.len()));

    let mut large: Vec<Cluster> = Vec::new();
    let mut small: Vec<Cluster> = Vec::new();
    for cluster in ordered {
        if cluster.ideas.len() >= MIN_CLUSTER_SIZE {
            large.push(cluster);
        } else {
            small.push(cluster);
        }
    }

    for cluster in small {
        if large.is_empty() {
            large.push(cluster);
            continue;
        }
        let mut best_idx = 0usize;
        let mut best_score = 0usize;
        for (idx, candidate) in large.iter().enumerate() {
            let score = candidate.overlap_with(&cluster);
            if score > best_score {
                best_score = score;
                best_idx = idx;
            }
        }
        large[best_idx].merge(cluster);
    }
    large
}

fn rank_clusters(clusters: &mut [Cluster]) {
    clusters.sort_by(|a, b| {
        b.ideas
            .len()
            .cmp(&a.ideas.len())
            .then(b.rounds.len().cmp(&a.rounds.len()))
            .then(b.categories.len().cmp(&a.categories.len()))
    });
}

// ---------------------------------------------------------------------------
// Labeling
// ---------------------------------------------------------------------------

/// Label a cluster from its most frequent tokens and n-grams. Falls back to
/// `Option {N}: {first idea}` when nothing usable survives the filters.
fn label_cluster(cluster: &Cluster, ideas: &[RawIdea], option_number: usize) -> String {
    // (occurrences, weighted frequency) per candidate phrase
    let mut candidates: BTreeMap<String, (usize, usize)> = BTreeMap::new();

    for idea_idx in &cluster.ideas {
        let tokens: Vec<String> = tokenize(&ideas[*idea_idx].text)
            .into_iter()
            .filter(|t| !ULTRA_COMMON.contains(&t.as_str()))
            .collect();
        for token in &tokens {
            let entry = candidates.entry(token.clone()).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += 1;
        }
        for pair in tokens.windows(2) {
            let entry = candidates.entry(pair.join(" ")).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += 2;
        }
        for triple in tokens.windows(3) {
            let entry = candidates.entry(triple.join(" ")).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += 3;
        }
    }

    candidates.retain(|_, (occurrences, _)| *occurrences >= 2);

    let top_freq = candidates.values().map(|(_, freq)| *freq).max().unwrap_or(0);
    let mut best: Option<(&String, usize, usize)> = None; // (phrase, words, freq)
    if top_freq > 0 {
        let floor = (top_freq as f64 * 0.7).ceil() as usize;
        for (phrase, (_, freq)) in &candidates {
            if *freq < floor {
                continue;
            }
            let words = phrase.split(' ').count();
            let better = match best {
                None => true,
                Some((_, best_words, best_freq)) => {
                    words > best_words || (words == best_words && *freq > best_freq)
                }
            };
            if better {
                best = Some((phrase, words, *freq));
            }
        }
    }

    if let Some((phrase, _, _)) = best {
        let label = title_case(phrase);
        let len = label.chars().count();
        if (3..=80).contains(&len) {
            return label;
        }
    }

    let first_idea = cluster
        .ideas
        .first()
        .map(|idx| ideas[*idx].text.trim())
        .unwrap_or("");
    format!("Option {option_number}: {}", truncate_chars(first_idea, 60))
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// Cluster raw ideas into labeled options. Pure: identical input produces
/// byte-identical output.
pub fn synthesize(ideas: &[RawIdea], opts: &SynthesisOptions) -> BrainstormPayload {
    let clusters = build_clusters(ideas);
    let mut clusters = merge_small_clusters(clusters);
    rank_clusters(&mut clusters);
    clusters.truncate(MAX_OPTIONS);

    let mut options = Vec::with_capacity(clusters.len());
    let mut labels = Vec::with_capacity(clusters.len());
    for (rank, cluster) in clusters.iter().enumerate() {
        let label = label_cluster(cluster, ideas, rank + 1);
        let member_texts: Vec<&str> =
            cluster.ideas.iter().map(|idx| ideas[*idx].text.trim()).collect();
        let description = truncate_chars(
            &member_texts.iter().take(5).cloned().collect::<Vec<_>>().join(". "),
            2000,
        );
        let pros = if cluster.ideas.len() > 1 {
            Some(format!(
                "Supported by {} ideas across {} round(s)",
                cluster.ideas.len(),
                cluster.rounds.len()
            ))
        } else {
            None
        };
        options.push(BrainstormOption {
            title: truncate_chars(&label, 200),
            description,
            pros,
            action: truncate_chars(member_texts.first().unwrap_or(&""), 500),
        });
        labels.push(label);
    }

    let recommendation = match options.first() {
        Some(top) => format!(
            "Focus on \"{}\" — the strongest theme with the most convergent ideas.",
            top.title
        ),
        None => "No ideas captured yet.".to_string(),
    };

    // Contrarian view: the non-leading cluster with the highest category
    // diversity per idea, when it actually spans multiple categories.
    let contrarian_view = clusters
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, c)| c.categories.len() >= 2)
        .max_by(|(ai, a), (bi, b)| {
            let ratio_a = a.categories.len() as f64 / a.ideas.len().max(1) as f64;
            let ratio_b = b.categories.len() as f64 / b.ideas.len().max(1) as f64;
            ratio_a
                .partial_cmp(&ratio_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(bi.cmp(ai)) // earlier rank wins ties
        })
        .map(|(idx, cluster)| {
            format!(
                "Consider \"{}\" as an unconventional angle — it draws from {} different technique categories.",
                labels[idx],
                cluster.categories.len()
            )
        });

    let assumptions: Vec<String> = ideas
        .iter()
        .filter(|idea| {
            idea.category == "disruptive"
                || idea.technique_id.contains("first-principles")
                || idea.technique_id.contains("what-if")
        })
        .take(10)
        .map(|idea| truncate_chars(idea.text.trim(), 500))
        .collect();
    let assumptions_to_validate = if assumptions.is_empty() { None } else { Some(assumptions) };

    let techniques = if opts.techniques_used.is_empty() {
        "no recorded techniques".to_string()
    } else {
        opts.techniques_used.join(", ")
    };
    let notes = truncate_chars(
        &format!(
            "Synthesized {} idea(s) across {} round(s) using {} on \"{}\".",
            ideas.len(),
            opts.round_count,
            techniques,
            opts.topic
        ),
        2000,
    );

    BrainstormPayload { options, recommendation, contrarian_view, assumptions_to_validate, notes }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn idea(id: &str, text: &str, category: &str, technique: &str, round: i64) -> RawIdea {
        RawIdea {
            id: id.to_string(),
            round_number: round,
            technique_id: technique.to_string(),
            category: category.to_string(),
            text: text.to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn fixture() -> Vec<RawIdea> {
        vec![
            idea("i1", "launch referral program for existing customers", "creative", "creative-scamper", 1),
            idea("i2", "referral program with tiered customer rewards", "creative", "creative-scamper", 1),
            idea("i3", "customer referral rewards shared on social media", "analytical", "analytical-swot", 2),
            idea("i4", "partner integrations marketplace for distribution", "analytical", "analytical-swot", 2),
            idea("i5", "marketplace revenue share with integration partners", "analytical", "analytical-swot", 2),
            idea("i6", "what if pricing were usage based entirely", "disruptive", "disruptive-what-if", 3),
            idea("i7", "usage based pricing tier for small accounts", "disruptive", "disruptive-what-if", 3),
            idea("i8", "drop annual contracts and go monthly usage pricing", "disruptive", "disruptive-first-principles", 3),
        ]
    }

    fn opts() -> SynthesisOptions {
        SynthesisOptions {
            topic: "Growth levers".to_string(),
            techniques_used: vec!["SCAMPER".into(), "SWOT Analysis".into(), "What If".into()],
            round_count: 3,
        }
    }

    #[test]
    fn test_determinism_across_calls() {
        let ideas = fixture();
        let options = opts();
        let a = serde_json::to_string(&synthesize(&ideas, &options)).unwrap();
        let b = serde_json::to_string(&synthesize(&ideas, &options)).unwrap();
        let c = serde_json::to_string(&synthesize(&ideas, &options)).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_clusters_group_related_ideas() {
        let payload = synthesize(&fixture(), &opts());
        assert!(!payload.options.is_empty());
        assert!(payload.options.len() <= MAX_OPTIONS);
        // The largest theme leads and the recommendation names it
        assert!(payload.recommendation.contains(&payload.options[0].title));
    }

    #[test]
    fn test_pros_reports_support() {
        let payload = synthesize(&fixture(), &opts());
        let with_pros = payload.options.iter().find(|o| o.pros.is_some()).unwrap();
        let pros = with_pros.pros.as_ref().unwrap();
        assert!(pros.starts_with("Supported by "));
        assert!(pros.contains("round(s)"));
    }

    #[test]
    fn test_assumptions_from_disruptive_ideas() {
        let payload = synthesize(&fixture(), &opts());
        let assumptions = payload.assumptions_to_validate.unwrap();
        assert!(assumptions.iter().any(|a| a.contains("usage based")));
        assert!(assumptions.len() <= 10);
    }

    #[test]
    fn test_empty_input() {
        let payload = synthesize(&[], &opts());
        assert!(payload.options.is_empty());
        assert_eq!(payload.recommendation, "No ideas captured yet.");
        assert!(payload.assumptions_to_validate.is_none());
    }

    #[test]
    fn test_single_idea_has_no_pros() {
        let ideas = vec![idea("i1", "a single lonely thought about pricing", "creative", "creative-scamper", 1)];
        let payload = synthesize(&ideas, &opts());
        assert_eq!(payload.options.len(), 1);
        assert!(payload.options[0].pros.is_none());
    }

    #[test]
    fn test_label_falls_back_to_first_idea() {
        // No token appears twice, so no label candidate survives
        let ideas = vec![
            idea("i1", "alpha bravo charlie", "creative", "creative-scamper", 1),
            idea("i2", "delta echo foxtrot", "creative", "creative-scamper", 1),
            idea("i3", "golf hotel india", "creative", "creative-scamper", 1),
        ];
        let payload = synthesize(&ideas, &opts());
        assert!(payload.options[0].title.starts_with("Option 1: "));
    }

    #[test]
    fn test_tokenize_rules() {
        let tokens = tokenize("The QUICK-fix: re-use 12 APIs, not the old ones!");
        assert!(tokens.contains(&"quick-fix".to_string()));
        assert!(tokens.contains(&"apis".to_string()));
        assert!(!tokens.iter().any(|t| t == "the"), "stopwords dropped");
        assert!(!tokens.iter().any(|t| t.len() <= 2), "short tokens dropped");
    }
}
