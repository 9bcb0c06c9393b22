//! Result aggregation for the reduce phase.
//!
//! Pipeline: flatten findings (stripping verification prefixes and
//! filtering ghosts from deleted files), group by similarity with a
//! token-blocking index, merge each group keeping the highest-confidence
//! member, sort by query relevance, then scan merged findings for
//! contradictions. Also home to the termination-marker parser applied to
//! raw model responses.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::finding::{Confidence, Finding};
use crate::core::result::ChunkResult;

/// Prefix on a finding's `point` that flags it for human verification.
const VERIFICATION_PREFIX: &str = "NEEDS_VERIFICATION";

/// Default similarity threshold for deduplication.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;

/// Similarity threshold used by the contradiction scan (looser than
/// dedup: contradictory statements differ by design).
const CONTRADICTION_THRESHOLD: f64 = 0.4;

const NEGATION_WORDS: &[&str] = &["no ", "not ", "never ", "without ", "n't "];

/// A merged finding with its supporting chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedFinding {
    /// The representative finding (highest confidence in its group).
    pub finding: Finding,
    /// Chunk ids that reported this finding.
    pub sources: Vec<String>,
    /// Number of chunks supporting it.
    pub support_count: usize,
    /// Confidence of the representative.
    pub confidence: Confidence,
    /// OR of `verification_required` across the group.
    pub verification_required: bool,
    /// Point text with the verification prefix stripped.
    pub point_clean: String,
}

/// A detected contradiction between two merged findings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contradiction {
    /// First finding's point.
    pub finding_1: String,
    /// Second finding's point.
    pub finding_2: String,
    /// Chunks supporting the first.
    pub sources_1: Vec<String>,
    /// Chunks supporting the second.
    pub sources_2: Vec<String>,
    /// Fixed severity label.
    pub severity: String,
}

/// Output of the aggregation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationResult {
    /// Merged findings, sorted by query relevance.
    pub aggregated_findings: Vec<AggregatedFinding>,
    /// Finding count before deduplication (after the ghost filter).
    pub total_findings: usize,
    /// Finding count after deduplication.
    pub unique_findings: usize,
    /// `1 - unique/total`, in `[0, 1]`.
    pub deduplication_ratio: f64,
    /// Detected contradictions.
    pub contradictions: Vec<Contradiction>,
    /// Whether contradictions require manual review.
    pub needs_manual_review: bool,
    /// Findings dropped because they referenced deleted files.
    pub filtered_deleted_files: usize,
    /// Number of merged findings needing verification.
    pub verification_required_count: usize,
    /// The verification-required subset.
    pub verification_required_findings: Vec<AggregatedFinding>,
}

impl AggregationResult {
    fn empty(filtered: usize) -> Self {
        Self {
            aggregated_findings: Vec::new(),
            total_findings: 0,
            unique_findings: 0,
            deduplication_ratio: 0.0,
            contradictions: Vec::new(),
            needs_manual_review: false,
            filtered_deleted_files: filtered,
            verification_required_count: 0,
            verification_required_findings: Vec::new(),
        }
    }
}

struct FlatFinding {
    finding: Finding,
    source_chunk: String,
    point_clean: String,
    verification_required: bool,
}

/// Aggregates findings from chunk results.
pub struct Aggregator {
    similarity_threshold: f64,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl Aggregator {
    /// Creates an aggregator. Higher thresholds mean stricter matching
    /// and less deduplication.
    #[must_use]
    pub const fn new(similarity_threshold: f64) -> Self {
        Self {
            similarity_threshold,
        }
    }

    /// Runs the full aggregation pipeline.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn aggregate(
        &self,
        chunk_results: &[ChunkResult],
        original_query: &str,
        deleted_files: Option<&[String]>,
    ) -> AggregationResult {
        let deleted: BTreeSet<String> = deleted_files
            .unwrap_or_default()
            .iter()
            .map(|p| normalize_path(p))
            .collect();

        let mut filtered = 0usize;
        let mut flat: Vec<FlatFinding> = Vec::new();

        for result in chunk_results {
            for finding in &result.findings {
                if !deleted.is_empty() && is_ghost_finding(finding, &result.chunk_id, &deleted) {
                    filtered += 1;
                    continue;
                }

                let mut point_clean = finding.point.clone();
                let mut verification_required = finding.verification_required;
                if let Some(stripped) = point_clean.strip_prefix(VERIFICATION_PREFIX) {
                    verification_required = true;
                    point_clean = stripped.trim_start_matches([':', ' ']).trim().to_string();
                }

                flat.push(FlatFinding {
                    finding: finding.clone(),
                    source_chunk: result.chunk_id.clone(),
                    point_clean,
                    verification_required,
                });
            }
        }

        if flat.is_empty() {
            return AggregationResult::empty(filtered);
        }

        let groups = self.group_by_similarity(&flat);

        let mut merged: Vec<AggregatedFinding> = groups
            .iter()
            .map(|group| {
                let best = group
                    .iter()
                    .copied()
                    .max_by_key(|i| flat[*i].finding.confidence.score())
                    .unwrap_or(group[0]);
                AggregatedFinding {
                    finding: flat[best].finding.clone(),
                    sources: group.iter().map(|i| flat[*i].source_chunk.clone()).collect(),
                    support_count: group.len(),
                    confidence: flat[best].finding.confidence,
                    verification_required: group
                        .iter()
                        .any(|i| flat[*i].verification_required),
                    point_clean: flat[best].point_clean.clone(),
                }
            })
            .collect();

        // Sort by relevance to the original query, highest first.
        let mut scored: Vec<(f64, AggregatedFinding)> = merged
            .drain(..)
            .map(|f| (relevance_score(&f.finding, original_query), f))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let merged: Vec<AggregatedFinding> = scored.into_iter().map(|(_, f)| f).collect();

        let contradictions = detect_contradictions(&merged);
        let verification_required_findings: Vec<AggregatedFinding> = merged
            .iter()
            .filter(|f| f.verification_required)
            .cloned()
            .collect();

        AggregationResult {
            total_findings: flat.len(),
            unique_findings: merged.len(),
            deduplication_ratio: 1.0 - (merged.len() as f64 / flat.len().max(1) as f64),
            needs_manual_review: !contradictions.is_empty(),
            contradictions,
            filtered_deleted_files: filtered,
            verification_required_count: verification_required_findings.len(),
            verification_required_findings,
            aggregated_findings: merged,
        }
    }

    /// Groups findings by similarity using token blocking: an inverted
    /// index over the first five tokens restricts the pairwise
    /// comparisons to findings that share vocabulary.
    fn group_by_similarity(&self, findings: &[FlatFinding]) -> Vec<Vec<usize>> {
        if findings.len() <= 1 {
            return (0..findings.len()).map(|i| vec![i]).collect();
        }

        let token_index = build_token_index(findings);
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut used = vec![false; findings.len()];

        for i in 0..findings.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            let mut group = vec![i];
            let text_i = &findings[i].point_clean;

            let mut candidates: BTreeSet<usize> = BTreeSet::new();
            for token in blocking_tokens(text_i) {
                if let Some(posts) = token_index.get(&token) {
                    candidates.extend(posts.iter().copied());
                }
            }

            for j in candidates {
                if j == i || used[j] {
                    continue;
                }
                let text_j = &findings[j].point_clean;
                if !can_be_similar(text_i, text_j) {
                    continue;
                }
                if sequence_ratio(&text_i.to_lowercase(), &text_j.to_lowercase())
                    >= self.similarity_threshold
                {
                    group.push(j);
                    used[j] = true;
                }
            }

            groups.push(group);
        }

        groups
    }
}

/// Formats an aggregation result as a human-readable summary.
#[must_use]
pub fn format_summary(result: &AggregationResult, max_findings: usize) -> String {
    let mut lines = vec![
        "=== DeepScan Results Summary ===".to_string(),
        format!("Total findings: {}", result.total_findings),
        format!("Unique findings: {}", result.unique_findings),
        format!("Deduplication: {:.1}%", result.deduplication_ratio * 100.0),
        String::new(),
    ];

    if !result.contradictions.is_empty() {
        lines.push(format!(
            "[!] {} contradictions detected",
            result.contradictions.len()
        ));
        lines.push(String::new());
    }

    if result.verification_required_count > 0 {
        lines.push(format!(
            "{} findings need verification:",
            result.verification_required_count
        ));
        lines.push("-".repeat(40));
        for (i, f) in result
            .verification_required_findings
            .iter()
            .take(max_findings)
            .enumerate()
        {
            lines.push(format!(
                "{}. [{}] {}",
                i + 1,
                f.confidence.as_str(),
                f.point_clean
            ));
            if f.support_count > 1 {
                lines.push(format!("   (supported by {} chunks)", f.support_count));
            }
        }
        lines.push(String::new());
    }

    lines.push("Top Findings:".to_string());
    lines.push("-".repeat(40));
    for (i, f) in result.aggregated_findings.iter().take(max_findings).enumerate() {
        lines.push(format!(
            "{}. [{}] {}",
            i + 1,
            f.confidence.as_str(),
            f.point_clean
        ));
        if f.support_count > 1 {
            lines.push(format!("   (supported by {} chunks)", f.support_count));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").to_lowercase()
}

fn is_ghost_finding(finding: &Finding, chunk_id: &str, deleted: &BTreeSet<String>) -> bool {
    let chunk_norm = normalize_path(chunk_id);
    if deleted.iter().any(|d| chunk_norm.contains(d.as_str())) {
        return true;
    }
    if let Some(file) = finding.location_file() {
        let file_norm = normalize_path(&file);
        if deleted.iter().any(|d| file_norm.contains(d.as_str())) {
            return true;
        }
    }
    if !finding.evidence.is_empty() {
        let evidence_norm = normalize_path(&finding.evidence);
        if deleted.iter().any(|d| evidence_norm.contains(d.as_str())) {
            return true;
        }
    }
    false
}

/// First five whitespace tokens of length >= 3, lower-cased.
fn blocking_tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .take(5)
        .filter(|t| t.len() >= 3)
        .map(str::to_string)
        .collect()
}

fn build_token_index(findings: &[FlatFinding]) -> HashMap<String, Vec<usize>> {
    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, finding) in findings.iter().enumerate() {
        for token in blocking_tokens(&finding.point_clean) {
            index.entry(token).or_default().push(i);
        }
    }
    index
}

/// Cheap filters applied before the expensive ratio computation: length
/// ratio at least 0.5 and at least one shared blocking token.
fn can_be_similar(a: &str, b: &str) -> bool {
    let (len_a, len_b) = (a.len(), b.len());
    if len_a == 0 || len_b == 0 {
        return len_a == len_b;
    }
    #[allow(clippy::cast_precision_loss)]
    let length_ratio = len_a.min(len_b) as f64 / len_a.max(len_b) as f64;
    if length_ratio < 0.5 {
        return false;
    }

    let tokens_a: BTreeSet<String> = blocking_tokens(a).into_iter().collect();
    let tokens_b: BTreeSet<String> = blocking_tokens(b).into_iter().collect();
    if !tokens_a.is_empty() && !tokens_b.is_empty() && tokens_a.is_disjoint(&tokens_b) {
        return false;
    }
    true
}

/// Ratio-style sequence similarity: `2 * matches / (len_a + len_b)`
/// over recursively-found longest matching blocks.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let matches = matching_chars(&a, &b);
    2.0 * matches as f64 / (a.len() + b.len()) as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let (a_start, b_start, len) = longest_match(a, b);
    if len == 0 {
        return 0;
    }
    len + matching_chars(&a[..a_start], &b[..b_start])
        + matching_chars(&a[a_start + len..], &b[b_start + len..])
}

fn longest_match(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    // j2len[j] = length of match ending at a[i-1], b[j-1].
    let mut j2len: HashMap<usize, usize> = HashMap::new();
    for (i, ca) in a.iter().enumerate() {
        let mut new_j2len: HashMap<usize, usize> = HashMap::new();
        for (j, cb) in b.iter().enumerate() {
            if ca == cb {
                let k = j.checked_sub(1).and_then(|p| j2len.get(&p)).copied().unwrap_or(0) + 1;
                new_j2len.insert(j, k);
                if k > best.2 {
                    best = (i + 1 - k, j + 1 - k, k);
                }
            }
        }
        j2len = new_j2len;
    }
    best
}

/// Keyword-overlap relevance of a finding to the query.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn relevance_score(finding: &Finding, query: &str) -> f64 {
    let query_words: BTreeSet<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if query_words.is_empty() {
        return 1.0;
    }
    let finding_words: BTreeSet<String> = finding
        .point
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let overlap = query_words.intersection(&finding_words).count();
    overlap as f64 / query_words.len() as f64
}

/// Scans merged findings for pairs that differ in negation while staying
/// on the same topic (similarity above the contradiction threshold).
#[must_use]
pub fn detect_contradictions(merged: &[AggregatedFinding]) -> Vec<Contradiction> {
    let mut contradictions = Vec::new();

    for i in 0..merged.len() {
        for j in (i + 1)..merged.len() {
            let text_1 = merged[i].point_clean.to_lowercase();
            let text_2 = merged[j].point_clean.to_lowercase();

            // Length-ratio early termination.
            let (len_1, len_2) = (text_1.len(), text_2.len());
            if len_1 == 0 || len_2 == 0 {
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let length_ratio = len_1.min(len_2) as f64 / len_1.max(len_2) as f64;
            if length_ratio < CONTRADICTION_THRESHOLD {
                continue;
            }

            // One side negates, the other does not.
            let negation_differs = NEGATION_WORDS
                .iter()
                .any(|neg| text_1.contains(neg) != text_2.contains(neg));
            if !negation_differs {
                continue;
            }

            if sequence_ratio(&text_1, &text_2) > CONTRADICTION_THRESHOLD {
                contradictions.push(Contradiction {
                    finding_1: merged[i].finding.point.clone(),
                    finding_2: merged[j].finding.point.clone(),
                    sources_1: merged[i].sources.clone(),
                    sources_2: merged[j].sources.clone(),
                    severity: "medium".to_string(),
                });
            }
        }
    }

    contradictions
}

// ---------------------------------------------------------------------------
// Termination markers
// ---------------------------------------------------------------------------

/// Marker kinds recognised in model responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalMarkerType {
    /// `FINAL(json)`: inline final answer.
    Final,
    /// `FINAL_VAR(name)`: answer stored in a named buffer.
    FinalVar,
    /// `NEEDS_MORE("reason")`: more context required.
    NeedsMore,
    /// `UNABLE("reason")`: the model gave up.
    Unable,
}

/// A parsed termination marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFinalMarker {
    /// Marker kind.
    pub marker_type: FinalMarkerType,
    /// Raw payload between the parentheses (quotes stripped for the
    /// reason-style markers).
    pub payload: String,
}

/// Resolution of a response's termination marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalAnswer {
    /// A final answer was produced.
    Answer(String),
    /// More context was requested.
    NeedsMore(String),
    /// The model declared the task impossible.
    Unable(String),
    /// `FINAL_VAR` named an unknown variable.
    VarError(String),
}

/// Parses the first termination marker in a response, if any.
///
/// Only the first marker counts; anything after it is ignored.
#[must_use]
pub fn parse_final_markers(response: &str) -> Option<ParsedFinalMarker> {
    // FINAL_VAR before FINAL: the latter is a prefix of the former.
    const MARKERS: &[(&str, FinalMarkerType)] = &[
        ("FINAL_VAR(", FinalMarkerType::FinalVar),
        ("FINAL(", FinalMarkerType::Final),
        ("NEEDS_MORE(", FinalMarkerType::NeedsMore),
        ("UNABLE(", FinalMarkerType::Unable),
    ];

    let mut first: Option<(usize, &str, FinalMarkerType)> = None;
    for (opener, marker_type) in MARKERS {
        if let Some(idx) = response.find(opener) {
            // FINAL( matches inside FINAL_VAR(; skip overlapping hits.
            let overlapped = first.is_some_and(|(prev_idx, prev_opener, _)| {
                idx >= prev_idx && idx < prev_idx + prev_opener.len()
            });
            if !overlapped && first.is_none_or(|(prev_idx, _, _)| idx < prev_idx) {
                first = Some((idx, opener, *marker_type));
            }
        }
    }

    let (idx, opener, marker_type) = first?;
    let body_start = idx + opener.len();
    let payload = scan_balanced(&response[body_start..])?;

    let payload = match marker_type {
        FinalMarkerType::Final => payload.trim().to_string(),
        _ => payload.trim().trim_matches(['"', '\'']).to_string(),
    };

    Some(ParsedFinalMarker {
        marker_type,
        payload,
    })
}

/// Whether the response carries any termination marker.
#[must_use]
pub fn has_final_marker(response: &str) -> bool {
    parse_final_markers(response).is_some()
}

/// Resolves a response's marker into a final answer.
///
/// `lookup` resolves `FINAL_VAR` names (typically against the session's
/// buffers); unknown names produce [`FinalAnswer::VarError`].
#[must_use]
pub fn extract_final_answer(
    response: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Option<FinalAnswer> {
    let marker = parse_final_markers(response)?;
    Some(match marker.marker_type {
        FinalMarkerType::Final => FinalAnswer::Answer(marker.payload),
        FinalMarkerType::FinalVar => lookup(&marker.payload).map_or_else(
            || FinalAnswer::VarError(format!("final_var_error: unknown variable {:?}", marker.payload)),
            FinalAnswer::Answer,
        ),
        FinalMarkerType::NeedsMore => FinalAnswer::NeedsMore(marker.payload),
        FinalMarkerType::Unable => FinalAnswer::Unable(marker.payload),
    })
}

/// Scans up to the parenthesis that balances the already-consumed
/// opener, returning the contents.
fn scan_balanced(rest: &str) -> Option<String> {
    let mut depth = 1usize;
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    let mut out = String::new();

    for c in rest.chars() {
        if let Some(quote) = in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                in_string = Some(c);
                out.push(c);
            }
            '(' => {
                depth += 1;
                out.push(c);
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(out);
                }
                out.push(c);
            }
            other => out.push(other),
        }
    }
    None
}
