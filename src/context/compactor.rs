//! Fits collected blocks into a token target
//!
//! Non-compressible blocks are kept byte-identical or dropped whole, lowest
//! priority first. Compressible blocks are visited by priority: blocks that
//! fit are kept verbatim, the first one that doesn't is rewritten into the
//! remaining budget, and once nothing is left the rest are dropped.
//!
//! Rewriting escalates by level:
//! - LIGHT: whitespace normalization, then truncation
//! - MEDIUM: summarizer, falling back to LIGHT
//! - AGGRESSIVE: summarizer, then hard truncation of its output

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::accountant::TokenAccountant;
use super::models::{total_tokens, ContextBlock};
use super::summarizer::Summarizer;
use crate::metrics::METRICS;

/// Marker appended to truncated content
pub const ELLIPSIS: &str = "...";

/// How hard the compactor may rewrite a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionLevel {
    None,
    Light,
    Medium,
    Aggressive,
}

/// Level implied by the fill ratio `total / budget`
pub fn get_compaction_level(total_tokens: usize, budget: usize) -> CompactionLevel {
    if budget == 0 {
        return CompactionLevel::Aggressive;
    }
    let ratio = total_tokens as f64 / budget as f64;
    if ratio < 0.7 {
        CompactionLevel::None
    } else if ratio < 0.85 {
        CompactionLevel::Light
    } else if ratio < 0.95 {
        CompactionLevel::Medium
    } else {
        CompactionLevel::Aggressive
    }
}

/// What one compaction pass did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub level: CompactionLevel,
    pub input_tokens: usize,
    pub output_tokens: usize,
    /// Blocks removed entirely
    pub dropped: usize,
    pub truncated: usize,
    pub summarized: usize,
    pub normalized: usize,
}

impl CompactionReport {
    fn untouched(tokens: usize) -> Self {
        Self {
            level: CompactionLevel::None,
            input_tokens: tokens,
            output_tokens: tokens,
            dropped: 0,
            truncated: 0,
            summarized: 0,
            normalized: 0,
        }
    }

    pub fn changed_anything(&self) -> bool {
        self.dropped + self.truncated + self.summarized + self.normalized > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rewrite {
    Normalized,
    Summarized,
    Truncated,
}

impl Rewrite {
    fn as_str(self) -> &'static str {
        match self {
            Rewrite::Normalized => "normalized",
            Rewrite::Summarized => "summarized",
            Rewrite::Truncated => "truncated",
        }
    }
}

/// Collapse space/tab runs, trim lines, and squeeze blank-line runs
pub fn normalize_whitespace(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut in_blank_run = false;

    for line in text.lines() {
        let collapsed = line
            .split(|c| c == ' ' || c == '\t')
            .filter(|word| !word.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        if collapsed.is_empty() {
            if !in_blank_run && !lines.is_empty() {
                lines.push(String::new());
            }
            in_blank_run = true;
        } else {
            lines.push(collapsed);
            in_blank_run = false;
        }
    }

    while lines.last().map_or(false, |line| line.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Context compactor
pub struct ContextCompactor {
    accountant: Arc<TokenAccountant>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl ContextCompactor {
    pub fn new(accountant: Arc<TokenAccountant>) -> Self {
        Self {
            accountant,
            summarizer: None,
        }
    }

    /// Enable MEDIUM/AGGRESSIVE summarization
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Fit `blocks` into `target_tokens`
    pub async fn compact(
        &self,
        blocks: &[ContextBlock],
        target_tokens: usize,
    ) -> Vec<ContextBlock> {
        self.compact_with_report(blocks, target_tokens).await.0
    }

    /// Fit `blocks` into `target_tokens` at the level implied by the overflow
    pub async fn compact_with_report(
        &self,
        blocks: &[ContextBlock],
        target_tokens: usize,
    ) -> (Vec<ContextBlock>, CompactionReport) {
        let input_tokens = total_tokens(blocks);
        let level = get_compaction_level(input_tokens, target_tokens).max(CompactionLevel::Light);
        self.compact_at_level(blocks, target_tokens, level).await
    }

    /// Fit `blocks` into `target_tokens`, rewriting at most at `level`
    ///
    /// `CompactionLevel::None` never rewrites content; blocks that don't fit
    /// verbatim are dropped.
    pub async fn compact_at_level(
        &self,
        blocks: &[ContextBlock],
        target_tokens: usize,
        level: CompactionLevel,
    ) -> (Vec<ContextBlock>, CompactionReport) {
        let input_tokens = total_tokens(blocks);
        if input_tokens <= target_tokens {
            return (blocks.to_vec(), CompactionReport::untouched(input_tokens));
        }

        let mut report = CompactionReport {
            level,
            ..CompactionReport::untouched(input_tokens)
        };
        let mut kept: Vec<Option<ContextBlock>> = vec![None; blocks.len()];

        let (mut fixed, mut flexible): (Vec<usize>, Vec<usize>) =
            (0..blocks.len()).partition(|&i| !blocks[i].is_compressible());
        fixed.sort_by(|&a, &b| blocks[b].priority().total_cmp(&blocks[a].priority()));
        flexible.sort_by(|&a, &b| blocks[b].priority().total_cmp(&blocks[a].priority()));

        let mut fixed_tokens: usize = fixed.iter().map(|&i| blocks[i].token_count()).sum();
        let mut fixed_dropped = false;
        while fixed_tokens > target_tokens {
            let Some(i) = fixed.pop() else { break };
            fixed_tokens -= blocks[i].token_count();
            report.dropped += 1;
            fixed_dropped = true;
            warn!(
                "Dropped non-compressible block from {} ({} tokens, priority {})",
                blocks[i].source(),
                blocks[i].token_count(),
                blocks[i].priority()
            );
        }
        for &i in &fixed {
            kept[i] = Some(blocks[i].clone());
        }

        if fixed_dropped {
            report.dropped += flexible.len();
        } else {
            let mut remaining = target_tokens - fixed_tokens;
            for &i in &flexible {
                let block = &blocks[i];
                if remaining == 0 {
                    report.dropped += 1;
                    continue;
                }
                if block.token_count() <= remaining {
                    remaining -= block.token_count();
                    kept[i] = Some(block.clone());
                    continue;
                }

                match self.rewrite(block, remaining, level).await {
                    Some((rewritten, how)) => {
                        match how {
                            Rewrite::Normalized => report.normalized += 1,
                            Rewrite::Summarized => report.summarized += 1,
                            Rewrite::Truncated => report.truncated += 1,
                        }
                        remaining -= rewritten.token_count();
                        kept[i] = Some(rewritten);
                    }
                    None => {
                        debug!(
                            "Block from {} does not fit {} tokens, dropped",
                            block.source(),
                            remaining
                        );
                        report.dropped += 1;
                    }
                }
            }
        }

        let output: Vec<ContextBlock> = kept.into_iter().flatten().collect();
        report.output_tokens = total_tokens(&output);

        METRICS.record_compaction(report.dropped, report.truncated, report.summarized);
        info!(
            input_tokens = report.input_tokens,
            output_tokens = report.output_tokens,
            target_tokens,
            ?level,
            dropped = report.dropped,
            truncated = report.truncated,
            summarized = report.summarized,
            normalized = report.normalized,
            "Context compacted"
        );

        (output, report)
    }

    /// Rewrite one block to fit `allotted` tokens, or `None` to drop it
    async fn rewrite(
        &self,
        block: &ContextBlock,
        allotted: usize,
        level: CompactionLevel,
    ) -> Option<(ContextBlock, Rewrite)> {
        let (content, how) = match level {
            CompactionLevel::None => return None,
            CompactionLevel::Light => self.light(block.content(), allotted)?,
            CompactionLevel::Medium | CompactionLevel::Aggressive => {
                match self.summarize(block.content(), allotted).await {
                    Some(summary) => {
                        if self.accountant.count_framed(&summary) <= allotted {
                            (summary, Rewrite::Summarized)
                        } else if level == CompactionLevel::Medium {
                            self.light(&summary, allotted)?
                        } else {
                            (self.truncate(&summary, allotted)?, Rewrite::Truncated)
                        }
                    }
                    None => self.light(block.content(), allotted)?,
                }
            }
        };

        let tokens = self.accountant.count_framed(&content);
        let rewritten = block
            .with_content(content, tokens)
            .with_metadata("compaction", how.as_str())
            .with_metadata("original_tokens", block.token_count());
        Some((rewritten, how))
    }

    fn light(&self, content: &str, allotted: usize) -> Option<(String, Rewrite)> {
        let normalized = normalize_whitespace(content);
        if !normalized.is_empty() && self.accountant.count_framed(&normalized) <= allotted {
            return Some((normalized, Rewrite::Normalized));
        }
        self.truncate(&normalized, allotted)
            .map(|text| (text, Rewrite::Truncated))
    }

    async fn summarize(&self, content: &str, allotted: usize) -> Option<String> {
        let summarizer = self.summarizer.as_ref()?;
        let max_tokens = allotted.saturating_sub(self.accountant.message_overhead());
        if max_tokens == 0 {
            return None;
        }

        match summarizer.summarize(&[content.to_string()], max_tokens).await {
            Ok(summary) if !summary.trim().is_empty() => Some(summary),
            Ok(_) => {
                warn!("Summarizer returned nothing, falling back to normalization");
                None
            }
            Err(e) => {
                warn!("Summarizer failed, falling back to normalization: {}", e);
                None
            }
        }
    }

    /// Longest char prefix such that `prefix + "..."` fits `allotted` framed tokens
    ///
    /// Binary search over prefix length keeps tokenizer calls logarithmic.
    fn truncate(&self, content: &str, allotted: usize) -> Option<String> {
        if allotted == 0 {
            return None;
        }
        let ends: Vec<usize> = content
            .char_indices()
            .map(|(i, c)| i + c.len_utf8())
            .collect();

        let candidate = |len: usize| format!("{}{}", &content[..ends[len - 1]], ELLIPSIS);

        let (mut lo, mut hi) = (1usize, ends.len());
        let mut best = None;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            if self.accountant.count_framed(&candidate(mid)) <= allotted {
                best = Some(mid);
                lo = mid + 1;
            } else {
                hi = mid - 1;
            }
        }

        best.map(candidate)
    }
}
