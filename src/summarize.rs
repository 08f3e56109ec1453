use crate::config::Summarize;
use crate::error::OcrError;
use crate::worker::OcrWorker;
use tracing::{debug, info};

/// Fixed heuristic: characters divided by a constant ratio.
pub fn estimate_tokens(text: &str, chars_per_token: u32) -> u32 {
    (text.chars().count() as u32).div_ceil(chars_per_token.max(1))
}

/// Split `text` into sequential chunks of at most `budget_chars` characters,
/// breaking at the nearest preceding line boundary when one exists inside the
/// chunk. The ranges are byte ranges, contiguous, and cover the whole text.
pub fn plan_chunks(text: &str, budget_chars: usize) -> Vec<std::ops::Range<usize>> {
    let budget = budget_chars.max(1);
    let mut ranges = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let remaining = &text[start..];
        let mut take = 0;
        for (offset, ch) in remaining.char_indices().take(budget) {
            take = offset + ch.len_utf8();
        }
        let mut end = start + take;

        if end < text.len() {
            // Prefer the last line boundary inside the chunk over a
            // mid-line cut.
            if let Some(pos) = text[start..end].rfind('\n') {
                if pos > 0 {
                    end = start + pos + 1;
                }
            }
        }

        ranges.push(start..end);
        start = end;
    }

    ranges
}

/// What the summarizer produced. `chunk_count` is 1 for an under-budget
/// corpus.
#[derive(Debug, Clone)]
pub struct SummaryOutput {
    pub summary: String,
    pub chunk_count: u32,
}

/// A chunk failed mid-sequence. Summaries completed before the failure are
/// preserved so the caller can still surface them.
#[derive(Debug)]
pub struct SummarizeAbort {
    pub completed: Vec<String>,
    pub error: OcrError,
}

/// Summarize a corpus, chunking it when the estimated token count exceeds
/// the budget. Chunks are requested strictly in order; a later chunk is not
/// sent until the previous one returned.
pub async fn summarize<W: OcrWorker>(
    cfg: &Summarize,
    worker: &W,
    corpus: &str,
    prompt: &str,
    language: &str,
) -> Result<SummaryOutput, SummarizeAbort> {
    let estimated = estimate_tokens(corpus, cfg.chars_per_token);

    if estimated <= cfg.token_budget {
        debug!(estimated, "corpus fits in one summarization request");
        let full_prompt = build_prompt(prompt, language, corpus, None);
        let summary = worker
            .summarize(corpus, &full_prompt)
            .await
            .map_err(|e| SummarizeAbort {
                completed: Vec::new(),
                error: OcrError::SummarizationChunkFailure {
                    chunk_index: 0,
                    message: e.to_string(),
                },
            })?;
        return Ok(SummaryOutput {
            summary,
            chunk_count: 1,
        });
    }

    let budget_chars = (cfg.token_budget as usize) * (cfg.chars_per_token.max(1) as usize);
    let ranges = plan_chunks(corpus, budget_chars);
    let total = ranges.len();
    info!(estimated, chunks = total, "corpus over budget; summarizing progressively");

    let mut completed: Vec<String> = Vec::with_capacity(total);
    for (index, range) in ranges.into_iter().enumerate() {
        let chunk = &corpus[range];
        let full_prompt = build_prompt(prompt, language, chunk, Some((index + 1, total)));
        match worker.summarize(chunk, &full_prompt).await {
            Ok(summary) => {
                debug!(chunk = index + 1, total, "chunk summarized");
                completed.push(summary);
            }
            Err(e) => {
                return Err(SummarizeAbort {
                    completed,
                    error: OcrError::SummarizationChunkFailure {
                        chunk_index: index as u32,
                        message: e.to_string(),
                    },
                });
            }
        }
    }

    Ok(SummaryOutput {
        summary: completed.join("\n\n"),
        chunk_count: total as u32,
    })
}

/// Outbound prompt: the caller's prompt plus a language instruction and, for
/// chunked runs, a progressive-part header.
pub fn build_prompt(
    base: &str,
    language: &str,
    text: &str,
    part: Option<(usize, usize)>,
) -> String {
    let mut prompt = base.to_string();

    match language.trim().to_ascii_lowercase().as_str() {
        "hebrew" | "heb" | "he" => {
            prompt.push_str("\nPlease ensure the summary is in Hebrew.");
        }
        "english" | "eng" | "en" => {
            prompt.push_str("\nPlease ensure the summary is in English.");
        }
        _ => {
            prompt.push_str("\nPlease write the summary in the dominant language of the text.");
        }
    }

    if has_hebrew(text) {
        prompt.push_str(
            "\nThe text contains Hebrew content. Please maintain proper Hebrew formatting and terminology.",
        );
    }

    if let Some((k, n)) = part {
        prompt.push_str(&format!(
            "\nThis is part {k} of {n} of a longer document; summarize this part on its own."
        ));
    }

    prompt
}

fn has_hebrew(text: &str) -> bool {
    text.chars().any(|ch| ('\u{0590}'..='\u{05FF}').contains(&ch))
}
