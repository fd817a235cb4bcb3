//! Token and cost estimation.
//!
//! Token counts are heuristics (about four characters per token) used for
//! compaction and truncation decisions; they never replace the usage the
//! provider reports.  Images are weighted by pixel area, which needs the
//! image dimensions, so base64 payloads get their header decoded.

use std::io::Cursor;

use base64::Engine;

use crate::config::ModelPricing;
use crate::cost::CostEstimate;
use crate::stream::Usage;
use crate::tool::{ContentBlock, ImageSource, Message, ToolResultContent};

const CHARS_PER_TOKEN: u64 = 4;

/// Pixels per image token.
const PIXELS_PER_TOKEN: u64 = 750;

/// Upper bound for a single image, also used when dimensions are unknown.
pub const IMAGE_TOKEN_CAP: u64 = 1600;

/// Base64 characters decoded when probing image dimensions.  Large enough
/// to reach the frame header of JPEGs carrying EXIF blocks.
const HEADER_PROBE_CHARS: usize = 256 * 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tokens
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn estimate_text_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(CHARS_PER_TOKEN)
}

/// Decode width and height from the start of a base64 image payload.
pub fn image_dimensions(base64_data: &str) -> Option<(u32, u32)> {
    let mut end = base64_data.len().min(HEADER_PROBE_CHARS);
    end -= end % 4;
    let prefix = base64_data.get(..end)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(prefix)
        .ok()?;
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

pub fn estimate_image_tokens(source: &ImageSource) -> u64 {
    match source {
        ImageSource::Base64 { data, .. } => match image_dimensions(data) {
            Some((w, h)) => {
                let tokens = (u64::from(w) * u64::from(h)).div_ceil(PIXELS_PER_TOKEN);
                tokens.clamp(1, IMAGE_TOKEN_CAP)
            }
            None => IMAGE_TOKEN_CAP,
        },
        ImageSource::Url { .. } => IMAGE_TOKEN_CAP,
    }
}

pub fn estimate_block_tokens(block: &ContentBlock) -> u64 {
    match block {
        ContentBlock::Text { text } => estimate_text_tokens(text),
        ContentBlock::Image { source } => estimate_image_tokens(source),
        ContentBlock::ToolUse { name, input, .. } => {
            estimate_text_tokens(name) + estimate_text_tokens(&input.to_string())
        }
        ContentBlock::ToolResult { content, .. } => match content {
            ToolResultContent::Text(t) => estimate_text_tokens(t),
            ToolResultContent::Blocks(blocks) => blocks.iter().map(estimate_block_tokens).sum(),
        },
    }
}

pub fn estimate_message_tokens(message: &Message) -> u64 {
    message.content.iter().map(estimate_block_tokens).sum()
}

pub fn estimate_messages_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message_tokens).sum()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cost
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dollar estimate for `usage` under `pricing`.
///
/// The optimistic figure bills cache reads and writes at their own rates.
/// The pessimistic figure assumes no cache hits: cache reads are billed at
/// the input rate and cache writes at the higher of the write and input
/// rates.  Unknown models cost nothing.
pub fn estimate_cost(usage: &Usage, pricing: Option<&ModelPricing>) -> CostEstimate {
    let Some(p) = pricing else {
        if !usage.is_empty() {
            tracing::debug!("no pricing configured for model, cost recorded as zero");
        }
        return CostEstimate::default();
    };

    let read_rate = p.cache_read_per_1m.unwrap_or(p.input_per_1m);
    let write_rate = p.cache_write_per_1m.unwrap_or(p.input_per_1m);
    let per = |tokens: u64, rate: f64| tokens as f64 * rate / 1_000_000.0;

    let base = per(usage.input_tokens, p.input_per_1m) + per(usage.output_tokens, p.output_per_1m);
    CostEstimate {
        optimistic: base
            + per(usage.cache_read_tokens, read_rate)
            + per(usage.cache_write_tokens, write_rate),
        pessimistic: base
            + per(usage.cache_read_tokens, p.input_per_1m)
            + per(usage.cache_write_tokens, write_rate.max(p.input_per_1m)),
    }
}
