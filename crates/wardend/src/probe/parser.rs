//! Extraction of per-node exclusions from engine check output.

use once_cell::sync::Lazy;
use regex::Regex;

/// One node the engine rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    /// An outbound addressed by its position in the rendered outbound list.
    Index {
        /// Position in the outbound list, system outbounds included.
        index: usize,
        /// Engine message following the index.
        message: String,
    },
    /// An outbound whose tag collides with another one.
    DuplicateTag {
        /// Offending tag.
        tag: String,
    },
}

impl Exclusion {
    /// Human readable reason for the exclusion.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::Index { message, .. } => message.clone(),
            Self::DuplicateTag { tag } => format!("duplicate tag {tag}"),
        }
    }
}

/// Turns engine output into exclusions.
pub trait ErrorParser: Send + Sync {
    /// Parses every exclusion found in `output`.
    fn parse(&self, output: &str) -> Vec<Exclusion>;
}

static OUTBOUND_INDEX: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"outbounds?\[(\d+)\]").ok());

static DUPLICATE_TAG: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"duplicate (?:outbound(?:/endpoint)? )?tag:?\s*([^\s,;]+)").ok()
});

/// Parser for the error text of `<engine> check`.
///
/// Recognises `outbounds[N]...` and `initialize outbound[N]: ...` errors, and
/// `duplicate outbound/endpoint tag: X` errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineErrorParser;

impl ErrorParser for EngineErrorParser {
    fn parse(&self, output: &str) -> Vec<Exclusion> {
        let mut exclusions = Vec::new();
        for line in output.lines() {
            if let Some(pattern) = OUTBOUND_INDEX.as_ref() {
                exclusions.extend(index_exclusions(pattern, line));
            }
            if let Some(captures) = DUPLICATE_TAG.as_ref().and_then(|re| re.captures(line))
                && let Some(tag) = captures.get(1)
            {
                exclusions.push(Exclusion::DuplicateTag {
                    tag: tag.as_str().to_owned(),
                });
            }
        }
        exclusions
    }
}

fn index_exclusions<'a>(
    pattern: &'a Regex,
    line: &'a str,
) -> impl Iterator<Item = Exclusion> + 'a {
    pattern.captures_iter(line).filter_map(move |captures| {
        let whole = captures.get(0)?;
        let index = captures.get(1)?.as_str().parse().ok()?;
        let rest = line.get(whole.end()..).unwrap_or_default();
        let message = rest.trim_start_matches(['.', ':', ' ']).trim();
        let message = if message.is_empty() {
            line.trim().to_owned()
        } else {
            message.to_owned()
        };
        Some(Exclusion::Index { index, message })
    })
}
