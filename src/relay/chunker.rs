//! Splits finished output into pieces a Discord message can carry.

use super::Artifact;

/// Discord allows 2000 characters per message; captions need some headroom.
pub const DEFAULT_MAX_CHARS: usize = 1900;
/// Images per delivered message.
pub const DEFAULT_MAX_PER_GROUP: usize = 4;
/// How much of a prompt is quoted back in headers and captions.
pub const PROMPT_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    pub max_per_group: usize,
    pub max_chars: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_per_group: DEFAULT_MAX_PER_GROUP,
            max_chars: DEFAULT_MAX_CHARS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkContent {
    Text(String),
    Artifacts(Vec<Artifact>),
}

/// One deliverable unit: a slice of text or a group of artifacts.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub content: ChunkContent,
    pub caption: String,
}

/// Splits `text` into contiguous pieces of at most `max_chars` characters.
///
/// Counts `char`s, so a multi-byte code point is never cut in half. Empty
/// input yields no pieces.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut pieces = Vec::new();
    let mut iter = text.chars();
    let mut pos = 0;

    while pos < text.len() {
        let mut len = 0;
        for ch in iter.by_ref().take(max_chars) {
            len += ch.len_utf8();
        }
        pieces.push(text[pos..pos + len].to_string());
        pos += len;
    }

    pieces
}

/// The first `max_chars` characters of `text`, with an ellipsis when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some(_) => {
            let kept: String = text.chars().take(max_chars.saturating_sub(1)).collect();
            format!("{}…", kept.trim_end())
        }
    }
}

/// Groups artifacts into windows of at most `max_per_group`, keeping order.
pub fn group_artifacts(artifacts: Vec<Artifact>, max_per_group: usize) -> Vec<Vec<Artifact>> {
    let max_per_group = max_per_group.max(1);
    let mut groups = Vec::with_capacity(artifacts.len().div_ceil(max_per_group));
    let mut current = Vec::with_capacity(max_per_group);

    for artifact in artifacts {
        current.push(artifact);
        if current.len() == max_per_group {
            groups.push(std::mem::replace(
                &mut current,
                Vec::with_capacity(max_per_group),
            ));
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }

    groups
}

/// Turns accumulated text and artifacts into ordered output chunks.
///
/// Text chunks come first, then artifact groups, each tagged with `caption`.
/// Nothing to deliver means zero chunks.
pub fn chunk(
    text: &str,
    artifacts: Vec<Artifact>,
    limits: ChunkLimits,
    caption: &str,
) -> Vec<OutputChunk> {
    let text_chunks = split_text(text, limits.max_chars)
        .into_iter()
        .map(|piece| OutputChunk {
            content: ChunkContent::Text(piece),
            caption: caption.to_string(),
        });

    let artifact_chunks = group_artifacts(artifacts, limits.max_per_group)
        .into_iter()
        .map(|group| OutputChunk {
            content: ChunkContent::Artifacts(group),
            caption: caption.to_string(),
        });

    text_chunks.chain(artifact_chunks).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake::Fake;
    use fake::faker::lorem::en::Paragraphs;
    use test_case::test_case;

    fn images(count: usize) -> Vec<Artifact> {
        (0..count).map(|i| Artifact::image(i, vec![i as u8])).collect()
    }

    #[test_case("a castle", 10 => "a castle" ; "short text is untouched")]
    #[test_case("0123456789", 10 => "0123456789" ; "exact fit is untouched")]
    #[test_case("0123456789a", 10 => "012345678…" ; "long text is cut")]
    #[test_case("héllo wörld", 7 => "héllo…" ; "cut counts characters")]
    fn excerpts(text: &str, max_chars: usize) -> String {
        excerpt(text, max_chars)
    }

    #[test]
    fn splits_long_text_at_the_character_limit() {
        let text = "x".repeat(4500);

        let pieces = split_text(&text, 1900);

        let lengths: Vec<usize> = pieces.iter().map(|p| p.chars().count()).collect();
        assert_eq!(lengths, vec![1900, 1900, 700]);
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn never_splits_inside_a_code_point() {
        let text = "héllo wörld 🦀🦀🦀";

        let pieces = split_text(text, 4);

        assert!(pieces.iter().all(|p| p.chars().count() <= 4));
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn generated_paragraphs_survive_a_round_trip() {
        let paragraphs: Vec<String> = Paragraphs(3..8).fake();
        let text = paragraphs.join("\n\n");

        let pieces = split_text(&text, 97);

        assert_eq!(pieces.concat(), text);
        assert!(pieces[..pieces.len() - 1]
            .iter()
            .all(|p| p.chars().count() == 97));
    }

    #[test_case(10, 4 => vec![4, 4, 2] ; "ten by four")]
    #[test_case(8, 4 => vec![4, 4] ; "exact multiple")]
    #[test_case(3, 4 => vec![3] ; "single short group")]
    #[test_case(0, 4 => Vec::<usize>::new() ; "empty")]
    #[test_case(2, 0 => vec![1, 1] ; "zero limit treated as one")]
    fn group_sizes(count: usize, max_per_group: usize) -> Vec<usize> {
        group_artifacts(images(count), max_per_group)
            .iter()
            .map(Vec::len)
            .collect()
    }

    #[test]
    fn groups_preserve_original_order() {
        let groups = group_artifacts(images(10), 4);

        let order: Vec<usize> = groups.iter().flatten().map(|a| a.index).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn empty_output_yields_no_chunks() {
        assert!(chunk("", Vec::new(), ChunkLimits::default(), "caption").is_empty());
    }

    #[test]
    fn text_chunks_precede_artifact_groups() {
        let limits = ChunkLimits {
            max_per_group: 2,
            max_chars: 5,
        };

        let chunks = chunk("hello world", images(3), limits, "Results for: cats");

        let kinds: Vec<&str> = chunks
            .iter()
            .map(|c| match &c.content {
                ChunkContent::Text(_) => "text",
                ChunkContent::Artifacts(_) => "artifacts",
            })
            .collect();
        assert_eq!(kinds, vec!["text", "text", "text", "artifacts", "artifacts"]);
        assert!(chunks.iter().all(|c| c.caption == "Results for: cats"));
    }
}
