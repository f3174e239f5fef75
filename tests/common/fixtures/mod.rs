//! Sample prompts and payloads used across the tests

use fake::Fake;
use fake::faker::lorem::en::Sentence;

use genrelay::relay::Artifact;

/// Prompt used where the exact text does not matter.
pub const SAMPLE_PROMPT: &str = "a lighthouse on a cliff at dusk, oil painting";

/// The eight-byte PNG signature followed by a marker byte.
pub fn png_bytes(marker: u8) -> Vec<u8> {
    vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, marker]
}

/// Image artifacts for the given batch positions, in the order given.
pub fn images(indexes: &[usize]) -> Vec<Artifact> {
    indexes
        .iter()
        .map(|&index| Artifact::image(index, png_bytes(index as u8)))
        .collect()
}

/// A random, non-empty prompt.
pub fn random_prompt() -> String {
    Sentence(3..10).fake()
}
