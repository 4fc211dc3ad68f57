//! Sentence-aware text splitting for synthesis requests.
//!
//! Providers cap the input of a single speech request, so long answers are
//! cut into chunks of at most `max_chars` characters. A cut prefers the last
//! sentence end (`.`, `!`, `?`, keeping a closing `"`) within `lookback`
//! characters of the limit, then the last space in that window, then a hard
//! cut at the limit. Bisecting a chunk that the provider still rejected
//! looks for the boundary nearest to its midpoint instead.
//!
//! Lengths are counted in `char`s, never bytes, so multi-byte text is never
//! split inside a code point.

/// Provider limit for one speech request.
pub const MAX_CHUNK_CHARS: usize = 4096;
/// How far back from the limit a boundary is searched for.
pub const LOOKBACK_CHARS: usize = 500;

const SENTENCE_ENDINGS: [char; 3] = ['.', '!', '?'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSplitter {
    max_chars: usize,
    lookback: usize,
}

impl Default for ChunkSplitter {
    fn default() -> Self {
        Self::new(MAX_CHUNK_CHARS, LOOKBACK_CHARS)
    }
}

impl ChunkSplitter {
    pub fn new(max_chars: usize, lookback: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
            lookback,
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Split `text` into chunks of at most `max_chars` characters.
    ///
    /// Text that already fits is returned as exactly one chunk, unchanged.
    /// Otherwise each chunk is trimmed at its end, the remainder is trimmed at
    /// its start, and blank chunks are dropped.
    pub fn split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= self.max_chars {
            return vec![text.to_string()];
        }

        let mut chunks = Vec::new();
        let mut rest: &[char] = &chars;

        while !rest.is_empty() {
            if rest.len() <= self.max_chars {
                chunks.push(rest.iter().collect::<String>());
                break;
            }
            let cut = self
                .find_boundary(rest, self.max_chars)
                .unwrap_or(self.max_chars);
            let (head, tail) = rest.split_at(cut);
            chunks.push(trim_end(head).iter().collect::<String>());
            rest = trim_start(tail);
        }

        chunks.retain(|c| !c.trim().is_empty());
        chunks
    }

    /// Cut one chunk into two halves near its midpoint.
    ///
    /// Picks the sentence end closest to the midpoint within `lookback`
    /// characters of it, then the closest space, then the midpoint itself.
    /// Blank halves are dropped, so the result has zero to two entries.
    pub fn bisect(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();
        if len < 2 {
            return [text.to_string()]
                .into_iter()
                .filter(|s| !s.trim().is_empty())
                .collect();
        }

        let mid = len / 2;
        let cut = self.nearest_boundary(&chars, mid).unwrap_or(mid);

        let (head, tail) = chars.split_at(cut);
        [trim_end(head), trim_start(tail)]
            .into_iter()
            .filter(|half| half.iter().any(|c| !c.is_whitespace()))
            .map(|half| half.iter().collect())
            .collect()
    }

    /// Index just past the best boundary before `limit`, if any.
    fn find_boundary(&self, chars: &[char], limit: usize) -> Option<usize> {
        let limit = limit.min(chars.len());
        let start = limit.saturating_sub(self.lookback);
        let window = start..limit;

        let sentence_end = window
            .clone()
            .rev()
            .find(|&i| SENTENCE_ENDINGS.contains(&chars[i]));
        if let Some(i) = sentence_end {
            let next = i + 1;
            if chars.get(next) == Some(&'"') {
                return Some(next + 1);
            }
            return Some(next);
        }

        window.rev().find(|&i| chars[i] == ' ').map(|i| i + 1)
    }

    /// Boundary closest to `target`, strictly inside the text.
    fn nearest_boundary(&self, chars: &[char], target: usize) -> Option<usize> {
        let len = chars.len();
        let lo = target.saturating_sub(self.lookback);
        let hi = (target + self.lookback).min(len);

        let closest = |cuts: Vec<usize>| {
            cuts.into_iter()
                .filter(|&c| c > 0 && c < len)
                .min_by_key(|&c| c.abs_diff(target))
        };

        let sentence_cuts = (lo..hi)
            .filter(|&i| SENTENCE_ENDINGS.contains(&chars[i]))
            .map(|i| if chars.get(i + 1) == Some(&'"') { i + 2 } else { i + 1 })
            .collect();
        closest(sentence_cuts).or_else(|| {
            let space_cuts = (lo..hi).filter(|&i| chars[i] == ' ').map(|i| i + 1).collect();
            closest(space_cuts)
        })
    }
}

fn trim_end(chars: &[char]) -> &[char] {
    let end = chars
        .iter()
        .rposition(|c| !c.is_whitespace())
        .map_or(0, |i| i + 1);
    &chars[..end]
}

fn trim_start(chars: &[char]) -> &[char] {
    let start = chars
        .iter()
        .position(|c| !c.is_whitespace())
        .unwrap_or(chars.len());
    &chars[start..]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn without_whitespace(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    #[test]
    fn short_text_is_one_chunk() {
        let splitter = ChunkSplitter::default();
        assert_eq!(splitter.split("Hello there."), vec!["Hello there."]);
        assert_eq!(splitter.split(""), vec![""]);

        let exactly_max = "a".repeat(MAX_CHUNK_CHARS);
        assert_eq!(splitter.split(&exactly_max).len(), 1);
    }

    #[test]
    fn no_punctuation_splits_on_whitespace_into_three_chunks() {
        let text = "abcd ".repeat(1800);
        assert_eq!(text.chars().count(), 9000);

        let chunks = ChunkSplitter::default().split(&text);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= MAX_CHUNK_CHARS));
        assert!(chunks[0].ends_with("abcd"));
        assert_eq!(chunks.join(" "), text);
    }

    #[test]
    fn prefers_sentence_endings() {
        let text: String = (0..400)
            .map(|i| format!("This is sentence number {i}. "))
            .collect();
        let chunks = ChunkSplitter::default().split(&text);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= MAX_CHUNK_CHARS);
            assert!(chunk.trim_end().ends_with('.'), "chunk ended with {:?}", chunk.chars().last());
        }
        assert_eq!(without_whitespace(&chunks.concat()), without_whitespace(&text));
    }

    #[test]
    fn closing_quote_stays_with_its_sentence() {
        let splitter = ChunkSplitter::new(16, 10);
        let chunks = splitter.split("Say \"hi.\" then go home now");
        assert_eq!(chunks, vec!["Say \"hi.\"", "then go home now"]);
    }

    #[test]
    fn hard_cut_without_any_boundary() {
        let splitter = ChunkSplitter::new(20, 5);
        let chunks = splitter.split(&"x".repeat(50));
        let lens: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(lens, vec![20, 20, 10]);
    }

    #[test]
    fn concatenation_reproduces_input() {
        let splitter = ChunkSplitter::new(40, 15);
        let inputs = [
            "One. Two! Three? Four five six seven eight nine ten eleven twelve.".to_string(),
            "word ".repeat(61),
            "ünïcödé täxt wïth áccents änd sömé mörë wörds tö spliт. ".repeat(7),
            "no-spaces-".repeat(17),
            "Mixed\nnew lines\n\nand   runs of   spaces. Then more! ".repeat(5),
        ];
        for input in &inputs {
            let chunks = splitter.split(input);
            for chunk in &chunks {
                assert!(chunk.chars().count() <= 40, "chunk too long: {chunk:?}");
                assert!(!chunk.trim().is_empty());
            }
            assert_eq!(
                without_whitespace(&chunks.concat()),
                without_whitespace(input),
                "input {input:?}"
            );
        }
    }

    #[test]
    fn multibyte_text_is_counted_in_chars() {
        let text = "สวัสดี ".repeat(1000);
        let chunks = ChunkSplitter::default().split(&text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.chars().count() <= MAX_CHUNK_CHARS));
    }

    #[test]
    fn bisect_cuts_at_sentence_near_middle() {
        let halves = ChunkSplitter::default().bisect("First sentence here. Second sentence here.");
        assert_eq!(halves, vec!["First sentence here.", "Second sentence here."]);
    }

    #[test]
    fn bisect_without_boundary_cuts_at_midpoint() {
        let halves = ChunkSplitter::default().bisect("abcdefgh");
        assert_eq!(halves, vec!["abcd", "efgh"]);
    }

    #[test]
    fn bisect_of_tiny_text() {
        let splitter = ChunkSplitter::default();
        assert_eq!(splitter.bisect("a"), vec!["a"]);
        assert!(splitter.bisect(" ").is_empty());
    }
}
