//! Strip markup that reads badly aloud.
//!
//! Model answers often carry markdown, inline citation markers and a trailing
//! sources list. None of it is useful to a listener, and URLs in particular
//! are spelled out character by character by most voices.

use std::sync::LazyLock;

use regex::Regex;

// [cite: 1] or [cite: 1, 2, 3]
static INLINE_CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[cite:\s*[\d,\s]+\]").expect("citation regex"));
// Everything from a Sources/References heading to the end of the text.
static SOURCES_SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^(?:\*\*Sources:\*\*|\*\*References:\*\*|#{1,6}[ \t]*Sources|#{1,6}[ \t]*References).*")
        .expect("sources regex")
});
static TABLE_ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\|.+\|[ \t]*$").expect("table regex"));
static HORIZONTAL_RULE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*-{3,}[ \t]*$").expect("rule regex"));
static HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,6}[ \t]+").expect("header regex"));
static BOLD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").expect("bold regex"));
// No look-around in `regex`: the neighbours are captured and put back.
static ITALIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[^\w*])\*([^*\n]+?)\*([^\w*]|$)").expect("italic regex")
});
static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").expect("link regex"));
static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").expect("url regex"));
static MULTI_BLANK_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank lines regex"));

/// Remove citations, source lists, tables, rules, heading/emphasis markers,
/// link syntax (keeping the link text) and bare URLs, then collapse runs of
/// blank lines.
pub fn clean_for_speech(text: &str) -> String {
    let text = INLINE_CITATION_RE.replace_all(text, "");
    let text = SOURCES_SECTION_RE.replace_all(&text, "");
    let text = TABLE_ROW_RE.replace_all(&text, "");
    let text = HORIZONTAL_RULE_RE.replace_all(&text, "");
    let text = HEADER_RE.replace_all(&text, "");
    let text = BOLD_RE.replace_all(&text, "$1");
    let text = ITALIC_RE.replace_all(&text, "${1}${2}${3}");
    let text = LINK_RE.replace_all(&text, "$1");
    let text = URL_RE.replace_all(&text, "");
    let text = MULTI_BLANK_LINES_RE.replace_all(&text, "\n\n");
    text.trim().to_string()
}
