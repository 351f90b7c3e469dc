//! Streaming sentence extraction.
//!
//! [`SentenceExtractor`] keeps a growing buffer of generated text and emits a
//! [`SentenceUnit`] as soon as a boundary is certain. A boundary is a cluster
//! of terminal punctuation (optionally followed by closing quotes or
//! brackets) that is followed by whitespace and then an uppercase letter, an
//! opening quote, a newline, or the end of the stream. A `.` directly after a
//! known abbreviation or a single-letter initial never ends a sentence.
//!
//! Units end at the punctuation cluster; the whitespace between sentences
//! leads the next unit, so concatenating all emitted text in order
//! reproduces the input exactly.

use std::collections::{HashSet, VecDeque};

use futures::{Stream, StreamExt};

use tutorflow_core::config::ExtractorConfig;
use tutorflow_core::types::SentenceUnit;

const TERMINALS: [char; 4] = ['.', '!', '?', '…'];
const CLOSERS: [char; 7] = ['"', '\'', ')', ']', '”', '’', '»'];
const OPENERS: [char; 5] = ['"', '“', '(', '¿', '¡'];
const CLAUSE_MARKS: [char; 5] = [',', ';', ':', '—', '–'];

/// Output of the extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Unit(SentenceUnit),
    /// Short leftover at stream end, belonging to the unit `sequence_index`.
    Tail { sequence_index: usize, text: String },
}

impl Extracted {
    pub fn text(&self) -> &str {
        match self {
            Self::Unit(unit) => &unit.text,
            Self::Tail { text, .. } => text,
        }
    }

    pub fn sequence_index(&self) -> usize {
        match self {
            Self::Unit(unit) => unit.sequence_index,
            Self::Tail { sequence_index, .. } => *sequence_index,
        }
    }
}

/// Concatenate extracted text in emission order.
pub fn reassemble(parts: &[Extracted]) -> String {
    parts.iter().map(Extracted::text).collect()
}

enum Scan {
    Boundary(usize),
    NeedMore(usize),
    Exhausted,
}

enum Decision {
    Boundary,
    Undecided,
    No,
}

/// Incremental sentence boundary detector for one turn.
#[derive(Debug)]
pub struct SentenceExtractor {
    abbreviations: HashSet<String>,
    min_significant_chars: usize,
    max_chars: usize,
    buffer: String,
    /// Byte offset of the first text not yet emitted. Only moves forward;
    /// emitted text stays in the buffer.
    watermark: usize,
    /// Byte offset where the next boundary scan resumes.
    scan_from: usize,
    next_index: usize,
}

impl SentenceExtractor {
    pub fn new(config: &ExtractorConfig) -> Self {
        Self {
            abbreviations: config
                .abbreviations
                .iter()
                .map(|a| a.trim_end_matches('.').to_lowercase())
                .collect(),
            min_significant_chars: config.min_significant_chars,
            max_chars: config.max_chars.max(1),
            buffer: String::new(),
            watermark: 0,
            scan_from: 0,
            next_index: 0,
        }
    }

    /// Number of units emitted so far.
    pub fn emitted(&self) -> usize {
        self.next_index
    }

    /// Feed the next fragment; returns every unit it completed.
    pub fn push(&mut self, fragment: &str) -> Vec<SentenceUnit> {
        self.buffer.push_str(fragment);
        let mut units = Vec::new();
        self.drain(false, &mut units);
        units
    }

    /// End of stream: flush remaining boundaries and the leftover text.
    pub fn finish(mut self) -> Vec<Extracted> {
        let mut units = Vec::new();
        self.drain(true, &mut units);
        let mut out: Vec<Extracted> = units.into_iter().map(Extracted::Unit).collect();

        let leftover = &self.buffer[self.watermark..];
        if !leftover.is_empty() {
            let significant = leftover.trim().chars().count() > self.min_significant_chars;
            if significant || self.next_index == 0 {
                out.push(Extracted::Unit(SentenceUnit {
                    sequence_index: self.next_index,
                    text: leftover.to_string(),
                }));
            } else {
                out.push(Extracted::Tail {
                    sequence_index: self.next_index - 1,
                    text: leftover.to_string(),
                });
            }
        }
        out
    }

    fn drain(&mut self, final_pass: bool, out: &mut Vec<SentenceUnit>) {
        let mut undecided = None;
        loop {
            match self.scan(final_pass) {
                Scan::Boundary(end) => self.emit_through(end, out),
                Scan::NeedMore(at) => {
                    self.scan_from = at;
                    undecided = Some(at);
                    break;
                }
                Scan::Exhausted => {
                    self.scan_from = self.buffer.len();
                    break;
                }
            }
        }

        // Pending text that can no longer fit one unit is split now so
        // synthesis can start before the sentence ends. A cluster still
        // waiting on its next character inside the window holds the split.
        while self.buffer[self.watermark..].chars().count() > self.max_chars {
            if undecided
                .is_some_and(|at| self.buffer[self.watermark..at].chars().count() < self.max_chars)
            {
                break;
            }
            let cut = split_point(&self.buffer[self.watermark..], self.max_chars);
            self.push_unit(self.watermark + cut, out);
            self.scan_from = self.scan_from.max(self.watermark);
        }
    }

    fn scan(&self, final_pass: bool) -> Scan {
        let text = &self.buffer;
        let mut pos = self.scan_from.max(self.watermark);
        while pos < text.len() {
            let Some(offset) = text[pos..].find(|c: char| TERMINALS.contains(&c)) else {
                return Scan::Exhausted;
            };
            let start = pos + offset;
            let mut end = start;
            for (i, c) in text[start..].char_indices() {
                if TERMINALS.contains(&c) || CLOSERS.contains(&c) {
                    end = start + i + c.len_utf8();
                } else {
                    break;
                }
            }
            match self.classify(start, end, final_pass) {
                Decision::Boundary => return Scan::Boundary(end),
                Decision::Undecided => return Scan::NeedMore(start),
                Decision::No => pos = end,
            }
        }
        Scan::Exhausted
    }

    fn classify(&self, start: usize, end: usize, final_pass: bool) -> Decision {
        let text = &self.buffer;
        let undecided = if final_pass {
            Decision::Boundary
        } else {
            Decision::Undecided
        };
        if end == text.len() {
            return undecided;
        }
        let after = &text[end..];
        let ws_len = after.len() - after.trim_start().len();
        if ws_len == 0 {
            return Decision::No;
        }
        if after[..ws_len].contains('\n') {
            return Decision::Boundary;
        }
        if ws_len == after.len() {
            return undecided;
        }
        if text[start..].starts_with('.') && self.is_abbreviation(start) {
            return Decision::No;
        }
        match after[ws_len..].chars().next() {
            Some(c) if c.is_uppercase() || OPENERS.contains(&c) => Decision::Boundary,
            _ => Decision::No,
        }
    }

    /// Whether the token ending right before `dot` is an abbreviation or initial.
    fn is_abbreviation(&self, dot: usize) -> bool {
        let before = &self.buffer[..dot];
        let token_start = before
            .char_indices()
            .rev()
            .find(|(_, c)| !(c.is_alphanumeric() || *c == '.'))
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        let token = before[token_start..].trim_start_matches('.');
        if token.is_empty() {
            return false;
        }
        if self.abbreviations.contains(&token.to_lowercase()) {
            return true;
        }
        // Initials: "J. K." or "U.S."
        token
            .split('.')
            .all(|part| part.chars().count() == 1 && part.chars().all(char::is_alphabetic))
    }

    /// Emit `watermark..end` as one or more units no longer than the ceiling.
    fn emit_through(&mut self, end: usize, out: &mut Vec<SentenceUnit>) {
        while self.buffer[self.watermark..end].chars().count() > self.max_chars {
            let cut = split_point(&self.buffer[self.watermark..end], self.max_chars);
            self.push_unit(self.watermark + cut, out);
        }
        self.push_unit(end, out);
        self.scan_from = end;
    }

    fn push_unit(&mut self, end: usize, out: &mut Vec<SentenceUnit>) {
        debug_assert!(end > self.watermark);
        out.push(SentenceUnit {
            sequence_index: self.next_index,
            text: self.buffer[self.watermark..end].to_string(),
        });
        self.next_index += 1;
        self.watermark = end;
    }
}

/// Byte offset at which to cut `text` (longer than `max_chars` chars) so the
/// first piece holds at most `max_chars` chars.
///
/// Prefers the last clause mark followed by whitespace, then the last
/// whitespace, then a hard cut at the ceiling. A hard cut never lands inside
/// a run of terminal and closing punctuation when the run can move whole.
pub fn split_point(text: &str, max_chars: usize) -> usize {
    let limit = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let lead = text.len() - text.trim_start().len();
    let window = &text[..limit];

    let clause = window
        .char_indices()
        .filter(|(i, c)| {
            *i >= lead
                && CLAUSE_MARKS.contains(c)
                && text[i + c.len_utf8()..].starts_with(char::is_whitespace)
        })
        .map(|(i, c)| i + c.len_utf8())
        .chain(
            window
                .match_indices(" - ")
                .filter(|(i, _)| *i > lead)
                .map(|(i, _)| i + 2),
        )
        .max();
    if let Some(cut) = clause {
        return cut;
    }

    if let Some((i, _)) = window
        .char_indices()
        .rev()
        .find(|(i, c)| *i > lead && c.is_whitespace())
    {
        return i;
    }

    outside_run(text, limit.max(1), lead, limit)
}

/// Move `cut` off the inside of a terminal/closer run: back to the run's
/// start, or forward to its end when that still fits under `limit`.
fn outside_run(text: &str, cut: usize, lead: usize, limit: usize) -> usize {
    let in_run = |c: char| TERMINALS.contains(&c) || CLOSERS.contains(&c);
    let inside = text[..cut].chars().next_back().is_some_and(in_run)
        && text[cut..].chars().next().is_some_and(in_run);
    if !inside {
        return cut;
    }
    let start = text[..cut].trim_end_matches(in_run).len();
    if start > lead {
        return start;
    }
    let end = text.len() - text[cut..].trim_start_matches(in_run).len();
    if end <= limit { end } else { cut }
}

/// Split a complete text in one pass.
pub fn split_sentences(text: &str, config: &ExtractorConfig) -> Vec<Extracted> {
    let mut extractor = SentenceExtractor::new(config);
    let mut out: Vec<Extracted> = extractor
        .push(text)
        .into_iter()
        .map(Extracted::Unit)
        .collect();
    out.extend(extractor.finish());
    out
}

struct ExtractState<S> {
    fragments: S,
    extractor: Option<SentenceExtractor>,
    ready: VecDeque<Extracted>,
}

/// Lazily turn a fragment stream into extracted units.
///
/// Errors from the fragment stream are passed through and end extraction.
pub fn extract<S, E>(fragments: S, config: &ExtractorConfig) -> impl Stream<Item = Result<Extracted, E>>
where
    S: Stream<Item = Result<String, E>> + Unpin,
{
    futures::stream::unfold(
        ExtractState {
            fragments,
            extractor: Some(SentenceExtractor::new(config)),
            ready: VecDeque::new(),
        },
        |mut state| async move {
            loop {
                if let Some(item) = state.ready.pop_front() {
                    return Some((Ok(item), state));
                }
                let extractor = state.extractor.as_mut()?;
                match state.fragments.next().await {
                    Some(Ok(fragment)) => {
                        let units = extractor.push(&fragment);
                        state.ready.extend(units.into_iter().map(Extracted::Unit));
                    }
                    Some(Err(e)) => {
                        state.extractor = None;
                        return Some((Err(e), state));
                    }
                    None => {
                        if let Some(extractor) = state.extractor.take() {
                            state.ready.extend(extractor.finish());
                        }
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn config() -> ExtractorConfig {
        ExtractorConfig::default()
    }

    fn texts(parts: &[Extracted]) -> Vec<&str> {
        parts.iter().map(Extracted::text).collect()
    }

    #[test]
    fn test_basic_sentences() {
        let parts = split_sentences("Hello there. How are you? I am fine!", &config());
        assert_eq!(texts(&parts), vec!["Hello there.", " How are you?", " I am fine!"]);
        let indices: Vec<usize> = parts.iter().map(Extracted::sequence_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_emits_before_stream_ends() {
        let mut extractor = SentenceExtractor::new(&config());
        assert!(extractor.push("Hello there.").is_empty());
        let units = extractor.push(" How");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].text, "Hello there.");
        assert!(extractor.push(" are you?").is_empty());
        let rest = extractor.finish();
        assert_eq!(texts(&rest), vec![" How are you?"]);
    }

    #[test]
    fn test_abbreviations_do_not_split() {
        let parts = split_sentences("Dr. Smith arrived. He sat down.", &config());
        assert_eq!(texts(&parts), vec!["Dr. Smith arrived.", " He sat down."]);

        let parts = split_sentences("Bring fruit, e.g. Apples and pears. Done now.", &config());
        assert_eq!(
            texts(&parts),
            vec!["Bring fruit, e.g. Apples and pears.", " Done now."]
        );

        let parts = split_sentences("Ask J. K. Rowling about it. She knows.", &config());
        assert_eq!(texts(&parts), vec!["Ask J. K. Rowling about it.", " She knows."]);
    }

    #[test]
    fn test_decimals_and_lowercase_continuations() {
        let parts = split_sentences("Pi is 3.14 roughly. Wait... really? Yes.", &config());
        assert_eq!(
            texts(&parts),
            vec!["Pi is 3.14 roughly.", " Wait... really?", " Yes."]
        );
    }

    #[test]
    fn test_closing_quote_and_newline() {
        let parts = split_sentences("He said \"Stop!\" Then he left.\nnext line here.", &config());
        assert_eq!(
            texts(&parts),
            vec!["He said \"Stop!\"", " Then he left.", "\nnext line here."]
        );
    }

    #[test]
    fn test_short_leftover_becomes_tail() {
        let parts = split_sentences("Hello there. Ok", &config());
        assert_eq!(
            parts,
            vec![
                Extracted::Unit(SentenceUnit {
                    sequence_index: 0,
                    text: "Hello there.".into()
                }),
                Extracted::Tail {
                    sequence_index: 0,
                    text: " Ok".into()
                },
            ]
        );
    }

    #[test]
    fn test_significant_leftover_gets_own_unit() {
        let parts = split_sentences("Hello there. This has no ending punctuation", &config());
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[1], Extracted::Unit(u) if u.sequence_index == 1));
    }

    #[test]
    fn test_lone_short_text_is_a_unit() {
        let parts = split_sentences("ok", &config());
        assert!(matches!(&parts[..], [Extracted::Unit(u)] if u.text == "ok"));
        assert!(split_sentences("", &config()).is_empty());
    }

    #[test]
    fn test_long_sentence_split_at_clause_then_whitespace() {
        let cfg = ExtractorConfig {
            max_chars: 40,
            ..config()
        };
        let text = "This sentence is long, and it keeps going on and on without end.";
        let parts = split_sentences(text, &cfg);
        assert_eq!(parts[0].text(), "This sentence is long,");
        assert!(parts.iter().all(|p| p.text().chars().count() <= 40));
        assert_eq!(reassemble(&parts), text);
    }

    #[test]
    fn test_hard_cut_without_whitespace() {
        let cfg = ExtractorConfig {
            max_chars: 40,
            ..config()
        };
        let text = "a".repeat(100);
        let parts = split_sentences(&text, &cfg);
        let lens: Vec<usize> = parts.iter().map(|p| p.text().len()).collect();
        assert_eq!(lens, vec![40, 40, 20]);
    }

    #[test]
    fn test_round_trip_under_random_chunking() {
        let text = "Fractions describe parts of a whole. Dr. Lee cut a pizza into 8 slices, \
                    e.g. For a party! Each slice is 1/8, or 0.125 of the pizza. \"Great!\" \
                    Sam said. If you eat 3 slices, you ate 3/8... That's less than half?\n\
                    Yes. Now let's try a much longer sentence that goes well past the forty \
                    character ceiling we configured, so it must be split, preferably at a \
                    comma; otherwise at whitespace. the end";
        let cfg = ExtractorConfig {
            max_chars: 40,
            ..config()
        };
        let expected = split_sentences(text, &cfg);
        assert_eq!(reassemble(&expected), text);

        let mut rng = rand::rng();
        let chars: Vec<char> = text.chars().collect();
        for _ in 0..50 {
            let mut extractor = SentenceExtractor::new(&cfg);
            let mut parts = Vec::new();
            let mut i = 0;
            while i < chars.len() {
                let n = rng.random_range(1..12).min(chars.len() - i);
                let fragment: String = chars[i..i + n].iter().collect();
                parts.extend(extractor.push(&fragment).into_iter().map(Extracted::Unit));
                i += n;
            }
            parts.extend(extractor.finish());
            assert_eq!(reassemble(&parts), text);
            assert_eq!(parts, expected);
        }
    }

    #[test]
    fn test_no_is_not_an_abbreviation() {
        let parts = split_sentences("The answer is no. Try again.", &config());
        assert_eq!(texts(&parts), vec!["The answer is no.", " Try again."]);
    }

    #[test]
    fn test_hard_cut_keeps_punctuation_run_whole() {
        assert_eq!(split_point("Stop!')x", 6), 4);
        assert_eq!(split_point("!')abcdef", 3), 3);
        // A run longer than the ceiling is still cut at the ceiling.
        assert_eq!(split_point("!')abcdef", 2), 2);
        assert_eq!(split_point("abcdefgh", 4), 4);
    }

    #[test]
    fn test_small_ceiling_streams_like_one_shot() {
        let text = "He shouted \"Stop!') now. Then she said 'Go!'\" and left. Really?!) Yes. \
                    A. B. Cooper waved.) ok";
        let cfg = ExtractorConfig {
            max_chars: 7,
            ..config()
        };
        let expected = split_sentences(text, &cfg);
        assert_eq!(reassemble(&expected), text);
        for pair in expected.windows(2) {
            let runs = |c: char| TERMINALS.contains(&c) || CLOSERS.contains(&c);
            let split_run = pair[0].text().ends_with(runs) && pair[1].text().starts_with(runs);
            assert!(!split_run, "cut inside {:?} {:?}", pair[0], pair[1]);
        }

        let mut rng = rand::rng();
        let chars: Vec<char> = text.chars().collect();
        for _ in 0..200 {
            let mut extractor = SentenceExtractor::new(&cfg);
            let mut parts = Vec::new();
            let mut i = 0;
            while i < chars.len() {
                let n = rng.random_range(1..12).min(chars.len() - i);
                let fragment: String = chars[i..i + n].iter().collect();
                parts.extend(extractor.push(&fragment).into_iter().map(Extracted::Unit));
                i += n;
            }
            parts.extend(extractor.finish());
            assert_eq!(parts, expected);
        }
    }

    #[tokio::test]
    async fn test_extract_stream() {
        let fragments = futures::stream::iter(
            ["One. T", "wo. Thr", "ee"]
                .into_iter()
                .map(|s| Ok::<_, std::convert::Infallible>(s.to_string())),
        );
        let parts: Vec<Extracted> = extract(fragments, &config())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(texts(&parts), vec!["One.", " Two.", " Three"]);
    }

    #[tokio::test]
    async fn test_extract_stream_error_stops() {
        let fragments = futures::stream::iter(vec![
            Ok("Fine. Then".to_string()),
            Err("provider dropped"),
            Ok(" never seen.".to_string()),
        ]);
        let items: Vec<Result<Extracted, &str>> = extract(fragments, &config()).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().text(), "Fine.");
        assert!(items[1].is_err());
    }
}
