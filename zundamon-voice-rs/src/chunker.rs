//! Splits normalized text into short, punctuation-aligned chunks so playback
//! can start before the whole reply is synthesized.
//!
//! Boundaries are tried coarse to fine: sentence enders, then clause
//! separators, then whitespace. A run with none of those is kept whole even
//! when it exceeds the limit. Concatenating the chunks gives back the input
//! modulo whitespace trimmed at chunk edges.

use serde::Serialize;

use crate::emotion::{classify, EmotionTag};

pub const DEFAULT_MAX_CHARS: usize = 50;

fn is_sentence_end(c: char) -> bool {
    matches!(c, '。' | '！' | '？' | '!' | '?' | '．' | '\n')
}

fn is_clause_separator(c: char) -> bool {
    matches!(c, '、' | '，' | ',' | '；' | ';' | '：' | ':')
}

fn is_space(c: char) -> bool {
    c.is_whitespace()
}

const BOUNDARIES: [fn(char) -> bool; 3] = [is_sentence_end, is_clause_separator, is_space];

/// A speakable segment of one utterance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub text: String,
    pub sequence: usize,
    pub emotion: EmotionTag,
}

/// Chunk `text` and tag each piece with its emotion.
pub fn build_chunks(text: &str, max_chars: usize) -> Vec<Chunk> {
    chunk_text(text, max_chars)
        .into_iter()
        .enumerate()
        .map(|(sequence, text)| {
            let emotion = classify(&text);
            Chunk {
                text,
                sequence,
                emotion,
            }
        })
        .collect()
}

/// Split `text` into chunks of at most `max_chars` characters where a
/// boundary allows it. Every returned chunk is non-empty.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = if max_chars == 0 { DEFAULT_MAX_CHARS } else { max_chars };
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut assembler = Assembler::new(max_chars);
    for sentence in split_after(text, BOUNDARIES[0]) {
        assembler.push(sentence, 0);
    }
    assembler.finish()
}

/// Split after every boundary character, keeping it with the left piece.
fn split_after(text: &str, boundary: fn(char) -> bool) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if boundary(c) {
            let end = i + c.len_utf8();
            pieces.push(&text[start..end]);
            start = end;
        }
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

struct Assembler {
    max_chars: usize,
    chunks: Vec<String>,
    current: String,
    current_len: usize,
}

impl Assembler {
    fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            chunks: Vec::new(),
            current: String::new(),
            current_len: 0,
        }
    }

    fn push(&mut self, segment: &str, level: usize) {
        let len = segment.chars().count();

        if self.current_len + len <= self.max_chars {
            self.append(segment, len);
            return;
        }

        if len <= self.max_chars {
            self.flush();
            self.append(segment, len);
            return;
        }

        // Too long on its own: descend to the first finer boundary that splits it
        for finer in level + 1..BOUNDARIES.len() {
            let parts = split_after(segment, BOUNDARIES[finer]);
            if parts.len() > 1 {
                for part in parts {
                    self.push(part, finer);
                }
                return;
            }
        }

        self.flush();
        self.append(segment, len);
        self.flush();
    }

    fn append(&mut self, segment: &str, len: usize) {
        self.current.push_str(segment);
        self.current_len += len;
    }

    fn flush(&mut self) {
        let trimmed = self.current.trim();
        if !trimmed.is_empty() {
            self.chunks.push(trimmed.to_string());
        }
        self.current.clear();
        self.current_len = 0;
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emotion::EmotionLabel;

    fn strip_ws(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    #[test]
    fn short_text_is_single_chunk() {
        let text = "こんにちは。今日は天気がいいですね。";
        assert_eq!(chunk_text(text, 50), vec![text]);
    }

    #[test]
    fn forty_chars_without_punctuation() {
        let text: String = "あ".repeat(40);
        assert_eq!(chunk_text(&text, 50), vec![text]);
    }

    #[test]
    fn empty_and_blank_input() {
        assert!(chunk_text("", 50).is_empty());
        assert!(chunk_text(" \n\t ", 50).is_empty());
    }

    #[test]
    fn splits_at_sentence_boundaries() {
        let text = "今日は朝から雨が降っていて、とても寒い一日になりました。\
                    午後には晴れるという予報なので、散歩に出かける予定です。\
                    傘を忘れないようにしましょう。";
        let chunks = chunk_text(text, 50);
        // 28 + 28 + 15 chars: the last two sentences fit together
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].starts_with("午後"));
        assert!(chunks.iter().all(|c| c.chars().count() <= 50));
        assert!(chunks.iter().all(|c| c.ends_with('。')));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn short_sentences_are_merged() {
        let text = "はい。そうです。".repeat(8);
        let chunks = chunk_text(&text, 50);
        assert!(chunks.len() < 16);
        assert!(chunks.iter().all(|c| c.chars().count() <= 50));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn long_sentence_splits_at_clauses() {
        let clause = "これはとても長い説明の一部分であり";
        let text = format!("{clause}、{clause}、{clause}、{clause}。");
        let chunks = chunk_text(&text, 50);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 50));
        assert!(chunks[0].ends_with('、'));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn falls_back_to_whitespace() {
        let word = "ずんだもん";
        let text = vec![word; 15].join(" ");
        let chunks = chunk_text(&text, 50);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 50));
        assert!(chunks.iter().all(|c| !c.starts_with(' ') && !c.ends_with(' ')));
        assert_eq!(strip_ws(&chunks.concat()), strip_ws(&text));
    }

    #[test]
    fn unsplittable_run_is_kept_whole() {
        let text: String = "ん".repeat(80);
        let chunks = chunk_text(&format!("{text}。次です。"), 50);
        assert_eq!(chunks, vec![format!("{text}。"), "次です。".to_string()]);
    }

    #[test]
    fn chunks_are_sequenced_and_tagged() {
        let text = format!("{}。本当にありがとうございます！", "説明を続けます".repeat(6));
        let chunks = build_chunks(&text, 50);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].sequence, 0);
        assert_eq!(chunks[1].sequence, 1);
        assert_eq!(chunks[1].emotion.label, EmotionLabel::Grateful);
    }
}
