//! Rule-based emotion classification of a single chunk.
//!
//! Every rule is tested against the whole text. The highest intensity among
//! the matching rules wins and ties go to the earlier rule in the table.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmotionLabel {
    Joy,
    Sad,
    Angry,
    Surprised,
    Confused,
    Worried,
    Excited,
    Apologetic,
    Grateful,
    Encouraging,
    Explaining,
    Questioning,
    Celebrating,
    Disappointed,
    Impressed,
    Playful,
    Serious,
    Exasperated,
    Relieved,
    Embarrassed,
    Scared,
    #[default]
    Neutral,
}

impl EmotionLabel {
    pub const ALL: [EmotionLabel; 22] = [
        Self::Joy,
        Self::Sad,
        Self::Angry,
        Self::Surprised,
        Self::Confused,
        Self::Worried,
        Self::Excited,
        Self::Apologetic,
        Self::Grateful,
        Self::Encouraging,
        Self::Explaining,
        Self::Questioning,
        Self::Celebrating,
        Self::Disappointed,
        Self::Impressed,
        Self::Playful,
        Self::Serious,
        Self::Exasperated,
        Self::Relieved,
        Self::Embarrassed,
        Self::Scared,
        Self::Neutral,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Joy => "joy",
            Self::Sad => "sad",
            Self::Angry => "angry",
            Self::Surprised => "surprised",
            Self::Confused => "confused",
            Self::Worried => "worried",
            Self::Excited => "excited",
            Self::Apologetic => "apologetic",
            Self::Grateful => "grateful",
            Self::Encouraging => "encouraging",
            Self::Explaining => "explaining",
            Self::Questioning => "questioning",
            Self::Celebrating => "celebrating",
            Self::Disappointed => "disappointed",
            Self::Impressed => "impressed",
            Self::Playful => "playful",
            Self::Serious => "serious",
            Self::Exasperated => "exasperated",
            Self::Relieved => "relieved",
            Self::Embarrassed => "embarrassed",
            Self::Scared => "scared",
            Self::Neutral => "neutral",
        }
    }

    /// Lenient lookup by wire name; unknown names map to neutral.
    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(name.trim()))
            .unwrap_or(Self::Neutral)
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EmotionTag {
    pub label: EmotionLabel,
    pub intensity: f32,
}

impl EmotionTag {
    pub fn neutral() -> Self {
        Self::default()
    }

    pub fn is_neutral(&self) -> bool {
        self.label == EmotionLabel::Neutral
    }
}

// (label, pattern, intensity), in priority order for ties
const RULES: &[(EmotionLabel, &str, f32)] = &[
    (EmotionLabel::Celebrating, r"おめでとう|祝|🎉|合格|優勝", 0.95),
    (EmotionLabel::Excited, r"やった|わくわく|ワクワク|楽しみ|最高|[!！]{2,}", 0.9),
    (EmotionLabel::Angry, r"怒|ふざけ|許せな|腹が立|ムカつ", 0.9),
    (EmotionLabel::Grateful, r"ありがとう|感謝|助かり|助かっ|お礼", 0.85),
    (EmotionLabel::Apologetic, r"すみません|ごめん|申し訳|失礼しました|お詫び", 0.85),
    (EmotionLabel::Surprised, r"びっくり|驚|まさか|なんと|えっ[!！?？]", 0.85),
    (EmotionLabel::Joy, r"嬉し|うれし|よかった|良かった|楽しい|幸せ", 0.8),
    (EmotionLabel::Sad, r"悲し|寂し|さみし|つらい|泣", 0.8),
    (EmotionLabel::Impressed, r"すごい|凄い|素晴らし|さすが|見事|感心", 0.8),
    (EmotionLabel::Scared, r"怖|こわい|恐ろし|危険", 0.75),
    (EmotionLabel::Relieved, r"ほっと|ホッと|安心|一安心", 0.75),
    (EmotionLabel::Encouraging, r"頑張|がんば|応援|大丈夫ですよ|できますよ|きっと", 0.75),
    (EmotionLabel::Disappointed, r"残念|がっかり|惜しい", 0.7),
    (EmotionLabel::Worried, r"心配|不安|気をつけ|注意して", 0.7),
    (EmotionLabel::Exasperated, r"やれやれ|はぁ|またですか|いい加減", 0.7),
    (EmotionLabel::Embarrassed, r"恥ずかし|照れ|てへ", 0.7),
    (EmotionLabel::Confused, r"わからない|分からない|困っ|うーん|どういう", 0.65),
    (EmotionLabel::Playful, r"冗談|ふふ|えへへ|（笑）|w{2,}", 0.6),
    (EmotionLabel::Serious, r"重要|必ず|絶対|警告", 0.6),
    (EmotionLabel::Questioning, r"[？?]|でしょうか|ですか|ますか", 0.5),
    (EmotionLabel::Explaining, r"つまり|例えば|たとえば|説明|なぜなら|というのは|ポイントは", 0.45),
];

static COMPILED: LazyLock<Vec<(EmotionLabel, Regex, f32)>> = LazyLock::new(|| {
    RULES
        .iter()
        .map(|(label, pattern, intensity)| {
            (*label, Regex::new(pattern).expect("valid regex"), *intensity)
        })
        .collect()
});

/// Classify one chunk. Pure and deterministic.
pub fn classify(text: &str) -> EmotionTag {
    let mut best: Option<(EmotionLabel, f32)> = None;
    for (label, pattern, intensity) in COMPILED.iter() {
        if !pattern.is_match(text) {
            continue;
        }
        if best.map_or(true, |(_, top)| *intensity > top) {
            best = Some((*label, *intensity));
        }
    }

    match best {
        Some((label, intensity)) => EmotionTag { label, intensity },
        None => EmotionTag::neutral(),
    }
}
