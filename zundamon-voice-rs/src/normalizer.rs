//! Speakable-text extraction from assistant message markup.
//!
//! 1. Drop non-speech subtrees (code, buttons, tool output, thinking blocks)
//! 2. Run the ordered scrubber list over the remaining text
//! 3. Strip UI chrome strings and collapse whitespace
//! 4. Reject text with no Japanese script or fewer than 3 characters
//!
//! The scrubber list is a heuristic blocklist. It can be replaced from the
//! config file without touching the rest of the pipeline.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::{debug, warn};

use crate::config::NormalizerConfig;

const MIN_CHARS: usize = 3;

const EXCLUDED_SELECTORS: &[&str] = &[
    "pre",
    "code",
    "button",
    r#"[class*="tool"]"#,
    r#"[class*="thinking"]"#,
    r#"[class*="Thinking"]"#,
    "[data-thinking]",
    r#"[aria-label*="thinking"]"#,
    r#"[aria-label*="Thinking"]"#,
    r#"[data-testid*="thinking"]"#,
    ".thinking-block",
    ".thought-process",
];

/// Built-in reasoning-trace scrubbers, applied in order. The first two
/// collapse whole scratch-text runs and keep the reply opener they stop at.
const DEFAULT_SCRUBBERS: &[(&str, &str)] = &[
    (r"考え中[\s\S]*?([ぁ-んァ-ヶー][ぁ-んァ-ヶー一-龠]{2,})", "${1}"),
    (
        r"(?s)ユーザー[がはに].+?(そうですね|はい|いいえ|ありがとう|わかりました|こんにちは|こんばんは|おはよう|では|それでは)",
        "${1}",
    ),
    (r"The user is .+?\.", ""),
    (r"The user has .+?\.", ""),
    (r"The user wrote .+?\.", ""),
    (r"I should .+?\.", ""),
    (r"Since .+?\.", ""),
    (r"This is .+?\.", ""),
    (r"ユーザーは.+?[。.]", ""),
    (r"ユーザーが.+?[。.]", ""),
    (r"ユーザーに.+?[。.]", ""),
    (r"これは.+?[。.]", ""),
    (r"それは.+?[。.]", ""),
    (r"自然な.+?[。.]", ""),
    (r"ユーザーの場所は.+?[。.]", ""),
    (r".+?と返答しました[。.]?", ""),
    (r".+?のようです[。.]?", ""),
    (r".+?が良さそうです[。.]?", ""),
    (r".+?待っています[。.]?", ""),
    (r"何か具体的な.+?[。.]", ""),
    (r"何か.+?のようなので、.+?[。.]", ""),
    (r"無理に.+?[。.]", ""),
    (r"考えていること.+?[。.]", ""),
    (r"思考プロセス.+?[。.]", ""),
];

const DEFAULT_UI_STRINGS: &[&str] = &["再試行", "Retry", "コピー", "Copy"];

static EXCLUDED: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    EXCLUDED_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .collect()
});

static TARGET_SCRIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ぁ-んァ-ヶー一-龠]").expect("valid regex"));
static MULTI_NEWLINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{2,}").expect("valid regex"));
static MULTI_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").expect("valid regex"));

/// One find/replace step.
#[derive(Debug, Clone)]
pub struct Scrubber {
    pattern: Regex,
    replacement: String,
}

impl Scrubber {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.to_string(),
        })
    }
}

/// Ordered, replaceable scrubber list plus UI chrome strings.
#[derive(Debug, Clone)]
pub struct ScrubPolicy {
    scrubbers: Vec<Scrubber>,
    ui_strings: Vec<String>,
}

impl Default for ScrubPolicy {
    fn default() -> Self {
        let scrubbers = DEFAULT_SCRUBBERS
            .iter()
            .filter_map(|(p, r)| Scrubber::new(p, r).ok())
            .collect();
        Self {
            scrubbers,
            ui_strings: DEFAULT_UI_STRINGS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ScrubPolicy {
    /// Build from config, keeping the defaults for anything not overridden.
    /// Invalid patterns are skipped with a warning.
    pub fn from_config(config: &NormalizerConfig) -> Self {
        let mut policy = Self::default();
        if let Some(custom) = &config.scrubbers {
            policy.scrubbers = custom
                .iter()
                .filter_map(|s| match Scrubber::new(&s.pattern, &s.replacement) {
                    Ok(scrubber) => Some(scrubber),
                    Err(e) => {
                        warn!("Skipping invalid scrubber '{}': {e}", s.pattern);
                        None
                    }
                })
                .collect();
        }
        if let Some(ui) = &config.ui_strings {
            policy.ui_strings = ui.clone();
        }
        policy
    }

    fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        for scrubber in &self.scrubbers {
            out = scrubber
                .pattern
                .replace_all(&out, scrubber.replacement.as_str())
                .into_owned();
        }
        for ui in &self.ui_strings {
            out = out.replace(ui.as_str(), "");
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    policy: ScrubPolicy,
}

impl Normalizer {
    pub fn new(policy: ScrubPolicy) -> Self {
        Self { policy }
    }

    /// Text content of `element`, minus every excluded subtree.
    pub fn extract_text(element: ElementRef<'_>) -> String {
        let excluded: HashSet<_> = EXCLUDED
            .iter()
            .flat_map(|sel| element.select(sel).map(|e| e.id()))
            .collect();

        let mut text = String::new();
        for node in element.descendants() {
            let Node::Text(t) = node.value() else {
                continue;
            };
            let hidden = node
                .ancestors()
                .take_while(|a| a.id() != element.id())
                .any(|a| excluded.contains(&a.id()));
            if !hidden {
                text.push_str(t);
            }
        }
        text
    }

    /// Normalize an HTML fragment (first element is the message root).
    pub fn normalize_html(&self, html: &str) -> String {
        let fragment = Html::parse_fragment(html);
        let Some(root) = fragment
            .root_element()
            .children()
            .find_map(ElementRef::wrap)
        else {
            return self.normalize_text(&fragment.root_element().text().collect::<String>());
        };
        self.normalize_text(&Self::extract_text(root))
    }

    /// Scrub, collapse and validate already-extracted text. Returns an empty
    /// string when the result should not be spoken.
    pub fn normalize_text(&self, raw: &str) -> String {
        let scrubbed = self.policy.apply(raw.trim());
        let collapsed = MULTI_NEWLINE.replace_all(&scrubbed, "\n");
        let collapsed = MULTI_SPACE.replace_all(&collapsed, " ");
        let text = collapsed.trim();

        if text.is_empty() {
            debug!("Normalized text is empty");
            return String::new();
        }
        if !TARGET_SCRIPT.is_match(text) {
            debug!("No Japanese text, skipping");
            return String::new();
        }
        if text.chars().count() < MIN_CHARS {
            debug!("Text too short: {} chars", text.chars().count());
            return String::new();
        }
        text.to_string()
    }
}
