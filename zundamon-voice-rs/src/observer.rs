//! Response observer: turns page mutation reports into finalized utterances.
//!
//! The page link reports every element added to the conversation as a
//! `node_added` event carrying its outer HTML. Assistant messages found in
//! it are spoken once. Messages still marked `data-is-streaming="true"` are
//! held until the page reports the marker cleared (plus a short settle
//! delay) or until the streaming timeout, whichever comes first.
//!
//! Nothing in here fails: malformed fragments and unknown nodes are logged
//! and skipped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ObserverConfig;
use crate::normalizer::Normalizer;
use crate::timer::deadline;

/// Processed message keys remembered for idempotence.
const MAX_PROCESSED: usize = 2000;

static MESSAGE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("[data-is-streaming], [data-test-render-count], .font-claude-message")
        .expect("valid selector")
});
static USER: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"[data-testid*="user"]"#).expect("valid selector"));

/// Mutation report from the page link.
///
/// `node` is the page's id for an added subtree. `streaming_changed` refers
/// to the same id and carries the subtree's current outer HTML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PageEvent {
    NodeAdded {
        node: u64,
        html: String,
        #[serde(default)]
        in_user_turn: bool,
    },
    StreamingChanged {
        node: u64,
        streaming: bool,
        html: String,
    },
}

/// One assistant message element: the added subtree plus the element's
/// position in it (0 is the subtree root, then document order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MessageKey {
    pub node: u64,
    pub index: usize,
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}#{}", self.node, self.index)
    }
}

/// A finalized assistant message ready for chunking.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub raw_text: String,
    pub text: String,
    pub source: MessageKey,
}

struct Pending {
    html: String,
    deadline: Instant,
    settle_at: Option<Instant>,
}

impl Pending {
    fn due_at(&self) -> Instant {
        self.settle_at.map_or(self.deadline, |s| s.min(self.deadline))
    }
}

pub struct Observer {
    normalizer: Arc<Normalizer>,
    streaming_timeout: Duration,
    settle_delay: Duration,
    processed: HashSet<MessageKey>,
    processed_order: VecDeque<MessageKey>,
    max_processed: usize,
    pending: HashMap<MessageKey, Pending>,
    last_text: Option<String>,
}

impl Observer {
    pub fn new(normalizer: Arc<Normalizer>, config: &ObserverConfig) -> Self {
        Self {
            normalizer,
            streaming_timeout: Duration::from_millis(config.streaming_timeout_ms),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            processed: HashSet::new(),
            processed_order: VecDeque::new(),
            max_processed: MAX_PROCESSED,
            pending: HashMap::new(),
            last_text: None,
        }
    }

    /// Run until `events` closes or `cancel` fires. Utterances come out of
    /// the returned stream in the order they were finalized.
    pub fn spawn(
        self,
        events: mpsc::Receiver<PageEvent>,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<Utterance> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(events, tx, cancel));
        rx
    }

    async fn run(
        mut self,
        mut events: mpsc::Receiver<PageEvent>,
        tx: mpsc::UnboundedSender<Utterance>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = self.next_deadline();
            let finalized = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        debug!("Page event stream closed");
                        return;
                    }
                },
                _ = deadline(next) => self.expire(Instant::now()),
            };

            for utterance in finalized {
                info!(
                    "Assistant message {} finalized ({} chars)",
                    utterance.source,
                    utterance.text.chars().count()
                );
                if tx.send(utterance).is_err() {
                    return;
                }
            }
        }
    }

    pub fn handle(&mut self, event: PageEvent) -> Vec<Utterance> {
        match event {
            PageEvent::NodeAdded {
                node,
                html,
                in_user_turn,
            } => {
                if in_user_turn {
                    debug!("Skipping node {node} in user turn");
                    return Vec::new();
                }
                self.node_added(node, html)
            }
            PageEvent::StreamingChanged {
                node,
                streaming,
                html,
            } => {
                self.streaming_changed(node, streaming, html);
                Vec::new()
            }
        }
    }

    fn node_added(&mut self, node: u64, html: String) -> Vec<Utterance> {
        let fragment = Html::parse_fragment(&html);
        let Some(root) = first_element(&fragment) else {
            debug!("Node {node} has no element content");
            return Vec::new();
        };

        let mut out = Vec::new();
        for (index, element) in candidates(root) {
            let key = MessageKey { node, index };
            if is_user_message(element) {
                debug!("Skipping user message {key}");
                continue;
            }
            if !self.remember(key) {
                continue;
            }
            if is_streaming(element) {
                debug!("{key} still streaming, deferring");
                self.pending.insert(
                    key,
                    Pending {
                        html: html.clone(),
                        deadline: Instant::now() + self.streaming_timeout,
                        settle_at: None,
                    },
                );
                continue;
            }
            out.extend(self.finalize(key, element));
        }
        out
    }

    /// Record `key` as seen. Returns false if it already was. The oldest
    /// keys are forgotten once the set is full.
    fn remember(&mut self, key: MessageKey) -> bool {
        if !self.processed.insert(key) {
            return false;
        }
        self.processed_order.push_back(key);
        while self.processed_order.len() > self.max_processed {
            if let Some(oldest) = self.processed_order.pop_front() {
                self.processed.remove(&oldest);
            }
        }
        true
    }

    fn streaming_changed(&mut self, node: u64, streaming: bool, html: String) {
        let settle_at = (!streaming).then(|| Instant::now() + self.settle_delay);
        let mut matched = false;
        for (_, pending) in self.pending.iter_mut().filter(|(k, _)| k.node == node) {
            pending.html.clone_from(&html);
            pending.settle_at = settle_at;
            matched = true;
        }
        if !matched {
            debug!("Streaming change for untracked node {node}");
        }
    }

    /// Earliest moment a deferred message becomes due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(Pending::due_at).min()
    }

    /// Finalize every deferred message due at `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<Utterance> {
        let mut due: Vec<MessageKey> = self
            .pending
            .iter()
            .filter(|(_, p)| p.due_at() <= now)
            .map(|(k, _)| *k)
            .collect();
        due.sort();

        let mut out = Vec::new();
        for key in due {
            let Some(pending) = self.pending.remove(&key) else {
                continue;
            };
            if pending.settle_at.is_none() {
                info!(
                    "{key} still streaming after {}s, finalizing anyway",
                    self.streaming_timeout.as_secs()
                );
            }
            let fragment = Html::parse_fragment(&pending.html);
            let element = first_element(&fragment)
                .and_then(|root| root.descendants().filter_map(ElementRef::wrap).nth(key.index));
            match element {
                Some(element) => out.extend(self.finalize(key, element)),
                None => debug!("{key} vanished before finalizing"),
            }
        }
        out
    }

    fn finalize(&mut self, key: MessageKey, element: ElementRef<'_>) -> Option<Utterance> {
        let raw_text = Normalizer::extract_text(element);
        let text = self.normalizer.normalize_text(&raw_text);
        if text.is_empty() {
            debug!("{key} has nothing speakable");
            return None;
        }
        if self.last_text.as_deref() == Some(text.as_str()) {
            debug!("{key} repeats the last message, skipping");
            return None;
        }
        self.last_text = Some(text.clone());
        Some(Utterance {
            raw_text,
            text,
            source: key,
        })
    }
}

fn first_element(fragment: &Html) -> Option<ElementRef<'_>> {
    fragment.root_element().children().find_map(ElementRef::wrap)
}

/// The root itself if it is a message, otherwise the outermost message
/// elements below it, each with its document-order index.
fn candidates(root: ElementRef<'_>) -> Vec<(usize, ElementRef<'_>)> {
    if MESSAGE.matches(&root) {
        return vec![(0, root)];
    }

    let mut found: Vec<(usize, ElementRef<'_>)> = Vec::new();
    for (index, element) in root.descendants().filter_map(ElementRef::wrap).enumerate().skip(1) {
        if !MESSAGE.matches(&element) {
            continue;
        }
        let nested = found
            .iter()
            .any(|(_, outer)| element.ancestors().any(|a| a.id() == outer.id()));
        if !nested {
            found.push((index, element));
        }
    }
    found
}

fn is_user_message(element: ElementRef<'_>) -> bool {
    let marked_above = std::iter::once(element)
        .chain(element.ancestors().filter_map(ElementRef::wrap))
        .any(|e| USER.matches(&e));
    marked_above || element.select(&USER).next().is_some()
}

fn is_streaming(element: ElementRef<'_>) -> bool {
    element.value().attr("data-is-streaming") == Some("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observer() -> Observer {
        Observer::new(Arc::new(Normalizer::default()), &ObserverConfig::default())
    }

    fn added(node: u64, html: &str) -> PageEvent {
        PageEvent::NodeAdded {
            node,
            html: html.to_string(),
            in_user_turn: false,
        }
    }

    const REPLY: &str = r#"<div data-test-render-count="1"><div class="font-claude-message"><p>こんにちは、元気なのだ。</p></div></div>"#;

    #[test]
    fn page_event_wire_format() {
        let event: PageEvent = serde_json::from_str(
            r#"{"type":"node_added","node":7,"html":"<div></div>"}"#,
        )
        .unwrap();
        assert_eq!(event, added(7, "<div></div>"));

        let event: PageEvent = serde_json::from_str(
            r#"{"type":"streaming_changed","node":7,"streaming":false,"html":"<div></div>"}"#,
        )
        .unwrap();
        assert!(matches!(event, PageEvent::StreamingChanged { streaming: false, .. }));
    }

    #[tokio::test]
    async fn finalized_message_is_spoken_once() {
        let mut obs = observer();
        let out = obs.handle(added(1, REPLY));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "こんにちは、元気なのだ。");
        assert_eq!(out[0].source, MessageKey { node: 1, index: 0 });

        // same node reported again
        assert!(obs.handle(added(1, REPLY)).is_empty());
    }

    #[tokio::test]
    async fn finds_outermost_message_below_root() {
        let mut obs = observer();
        let html = r#"<section><h2>見出し</h2><div class="font-claude-message"><p>説明するのだ。</p></div></section>"#;
        let out = obs.handle(added(2, html));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source, MessageKey { node: 2, index: 2 });
        assert_eq!(out[0].text, "説明するのだ。");
    }

    #[tokio::test]
    async fn user_messages_are_skipped() {
        let mut obs = observer();
        let inside_user = r#"<div data-testid="user-message"><div class="font-claude-message">ユーザーの文章です</div></div>"#;
        assert!(obs.handle(added(3, inside_user)).is_empty());

        let containing_user = r#"<div data-test-render-count="2"><div data-testid="user-message">質問なのだ</div></div>"#;
        assert!(obs.handle(added(4, containing_user)).is_empty());

        let flagged = PageEvent::NodeAdded {
            node: 5,
            html: REPLY.to_string(),
            in_user_turn: true,
        };
        assert!(obs.handle(flagged).is_empty());
    }

    #[tokio::test]
    async fn identical_consecutive_text_is_suppressed() {
        let mut obs = observer();
        assert_eq!(obs.handle(added(1, REPLY)).len(), 1);
        assert!(obs.handle(added(2, REPLY)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_message_waits_for_marker_to_clear() {
        let mut obs = observer();
        let partial = r#"<div data-is-streaming="true"><p>途中まで</p></div>"#;
        assert!(obs.handle(added(9, partial)).is_empty());
        assert!(obs.next_deadline().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        obs.handle(PageEvent::StreamingChanged {
            node: 9,
            streaming: false,
            html: r#"<div data-is-streaming="false"><p>最後まで書き終えたのだ。</p></div>"#.into(),
        });

        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(obs.expire(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_millis(100)).await;
        let out = obs.expire(Instant::now());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "最後まで書き終えたのだ。");
        assert!(obs.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_stream_finalizes_after_timeout() {
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let mut utterances = observer().spawn(rx, cancel.clone());

        tx.send(added(
            11,
            r#"<div data-is-streaming="true"><p>ずっと書いているのだ。</p></div>"#,
        ))
        .await
        .unwrap();

        let started = Instant::now();
        let utterance = utterances.recv().await.unwrap();
        assert_eq!(utterance.text, "ずっと書いているのだ。");
        assert!(started.elapsed() >= Duration::from_secs(10));
        cancel.cancel();
    }

    #[tokio::test]
    async fn processed_keys_are_bounded() {
        let mut obs = observer();
        obs.max_processed = 2;
        let reply = |text: &str| format!(r#"<div class="font-claude-message"><p>{text}</p></div>"#);

        assert_eq!(obs.handle(added(1, &reply("ひとつめなのだ。"))).len(), 1);
        assert_eq!(obs.handle(added(2, &reply("ふたつめなのだ。"))).len(), 1);
        assert_eq!(obs.handle(added(3, &reply("みっつめなのだ。"))).len(), 1);
        assert_eq!(obs.processed.len(), 2);
        assert!(!obs.processed.contains(&MessageKey { node: 1, index: 0 }));

        // still remembered
        assert!(obs.handle(added(3, &reply("よっつめなのだ。"))).is_empty());
        // forgotten, so spoken again
        assert_eq!(obs.handle(added(1, &reply("ひとつめなのだ。"))).len(), 1);
    }

    #[tokio::test]
    async fn unspeakable_content_is_dropped() {
        let mut obs = observer();
        let code_only = r#"<div class="font-claude-message"><pre><code>fn main() {}</code></pre></div>"#;
        assert!(obs.handle(added(1, code_only)).is_empty());
        assert!(obs.handle(added(2, "just text, no element")).is_empty());
    }
}
