//! Speech pipeline: an ordered chunk queue with synthesis prefetch.
//!
//! All session state is owned by one actor task. Synthesis and playback run
//! as spawned tasks that report back over the actor's event channel, so the
//! queue, the audio cache and the in-flight set are never shared.
//!
//! Playback order is enqueue order regardless of which synthesis finishes
//! first. While a chunk plays, the next queued chunk is synthesized in the
//! background; a chunk whose prefetch is still running when its turn comes
//! waits for it up to `prefetch_wait` before synthesizing fresh.

use std::collections::{HashMap, HashSet, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::avatar::{AvatarLink, ConnectionState};
use crate::chunker::{build_chunks, Chunk};
use crate::config::SpeechConfig;
use crate::emotion::EmotionTag;
use crate::history::{Outcome, SpeechHistory, SpeechRecord};
use crate::observer::Utterance;
use crate::playback::AudioSink;
use crate::settings::Settings;
use crate::synthesis::Synthesizer;
use crate::timer::deadline;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechState {
    #[default]
    Idle,
    Playing,
}

/// Snapshot published after every state change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub state: SpeechState,
    pub current: Option<String>,
    pub queued: usize,
    pub cached: usize,
    pub inflight: usize,
    pub played: u64,
    pub failed: u64,
    /// Set after a fatal error; cleared only by a restart.
    pub disabled: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub max_prefetch: usize,
    pub prefetch_wait: Duration,
    pub chunk_max_chars: usize,
}

impl From<&SpeechConfig> for PipelineOptions {
    fn from(config: &SpeechConfig) -> Self {
        Self {
            max_prefetch: config.max_prefetch.max(1),
            prefetch_wait: Duration::from_millis(config.prefetch_wait_ms),
            chunk_max_chars: config.chunk_max_chars,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from(&SpeechConfig::default())
    }
}

/// Collaborators the pipeline drives.
pub struct PipelineDeps {
    pub synthesizer: Arc<dyn Synthesizer>,
    pub sink: Arc<dyn AudioSink>,
    pub avatar: Option<Arc<dyn AvatarLink>>,
    pub settings: watch::Receiver<Settings>,
    pub history: Option<SpeechHistory>,
}

/// Handle to the pipeline actor. Cheap to clone.
#[derive(Clone)]
pub struct SpeechPipeline {
    tx: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<PipelineStatus>,
    chunk_max_chars: usize,
}

impl SpeechPipeline {
    pub fn spawn(deps: PipelineDeps, options: PipelineOptions, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(PipelineStatus::default());
        let chunk_max_chars = options.chunk_max_chars;
        let actor = Actor::new(deps, options, tx.clone(), status_tx);
        tokio::spawn(actor.run(rx, cancel));
        Self {
            tx,
            status,
            chunk_max_chars,
        }
    }

    pub fn enqueue(&self, chunk: Chunk) {
        if self.tx.send(Event::Enqueue(chunk)).is_err() {
            debug!("Speech pipeline stopped, chunk dropped");
        }
    }

    /// Chunk, classify and enqueue one utterance. Returns the chunk count.
    pub fn enqueue_text(&self, text: &str) -> usize {
        let chunks = build_chunks(text, self.chunk_max_chars);
        let count = chunks.len();
        for chunk in chunks {
            self.enqueue(chunk);
        }
        count
    }

    pub fn status(&self) -> PipelineStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.status.clone()
    }
}

/// Feed observed utterances into the pipeline until the stream ends.
pub async fn speak_utterances(
    mut utterances: mpsc::UnboundedReceiver<Utterance>,
    pipeline: SpeechPipeline,
    cancel: CancellationToken,
) {
    loop {
        let utterance = tokio::select! {
            _ = cancel.cancelled() => return,
            next = utterances.recv() => match next {
                Some(u) => u,
                None => return,
            },
        };
        let count = pipeline.enqueue_text(&utterance.text);
        info!(
            "Speaking {} chars from {} in {count} chunk(s)",
            utterance.text.chars().count(),
            utterance.source
        );
    }
}

enum Event {
    Enqueue(Chunk),
    Prefetched {
        text: String,
        result: Result<Vec<u8>>,
        synth_ms: i64,
    },
    Synthesized {
        ticket: u64,
        result: Result<Vec<u8>>,
        synth_ms: i64,
    },
    Played {
        ticket: u64,
        result: Result<Duration>,
    },
}

struct CachedAudio {
    wav: Vec<u8>,
    synth_ms: i64,
}

/// The chunk currently being played, with what history needs about it.
struct Job {
    ticket: u64,
    chunk: Chunk,
    prefetched: bool,
    synth_ms: i64,
}

enum Phase {
    Idle,
    /// Head chunk's prefetch is in flight; wait for it until the deadline.
    Waiting {
        ticket: u64,
        chunk: Chunk,
        until: Instant,
    },
    Synthesizing {
        ticket: u64,
        chunk: Chunk,
    },
    Playing(Job),
}

struct SpeechSession {
    phase: Phase,
    queue: VecDeque<Chunk>,
    cache: HashMap<String, CachedAudio>,
    inflight: HashSet<String>,
    disabled: bool,
    played: u64,
    failed: u64,
}

impl SpeechSession {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            queue: VecDeque::new(),
            cache: HashMap::new(),
            inflight: HashSet::new(),
            disabled: false,
            played: 0,
            failed: 0,
        }
    }

    fn wanted(&self, text: &str) -> bool {
        self.queue.iter().any(|c| c.text == text)
    }

    fn current(&self) -> Option<&Chunk> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Waiting { chunk, .. } | Phase::Synthesizing { chunk, .. } => Some(chunk),
            Phase::Playing(job) => Some(&job.chunk),
        }
    }
}

struct Actor {
    synthesizer: Arc<dyn Synthesizer>,
    sink: Arc<dyn AudioSink>,
    avatar: Option<Arc<dyn AvatarLink>>,
    settings: watch::Receiver<Settings>,
    history: Option<SpeechHistory>,
    options: PipelineOptions,
    events: mpsc::UnboundedSender<Event>,
    status: watch::Sender<PipelineStatus>,
    session: SpeechSession,
    next_ticket: u64,
}

impl Actor {
    fn new(
        deps: PipelineDeps,
        options: PipelineOptions,
        events: mpsc::UnboundedSender<Event>,
        status: watch::Sender<PipelineStatus>,
    ) -> Self {
        Self {
            synthesizer: deps.synthesizer,
            sink: deps.sink,
            avatar: deps.avatar,
            settings: deps.settings,
            history: deps.history,
            options,
            events,
            status,
            session: SpeechSession::new(),
            next_ticket: 0,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>, cancel: CancellationToken) {
        loop {
            let wait_until = match &self.session.phase {
                Phase::Waiting { until, .. } => Some(*until),
                _ => None,
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Speech pipeline shutting down");
                    return;
                }
                Some(event) = rx.recv() => self.handle(event),
                _ = deadline(wait_until) => self.on_wait_timeout(),
            }
            self.publish();
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Enqueue(chunk) => self.on_enqueue(chunk),
            Event::Prefetched {
                text,
                result,
                synth_ms,
            } => self.on_prefetched(text, result, synth_ms),
            Event::Synthesized {
                ticket,
                result,
                synth_ms,
            } => self.on_synthesized(ticket, result, synth_ms),
            Event::Played { ticket, result } => self.on_played(ticket, result),
        }
    }

    fn on_enqueue(&mut self, chunk: Chunk) {
        if self.session.disabled {
            debug!("Speech disabled for this session, dropping chunk {}", chunk.sequence);
            return;
        }
        if !self.settings.borrow().enabled {
            debug!("Speech turned off, dropping chunk {}", chunk.sequence);
            return;
        }

        if matches!(self.session.phase, Phase::Idle) {
            self.cue_arm_pose(true);
            self.start(chunk);
        } else {
            self.session.queue.push_back(chunk);
            if self.session.queue.len() == 1 {
                self.prefetch_head();
            }
        }
    }

    /// Make `chunk` current: play from cache, wait on its prefetch, or
    /// synthesize it now. Then prefetch whatever is next in line.
    fn start(&mut self, chunk: Chunk) {
        self.next_ticket += 1;
        let ticket = self.next_ticket;

        if let Some(cached) = self.session.cache.remove(&chunk.text) {
            debug!("Chunk {} served from prefetch cache", chunk.sequence);
            self.play(
                Job {
                    ticket,
                    chunk,
                    prefetched: true,
                    synth_ms: cached.synth_ms,
                },
                cached.wav,
            );
        } else if self.session.inflight.contains(&chunk.text) {
            debug!("Chunk {} waiting for its prefetch", chunk.sequence);
            self.session.phase = Phase::Waiting {
                ticket,
                chunk,
                until: Instant::now() + self.options.prefetch_wait,
            };
        } else {
            self.synthesize(ticket, chunk);
        }

        self.prefetch_head();
    }

    fn synthesize(&mut self, ticket: u64, chunk: Chunk) {
        let synthesizer = self.synthesizer.clone();
        let events = self.events.clone();
        let text = chunk.text.clone();
        self.session.phase = Phase::Synthesizing { ticket, chunk };

        tokio::spawn(async move {
            let started = Instant::now();
            let result = synthesizer.synthesize(&text).await;
            let synth_ms = started.elapsed().as_millis() as i64;
            let _ = events.send(Event::Synthesized {
                ticket,
                result,
                synth_ms,
            });
        });
    }

    fn prefetch_head(&mut self) {
        if let Some(text) = self.session.queue.front().map(|c| c.text.clone()) {
            self.prefetch(text);
        }
    }

    /// Start a background synthesis unless one is cached, already running,
    /// or the in-flight limit is reached.
    fn prefetch(&mut self, text: String) {
        let session = &mut self.session;
        if session.cache.contains_key(&text) || session.inflight.contains(&text) {
            return;
        }
        if session.inflight.len() >= self.options.max_prefetch {
            debug!("Prefetch limit reached, skipping");
            return;
        }
        session.inflight.insert(text.clone());

        let synthesizer = self.synthesizer.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = synthesizer.synthesize(&text).await;
            let synth_ms = started.elapsed().as_millis() as i64;
            let _ = events.send(Event::Prefetched {
                text,
                result,
                synth_ms,
            });
        });
    }

    fn on_prefetched(&mut self, text: String, result: Result<Vec<u8>>, synth_ms: i64) {
        self.session.inflight.remove(&text);

        match mem::replace(&mut self.session.phase, Phase::Idle) {
            Phase::Waiting { ticket, chunk, .. } if chunk.text == text => {
                match result {
                    Ok(wav) => self.play(
                        Job {
                            ticket,
                            chunk,
                            prefetched: true,
                            synth_ms,
                        },
                        wav,
                    ),
                    Err(e) if e.is_fatal() => self.chunk_failed(chunk, e),
                    Err(e) => {
                        debug!("Prefetch for chunk {} failed ({e}), retrying now", chunk.sequence);
                        self.synthesize(ticket, chunk);
                    }
                }
                return;
            }
            other => self.session.phase = other,
        }

        match result {
            Ok(wav) if self.session.wanted(&text) => {
                self.session.cache.insert(text, CachedAudio { wav, synth_ms });
            }
            Ok(_) => debug!("Discarding prefetch nobody is waiting for"),
            Err(e) if e.is_fatal() => self.disable(&e),
            // The chunk gets a fresh attempt when its turn comes
            Err(e) => debug!("Prefetch failed: {e}"),
        }
    }

    fn on_wait_timeout(&mut self) {
        match mem::replace(&mut self.session.phase, Phase::Idle) {
            Phase::Waiting { ticket, chunk, .. } => {
                warn!(
                    "Prefetch for chunk {} not ready after {}ms, synthesizing directly",
                    chunk.sequence,
                    self.options.prefetch_wait.as_millis()
                );
                self.synthesize(ticket, chunk);
            }
            other => self.session.phase = other,
        }
    }

    fn on_synthesized(&mut self, ticket: u64, result: Result<Vec<u8>>, synth_ms: i64) {
        match mem::replace(&mut self.session.phase, Phase::Idle) {
            Phase::Synthesizing { ticket: current, chunk } if current == ticket => match result {
                Ok(wav) => self.play(
                    Job {
                        ticket,
                        chunk,
                        prefetched: false,
                        synth_ms,
                    },
                    wav,
                ),
                Err(e) => self.chunk_failed(chunk, e),
            },
            other => {
                self.session.phase = other;
                debug!("Ignoring stale synthesis result");
            }
        }
    }

    fn play(&mut self, job: Job, wav: Vec<u8>) {
        let emotion = job.chunk.emotion;
        let link = self.avatar_link();

        if let Some(link) = &link {
            if !emotion.is_neutral() {
                link.set_emotion(emotion);
                link.set_gesture(emotion);
            }
        }

        info!(
            "Playing chunk {} [{}]: {}",
            job.chunk.sequence, emotion.label, job.chunk.text
        );
        let ticket = job.ticket;
        self.session.phase = Phase::Playing(job);

        let sink = self.sink.clone();
        let events = self.events.clone();
        let mouth = link.clone();
        tokio::spawn(async move {
            let result = sink.play(wav, mouth).await;
            let _ = events.send(Event::Played { ticket, result });
        });

        if let Some(link) = &link {
            if emotion.is_neutral() {
                link.set_emotion(EmotionTag::neutral());
            }
        }
    }

    fn on_played(&mut self, ticket: u64, result: Result<Duration>) {
        let job = match mem::replace(&mut self.session.phase, Phase::Idle) {
            Phase::Playing(job) if job.ticket == ticket => job,
            other => {
                self.session.phase = other;
                return;
            }
        };

        match result {
            Ok(duration) => {
                self.session.played += 1;
                self.record(&job.chunk, Outcome::Played, job.prefetched, job.synth_ms, duration);
            }
            Err(e) => {
                self.session.failed += 1;
                warn!("Playback of chunk {} failed: {e}", job.chunk.sequence);
                self.record(&job.chunk, Outcome::Failed, job.prefetched, job.synth_ms, Duration::ZERO);
                if e.is_fatal() {
                    self.disable(&e);
                    return;
                }
            }
        }
        self.advance();
    }

    /// The current chunk could not be synthesized. Fatal errors stop the
    /// session; anything else skips to the next chunk.
    fn chunk_failed(&mut self, chunk: Chunk, err: Error) {
        self.session.failed += 1;
        warn!("Skipping chunk {}: {err}", chunk.sequence);
        self.record(&chunk, Outcome::Failed, false, 0, Duration::ZERO);
        if err.is_fatal() {
            self.disable(&err);
        } else {
            self.advance();
        }
    }

    /// Chunk boundary: take the next chunk unless speech has been turned
    /// off or disabled in the meantime.
    fn advance(&mut self) {
        if self.session.disabled || !self.settings.borrow().enabled {
            self.drop_queue();
            self.go_idle();
            return;
        }
        match self.session.queue.pop_front() {
            Some(next) => self.start(next),
            None => self.go_idle(),
        }
    }

    fn disable(&mut self, err: &Error) {
        if !self.session.disabled {
            warn!("Speech disabled for the rest of this session: {err}");
        }
        self.session.disabled = true;
        self.drop_queue();
        // A chunk already playing finishes; anything else stops here
        if !matches!(self.session.phase, Phase::Playing(_)) {
            self.go_idle();
        }
    }

    fn drop_queue(&mut self) {
        let dropped: Vec<Chunk> = self.session.queue.drain(..).collect();
        if !dropped.is_empty() {
            info!("Dropping {} queued chunk(s)", dropped.len());
        }
        for chunk in &dropped {
            self.record(chunk, Outcome::Skipped, false, 0, Duration::ZERO);
        }
        self.session.cache.clear();
    }

    fn go_idle(&mut self) {
        self.session.phase = Phase::Idle;
        self.cue_arm_pose(false);
        debug!("Speech queue idle");
    }

    fn avatar_link(&self) -> Option<Arc<dyn AvatarLink>> {
        if !self.settings.borrow().avatar_enabled {
            return None;
        }
        self.avatar
            .as_ref()
            .filter(|link| link.state() == ConnectionState::Connected)
            .cloned()
    }

    fn cue_arm_pose(&self, playing: bool) {
        if let Some(link) = self.avatar_link() {
            link.set_arm_pose(playing);
        }
    }

    fn record(
        &self,
        chunk: &Chunk,
        outcome: Outcome,
        prefetched: bool,
        synth_ms: i64,
        playback: Duration,
    ) {
        let Some(history) = &self.history else {
            return;
        };
        history.save(&SpeechRecord {
            timestamp: SpeechRecord::now(),
            sequence: chunk.sequence,
            text: chunk.text.clone(),
            emotion: chunk.emotion.label,
            intensity: chunk.emotion.intensity,
            prefetched,
            synthesis_latency_ms: synth_ms,
            playback_duration_ms: playback.as_millis() as i64,
            outcome,
        });
    }

    fn publish(&self) {
        let session = &self.session;
        self.status.send_replace(PipelineStatus {
            state: match session.phase {
                Phase::Idle => SpeechState::Idle,
                _ => SpeechState::Playing,
            },
            current: session.current().map(|c| c.text.clone()),
            queued: session.queue.len(),
            cached: session.cache.len(),
            inflight: session.inflight.len(),
            played: session.played,
            failed: session.failed,
            disabled: session.disabled,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::emotion::EmotionLabel;
    use crate::settings::SettingsStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Returns the text as audio after a per-text delay. Texts in `errors`
    /// fail with the error built for them.
    #[derive(Default)]
    struct FakeSynth {
        delays: HashMap<String, Duration>,
        errors: HashMap<String, fn() -> Error>,
        calls: Mutex<Vec<String>>,
        finished: Mutex<Vec<String>>,
    }

    impl FakeSynth {
        fn with_delays(delays: &[(&str, u64)]) -> Self {
            Self {
                delays: delays
                    .iter()
                    .map(|(t, ms)| (t.to_string(), Duration::from_millis(*ms)))
                    .collect(),
                ..Default::default()
            }
        }

        fn calls_for(&self, text: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|t| *t == text).count()
        }
    }

    #[async_trait]
    impl Synthesizer for FakeSynth {
        async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
            self.calls.lock().unwrap().push(text.to_string());
            let delay = self.delays.get(text).copied().unwrap_or(Duration::from_millis(100));
            tokio::time::sleep(delay).await;
            self.finished.lock().unwrap().push(text.to_string());
            match self.errors.get(text) {
                Some(make) => Err(make()),
                None => Ok(text.as_bytes().to_vec()),
            }
        }
    }

    /// Plays for a fixed time and records what it played.
    struct FakeSink {
        played: Mutex<Vec<String>>,
        duration: Duration,
    }

    impl Default for FakeSink {
        fn default() -> Self {
            Self {
                played: Mutex::new(Vec::new()),
                duration: Duration::from_millis(200),
            }
        }
    }

    impl FakeSink {
        fn played(&self) -> Vec<String> {
            self.played.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AudioSink for FakeSink {
        async fn play(&self, wav: Vec<u8>, _mouth: Option<Arc<dyn AvatarLink>>) -> Result<Duration> {
            self.played
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&wav).to_string());
            tokio::time::sleep(self.duration).await;
            Ok(self.duration)
        }
    }

    #[derive(Default)]
    struct FakeAvatar {
        cues: Mutex<Vec<String>>,
    }

    impl FakeAvatar {
        fn cues(&self) -> Vec<String> {
            self.cues.lock().unwrap().clone()
        }
    }

    impl AvatarLink for FakeAvatar {
        fn state(&self) -> ConnectionState {
            ConnectionState::Connected
        }
        fn set_mouth(&self, _openness: f32) {}
        fn set_arm_pose(&self, playing: bool) {
            self.cues.lock().unwrap().push(format!("arm:{playing}"));
        }
        fn set_emotion(&self, tag: EmotionTag) {
            self.cues.lock().unwrap().push(format!("emotion:{}", tag.label));
        }
        fn set_gesture(&self, tag: EmotionTag) {
            self.cues.lock().unwrap().push(format!("gesture:{}", tag.label));
        }
    }

    struct Harness {
        pipeline: SpeechPipeline,
        synth: Arc<FakeSynth>,
        sink: Arc<FakeSink>,
        avatar: Arc<FakeAvatar>,
        store: SettingsStore,
        _cancel: tokio_util::sync::DropGuard,
    }

    fn harness(synth: FakeSynth) -> Harness {
        let mut settings = Settings::from_config(&Config::default());
        settings.enabled = true;
        settings.avatar_enabled = true;
        let store = SettingsStore::ephemeral(settings);

        let synth = Arc::new(synth);
        let sink = Arc::new(FakeSink::default());
        let avatar = Arc::new(FakeAvatar::default());
        let cancel = CancellationToken::new();
        let pipeline = SpeechPipeline::spawn(
            PipelineDeps {
                synthesizer: synth.clone(),
                sink: sink.clone(),
                avatar: Some(avatar.clone() as Arc<dyn AvatarLink>),
                settings: store.subscribe(),
                history: None,
            },
            PipelineOptions::default(),
            cancel.clone(),
        );
        Harness {
            pipeline,
            synth,
            sink,
            avatar,
            store,
            _cancel: cancel.drop_guard(),
        }
    }

    fn chunk(sequence: usize, text: &str) -> Chunk {
        Chunk {
            text: text.to_string(),
            sequence,
            emotion: EmotionTag::neutral(),
        }
    }

    async fn wait_idle_after(pipeline: &SpeechPipeline, handled: u64) -> PipelineStatus {
        let mut status = pipeline.subscribe();
        let snapshot = status
            .wait_for(|s| s.state == SpeechState::Idle && s.played + s.failed >= handled)
            .await
            .unwrap()
            .clone();
        snapshot
    }

    #[tokio::test(start_paused = true)]
    async fn first_chunk_plays_rest_queue_in_order() {
        let h = harness(FakeSynth::default());
        h.pipeline.enqueue(chunk(0, "one"));
        h.pipeline.enqueue(chunk(1, "two"));
        h.pipeline.enqueue(chunk(2, "three"));

        let mut status = h.pipeline.subscribe();
        let snapshot = status.wait_for(|s| s.queued == 2).await.unwrap().clone();
        assert_eq!(snapshot.state, SpeechState::Playing);
        assert_eq!(snapshot.current.as_deref(), Some("one"));

        wait_idle_after(&h.pipeline, 3).await;
        assert_eq!(h.sink.played(), ["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn order_holds_when_later_prefetch_finishes_first() {
        let h = harness(FakeSynth::with_delays(&[("one", 100), ("two", 1500), ("three", 50)]));
        h.pipeline.enqueue(chunk(0, "one"));
        h.pipeline.enqueue(chunk(1, "two"));
        h.pipeline.enqueue(chunk(2, "three"));

        wait_idle_after(&h.pipeline, 3).await;
        assert_eq!(*h.synth.finished.lock().unwrap(), ["one", "three", "two"]);
        assert_eq!(h.sink.played(), ["one", "two", "three"]);
        // "two" was awaited, not synthesized twice
        assert_eq!(h.synth.calls_for("two"), 1);
        assert_eq!(h.synth.calls_for("three"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_prefetch_falls_back_to_fresh_synthesis() {
        let h = harness(FakeSynth::with_delays(&[("one", 100), ("two", 5000)]));
        h.pipeline.enqueue(chunk(0, "one"));
        h.pipeline.enqueue(chunk(1, "two"));

        let status = wait_idle_after(&h.pipeline, 2).await;
        assert_eq!(status.played, 2);
        assert_eq!(h.sink.played(), ["one", "two"]);
        assert_eq!(h.synth.calls_for("two"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_chunk_is_skipped() {
        let mut synth = FakeSynth::default();
        synth.errors.insert("two".into(), || Error::Rejected {
            status: 422,
            body: "bad text".into(),
        });
        let h = harness(synth);
        h.pipeline.enqueue(chunk(0, "one"));
        h.pipeline.enqueue(chunk(1, "two"));
        h.pipeline.enqueue(chunk(2, "three"));

        let status = wait_idle_after(&h.pipeline, 3).await;
        assert_eq!(h.sink.played(), ["one", "three"]);
        assert_eq!(status.played, 2);
        assert_eq!(status.failed, 1);
        assert!(!status.disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_disables_the_session() {
        // "one" is already playing when the prefetch of "two" fails
        let mut synth = FakeSynth::with_delays(&[("one", 50)]);
        synth
            .errors
            .insert("two".into(), || Error::LinkInvalidated("bad host".into()));
        let h = harness(synth);
        h.pipeline.enqueue(chunk(0, "one"));
        h.pipeline.enqueue(chunk(1, "two"));
        h.pipeline.enqueue(chunk(2, "three"));

        let mut status = h.pipeline.subscribe();
        status
            .wait_for(|s| s.disabled && s.state == SpeechState::Idle)
            .await
            .unwrap();

        h.pipeline.enqueue(chunk(3, "four"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.sink.played(), ["one"]);
        assert_eq!(h.synth.calls_for("four"), 0);
        assert_eq!(h.pipeline.status().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn turning_speech_off_drops_queue_at_next_boundary() {
        let h = harness(FakeSynth::default());
        h.pipeline.enqueue(chunk(0, "one"));
        h.pipeline.enqueue(chunk(1, "two"));

        let mut status = h.pipeline.subscribe();
        status.wait_for(|s| s.queued == 1).await.unwrap();
        h.store
            .update(&serde_json::json!({ "enabled": false }))
            .unwrap();

        let snapshot = wait_idle_after(&h.pipeline, 1).await;
        assert_eq!(snapshot.queued, 0);
        assert!(!snapshot.disabled);
        assert_eq!(h.sink.played(), ["one"]);

        h.store.update(&serde_json::json!({ "enabled": true })).unwrap();
        h.pipeline.enqueue(chunk(0, "again"));
        wait_idle_after(&h.pipeline, 2).await;
        assert_eq!(h.sink.played(), ["one", "again"]);
    }

    #[tokio::test(start_paused = true)]
    async fn avatar_cues_follow_chunks() {
        let h = harness(FakeSynth::default());
        h.pipeline.enqueue(Chunk {
            text: "ありがとう".into(),
            sequence: 0,
            emotion: EmotionTag {
                label: EmotionLabel::Grateful,
                intensity: 0.85,
            },
        });
        h.pipeline.enqueue(chunk(1, "以上です"));

        wait_idle_after(&h.pipeline, 2).await;
        assert_eq!(
            h.avatar.cues(),
            [
                "arm:true",
                "emotion:grateful",
                "gesture:grateful",
                "emotion:neutral",
                "arm:false",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn avatar_disabled_in_settings_gets_no_cues() {
        let h = harness(FakeSynth::default());
        h.store
            .update(&serde_json::json!({ "avatar_enabled": false }))
            .unwrap();
        h.pipeline.enqueue_text("ありがとうなのだ！");
        wait_idle_after(&h.pipeline, 1).await;
        assert!(h.avatar.cues().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_is_bounded_and_deduplicated() {
        let store = SettingsStore::ephemeral(Settings::from_config(&Config::default()));
        let (events, mut rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(PipelineStatus::default());
        let mut actor = Actor::new(
            PipelineDeps {
                synthesizer: Arc::new(FakeSynth::default()),
                sink: Arc::new(FakeSink::default()),
                avatar: None,
                settings: store.subscribe(),
                history: None,
            },
            PipelineOptions {
                max_prefetch: 5,
                ..Default::default()
            },
            events,
            status,
        );

        for i in 0..7 {
            actor.prefetch(format!("text {i}"));
        }
        actor.prefetch("text 0".into());
        assert_eq!(actor.session.inflight.len(), 5);

        // Results nobody queued are not cached
        for _ in 0..5 {
            let event = rx.recv().await.unwrap();
            actor.handle(event);
        }
        assert!(actor.session.inflight.is_empty());
        assert!(actor.session.cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn history_records_each_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::ephemeral(Settings::from_config(&Config::default()));
        let sink = Arc::new(FakeSink::default());
        let pipeline = SpeechPipeline::spawn(
            PipelineDeps {
                synthesizer: Arc::new(FakeSynth::default()),
                sink: sink.clone(),
                avatar: None,
                settings: store.subscribe(),
                history: Some(SpeechHistory::new(dir.path().to_path_buf())),
            },
            PipelineOptions::default(),
            CancellationToken::new(),
        );
        pipeline.enqueue(chunk(0, "one"));
        pipeline.enqueue(chunk(1, "two"));
        wait_idle_after(&pipeline, 2).await;

        let records = SpeechHistory::new(dir.path().to_path_buf()).load("today");
        assert_eq!(records.len(), 2);
        assert!(!records[0].prefetched);
        assert!(records[1].prefetched);
        assert_eq!(records[1].playback_duration_ms, 200);
        assert!(records.iter().all(|r| r.outcome == Outcome::Played));
    }

    #[tokio::test(start_paused = true)]
    async fn greeting_is_spoken_as_one_neutral_chunk() {
        let text = "こんにちは。今日は天気がいいですね。";
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::from_config(&Config::default());
        settings.enabled = true;
        settings.avatar_enabled = true;
        let store = SettingsStore::ephemeral(settings);
        let synth = Arc::new(FakeSynth::default());
        let sink = Arc::new(FakeSink::default());
        let avatar = Arc::new(FakeAvatar::default());
        let cancel = CancellationToken::new();
        let pipeline = SpeechPipeline::spawn(
            PipelineDeps {
                synthesizer: synth.clone(),
                sink: sink.clone(),
                avatar: Some(avatar.clone() as Arc<dyn AvatarLink>),
                settings: store.subscribe(),
                history: Some(SpeechHistory::new(dir.path().to_path_buf())),
            },
            PipelineOptions::default(),
            cancel.clone(),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(speak_utterances(rx, pipeline.clone(), cancel.clone()));
        tx.send(Utterance {
            raw_text: text.to_string(),
            text: text.to_string(),
            source: crate::observer::MessageKey { node: 7, index: 0 },
        })
        .unwrap();

        let status = wait_idle_after(&pipeline, 1).await;
        assert_eq!(status.state, SpeechState::Idle);
        assert_eq!(status.queued, 0);
        assert_eq!(status.current, None);
        assert_eq!(status.played, 1);
        assert_eq!(status.failed, 0);

        assert_eq!(synth.calls.lock().unwrap().as_slice(), [text]);
        assert_eq!(sink.played(), [text]);

        let records = SpeechHistory::new(dir.path().to_path_buf()).load("today");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence, 0);
        assert_eq!(records[0].emotion, EmotionLabel::Neutral);
        assert_eq!(records[0].intensity, 0.0);
        assert!(!avatar.cues().iter().any(|c| c.starts_with("gesture:")));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn utterance_to_speech() {
        let h = harness(FakeSynth::default());
        let normalizer = crate::normalizer::Normalizer::new(
            crate::normalizer::ScrubPolicy::default(),
        );
        let text = normalizer.normalize_html("<p>ファイルを保存しました。ありがとうございます！</p>");

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(speak_utterances(rx, h.pipeline.clone(), cancel.clone()));
        tx.send(Utterance {
            raw_text: text.clone(),
            text: text.clone(),
            source: crate::observer::MessageKey { node: 1, index: 0 },
        })
        .unwrap();

        wait_idle_after(&h.pipeline, 1).await;
        assert_eq!(h.synth.calls_for(&text), 1);
        assert_eq!(h.sink.played(), [text]);
        assert!(h.avatar.cues().contains(&"emotion:grateful".to_string()));
        cancel.cancel();
    }
}
