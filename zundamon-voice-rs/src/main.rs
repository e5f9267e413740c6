//! zundamon-voice: speaks chat replies through VOICEVOX and maps mouse side
//! buttons to the page's voice input.

use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use zundamon_voice::api::{self, ApiState};
use zundamon_voice::avatar::{AvatarLink, RelayClient};
use zundamon_voice::config::Config;
use zundamon_voice::history::SpeechHistory;
use zundamon_voice::hotkey::HotkeyMonitor;
use zundamon_voice::normalizer::{Normalizer, ScrubPolicy};
use zundamon_voice::observer::Observer;
use zundamon_voice::pipeline::{speak_utterances, PipelineDeps, PipelineOptions, SpeechPipeline};
use zundamon_voice::playback::{AudioSink, RodioPlayer, Unavailable};
use zundamon_voice::service::VoiceInputController;
use zundamon_voice::settings::{settings_file, Settings, SettingsStore};
use zundamon_voice::synthesis::{SynthesisClient, VoicevoxHttp};

#[derive(Parser, Debug)]
#[command(name = "zundamon-voice", about = "Zundamon voice bridge for chat pages")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// API port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Do not monitor mouse side buttons
    #[arg(long)]
    no_hotkey: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy http/ws internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,hyper=info,hyper_util=info,tungstenite=info,html5ever=info")
    } else {
        EnvFilter::new("info,hyper=warn,tungstenite=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("zundamon-voice starting");

    let mut config = Config::load(args.config.as_deref());
    if let Some(port) = args.port {
        config.api.port = port;
    }
    info!("Config loaded: {:?}", config.voicevox);

    let settings = Arc::new(SettingsStore::load(
        settings_file(),
        Settings::from_config(&config),
    ));
    let cancel = CancellationToken::new();

    // Speech: VOICEVOX → rodio, optionally moving the avatar
    let transport = Arc::new(VoicevoxHttp::new(&config.voicevox)?);
    let synthesizer = Arc::new(SynthesisClient::new(
        transport,
        settings.subscribe(),
        config.voicevox.max_retries,
    ));
    let sink: Arc<dyn AudioSink> = match RodioPlayer::start() {
        Ok(player) => Arc::new(player),
        Err(e) => {
            warn!("{e}, speech stays silent this session");
            Arc::new(Unavailable::new(e.to_string()))
        }
    };
    let relay = RelayClient::start(&config.avatar, cancel.clone());
    let avatar_state = relay.as_ref().map(RelayClient::subscribe_state);
    let history = if config.speech.history {
        SpeechHistory::open_default()
    } else {
        None
    };

    let pipeline = SpeechPipeline::spawn(
        PipelineDeps {
            synthesizer,
            sink,
            avatar: relay.map(|r| Arc::new(r) as Arc<dyn AvatarLink>),
            settings: settings.subscribe(),
            history: history.clone(),
        },
        PipelineOptions::from(&config.speech),
        cancel.clone(),
    );

    // Page link → observer → pipeline
    let normalizer = Arc::new(Normalizer::new(ScrubPolicy::from_config(&config.normalizer)));
    let (page_tx, page_rx) = mpsc::channel(256);
    let utterances = Observer::new(normalizer.clone(), &config.observer).spawn(page_rx, cancel.clone());
    tokio::spawn(speak_utterances(utterances, pipeline.clone(), cancel.clone()));

    // Mouse side buttons → page commands
    let (commands, _) = broadcast::channel(32);
    if args.no_hotkey {
        info!("Mouse button monitoring disabled");
    } else {
        let (hotkey_tx, hotkey_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            if let Err(e) = HotkeyMonitor::new(hotkey_tx).run().await {
                warn!("Mouse buttons unavailable: {e}");
            }
        });
        let controller = VoiceInputController::new(
            settings.subscribe(),
            commands.clone(),
            Duration::from_millis(config.hotkey.send_delay_ms),
        );
        tokio::spawn(controller.run(hotkey_rx, cancel.clone()));
    }

    let state = ApiState {
        pipeline,
        normalizer,
        settings,
        history,
        avatar: avatar_state,
        page_events: page_tx,
        commands,
        pages: Arc::new(AtomicUsize::new(0)),
    };
    let mut server = tokio::spawn(api::serve(state, config.api.port, cancel.clone()));

    info!("Service ready on port {}", config.api.port);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        res = &mut server => {
            cancel.cancel();
            res??;
            return Ok(());
        }
    }

    cancel.cancel();
    server.await??;
    Ok(())
}
