use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use voxsync::karaoke::{validate_timings, TimingError, WordTiming};
use voxsync::playback::{PlayOutcome, PlaybackRequest, PlaybackStatus};
use voxsync::settings::{self, ClientSettings, SettingsError};
use voxsync::streaming::{ClientEvent, TranscriptAggregator};
use voxsync::{VoiceClient, VoiceError};

#[derive(Parser)]
#[command(name = "voxsync", version, about = "Voice playback and realtime transcription client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Play an audio source, optionally following word timings
    Play {
        /// data: URI, http(s) URL, file:// URL or path to a WAV file
        source: String,
        /// JSON array of {"word","start","end"} timings
        #[arg(long)]
        words: Option<PathBuf>,
        #[arg(long, default_value = "cli")]
        origin: String,
    },
    /// Record from the microphone and stream it for transcription; Enter stops
    Talk {
        /// Write the captured WAV here
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show the effective settings
    Settings {
        /// Write the effective settings to the settings file
        #[arg(long)]
        init: bool,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Voice(#[from] VoiceError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("Failed to read word timings {path:?}: {source}")]
    ReadWords {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid word timings: {0}")]
    ParseWords(#[from] serde_json::Error),
    #[error(transparent)]
    Timings(#[from] TimingError),
    #[error("Playback failed: {0}")]
    Playback(String),
    #[error("Failed to write {path:?}: {source}")]
    WriteAudio {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn main() -> ExitCode {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // wss:// endpoints need a process-wide crypto provider
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<(), CliError> {
    let settings = settings::load_settings();
    match command {
        Command::Play {
            source,
            words,
            origin,
        } => play(settings, source, words, origin).await,
        Command::Talk { out } => talk(settings, out).await,
        Command::Settings { init } => show_settings(&settings, init),
    }
}

// ----------------------------------------------------------------------------
// play
// ----------------------------------------------------------------------------

fn read_words(path: &Path) -> Result<Vec<WordTiming>, CliError> {
    let contents = std::fs::read_to_string(path).map_err(|source| CliError::ReadWords {
        path: path.to_path_buf(),
        source,
    })?;
    let words: Vec<WordTiming> = serde_json::from_str(&contents)?;
    validate_timings(&words)?;
    Ok(words)
}

async fn play(
    settings: ClientSettings,
    source: String,
    words: Option<PathBuf>,
    origin: String,
) -> Result<(), CliError> {
    let words = words.as_deref().map(read_words).transpose()?;
    let client = VoiceClient::local(settings)?;

    // Running the command counts as the user gesture
    client.on_user_gesture().await;

    let mut status = client.playback().watch_status();
    match client
        .playback()
        .play(PlaybackRequest::for_source(source, origin))
        .await
    {
        PlayOutcome::Started => {}
        PlayOutcome::Failed(e) => return Err(CliError::Playback(e.to_string())),
        other => return Err(CliError::Playback(format!("{:?}", other))),
    }

    let texts: Vec<String> = words
        .as_ref()
        .map(|w| w.iter().map(|word| word.text.clone()).collect())
        .unwrap_or_default();
    let mut karaoke = words.and_then(|w| client.karaoke_for_playback(w));
    let mut last_word = None;

    loop {
        tokio::select! {
            update = async {
                match karaoke.as_mut() {
                    Some(session) => session.next_update().await,
                    None => std::future::pending().await,
                }
            } => {
                let Some(update) = update else {
                    karaoke = None;
                    continue;
                };
                if update.word_index != last_word {
                    last_word = update.word_index;
                    if let Some(text) = update.word_index.and_then(|i| texts.get(i)) {
                        println!("{:>7.2}s  {}", update.elapsed_seconds, text);
                    }
                }
            }
            changed = status.changed() => {
                if changed.is_err() || *status.borrow() == PlaybackStatus::Idle {
                    break;
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

// ----------------------------------------------------------------------------
// talk
// ----------------------------------------------------------------------------

async fn talk(settings: ClientSettings, out: Option<PathBuf>) -> Result<(), CliError> {
    let client = VoiceClient::local(settings)?;
    let mut events = client.transcription().subscribe();

    let live = client.start_talk().await?;
    eprintln!("Recording. Press Enter to stop.");

    let mut aggregator = TranscriptAggregator::new();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = stdin.next_line() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&mut aggregator, event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Missed {} transcription events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let outcome = client.finish_talk(live).await?;

    // Events that arrived while the stream was flushing
    while let Ok(event) = events.try_recv() {
        print_event(&mut aggregator, event);
    }
    if aggregator.has_text() {
        println!("{}", aggregator.current_text());
    }

    match (outcome.audio, out) {
        (Some(audio), Some(path)) => {
            std::fs::write(&path, &audio.bytes)
                .map_err(|source| CliError::WriteAudio { path: path.clone(), source })?;
            eprintln!("Saved {:?} ({:.1}s) to {:?}", audio.mime_type, audio.duration.as_secs_f64(), path);
        }
        (Some(audio), None) => {
            eprintln!("Captured {} bytes ({:.1}s)", audio.bytes.len(), audio.duration.as_secs_f64());
        }
        (None, _) => eprintln!("Capture too short, discarded"),
    }
    Ok(())
}

fn print_event(aggregator: &mut TranscriptAggregator, event: ClientEvent) {
    match event {
        ClientEvent::Transcription(event) => {
            if aggregator.apply(&event) && aggregator.has_text() {
                eprintln!("... {}", aggregator.current_text());
            }
        }
        ClientEvent::Error(message) => eprintln!("error: {}", message),
        ClientEvent::GaveUp { attempts } => {
            eprintln!("Transcription unavailable after {} reconnect attempts", attempts);
        }
        _ => {}
    }
}

// ----------------------------------------------------------------------------
// settings
// ----------------------------------------------------------------------------

fn show_settings(settings: &ClientSettings, init: bool) -> Result<(), CliError> {
    if init {
        let path = settings::save_settings(settings)?;
        eprintln!("Wrote {:?}", path);
    } else if let Ok(path) = settings::settings_path() {
        eprintln!("Settings file: {:?}", path);
    }
    let json = serde_json::to_string_pretty(settings).map_err(SettingsError::from)?;
    println!("{}", json);
    Ok(())
}
