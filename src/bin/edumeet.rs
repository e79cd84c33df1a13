use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use edumeet::auth::{AuthClient, SessionContext};
use edumeet::config::Config;
use edumeet::media::FileCapture;
use edumeet::rtc::RtcPeerConnector;
use edumeet::sign::HttpSignSource;
use edumeet::signaling::WsConnector;
use edumeet::toon::ToonClient;
use edumeet::transcription::{FeedRecognizer, RecognitionResult};
use edumeet::{logging, CallSession, CallState, Services, UiEvent};

#[derive(Parser, Debug)]
#[command(version, about = "EduMeet rooms and EduToon uploads from the terminal")]
struct Cli {
    /// TOML configuration file
    #[arg(long, short, env = "EDUMEET_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[arg(long, env = "EDUMEET_SIGNALING_URL", global = true)]
    signaling_url: Option<String>,

    #[arg(long, env = "EDUMEET_SIGN_SERVICE_URL", global = true)]
    sign_service_url: Option<String>,

    #[arg(long, env = "EDUMEET_MEDIA_BACKEND_URL", global = true)]
    media_backend_url: Option<String>,

    /// IVF (VP8) file used as the camera
    #[arg(long, env = "EDUMEET_VIDEO_FILE", global = true)]
    video_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a room and drive the call from stdin
    Meet { room: String },
    Login {
        username: String,
        #[arg(long, env = "EDUMEET_PASSWORD")]
        password: String,
    },
    Register {
        username: String,
        #[arg(long, env = "EDUMEET_PASSWORD")]
        password: String,
        /// Defaults to the password
        #[arg(long)]
        confirm: Option<String>,
    },
    Logout,
    /// Send a document for summary and media generation
    Upload { document: PathBuf },
}

impl Cli {
    fn config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(url) = &self.signaling_url {
            config.signaling_url = url.clone();
        }
        if let Some(url) = &self.sign_service_url {
            config.sign_service_url = url.clone();
        }
        if let Some(url) = &self.media_backend_url {
            config.media_backend_url = url.clone();
        }
        if let Some(file) = &self.video_file {
            config.capture.video_file = Some(file.clone());
        }
        Ok(config)
    }
}

const HELP: &str = "/call /mute /camera /transcribe /say <text> /signs /leave; anything else is chat";

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(logging::DEFAULT_DIRECTIVE);
    let cli = Cli::parse();
    let config = cli.config()?;
    let context = SessionContext::load(&config.session_file)?;

    match cli.command {
        Command::Meet { room } => meet(&config, &room).await,
        Command::Login { username, password } => {
            let context = auth_client(&config)?.login(&username, &password).await?;
            context.save(&config.session_file)?;
            println!("Welcome, {}!", context.username_or_guest());
            Ok(())
        }
        Command::Register {
            username,
            password,
            confirm,
        } => {
            let confirm = confirm.unwrap_or_else(|| password.clone());
            auth_client(&config)?
                .register(&username, &password, &confirm)
                .await?;
            println!("User registered successfully!");
            Ok(())
        }
        Command::Logout => {
            SessionContext::clear(&config.session_file)?;
            println!("Logged out");
            Ok(())
        }
        Command::Upload { document } => {
            let username = context.require_login()?;
            let client = ToonClient::new(&config.media_backend_url);
            let playback = client
                .upload(&document, username)
                .await?
                .render(client.origin());
            println!("Summary: {}", playback.summary);
            for video in &playback.videos {
                println!("Video: {}", video);
            }
            match &playback.audio {
                Some(audio) => println!("Audio: {}", audio),
                None => println!("No audio narration available."),
            }
            Ok(())
        }
    }
}

fn auth_client(config: &Config) -> Result<AuthClient> {
    let Some(url) = &config.auth.url else {
        bail!("auth.url is not configured");
    };
    Ok(AuthClient::new(
        url,
        config.auth.api_key.clone(),
        &config.auth.table,
    ))
}

async fn meet(config: &Config, room: &str) -> Result<()> {
    let feed = FeedRecognizer::default();
    let services = Services {
        signaling: Arc::new(WsConnector::new(config.signaling_url.clone())),
        capture: Arc::new(FileCapture::new(
            config.capture.video_file.clone(),
            config.capture.audio,
        )),
        peers: Arc::new(RtcPeerConnector::new(config.ice_servers.clone())),
        recognizer: Some(Arc::new(feed.clone())),
        signs: Arc::new(HttpSignSource::new(
            &config.sign_service_url,
            config.poll_interval(),
        )?),
        sign_interval: config.poll_interval(),
    };

    let (mut session, mut inbox) = CallSession::new(services);
    let mut updates = session.subscribe();
    session
        .join(room)
        .await
        .with_context(|| format!("Could not join room {}", room))?;
    println!("Joined {}. {}", room, HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !command(&mut session, &feed, line.trim()).await {
                    break;
                }
            }
            Some(tagged) = inbox.recv() => session.handle_event(tagged).await,
            update = updates.recv() => match update {
                Ok(UiEvent::StateChanged(CallState::Ended)) => {
                    println!("Call ended");
                    break;
                }
                Ok(event) => render(event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.end_call().await;
    Ok(())
}

/// Returns false when the user asked to leave.
async fn command(session: &mut CallSession, feed: &FeedRecognizer, line: &str) -> bool {
    let outcome = match line {
        "" => Ok(()),
        "/leave" => return false,
        "/call" => session.start_call().await,
        "/mute" => session
            .toggle_mute()
            .map(|on| println!("Microphone {}", if on { "on" } else { "muted" })),
        "/camera" => session
            .toggle_camera()
            .map(|on| println!("Camera {}", if on { "on" } else { "off" })),
        "/transcribe" => {
            let on = session.toggle_transcription();
            println!("Transcription {}", if on { "on" } else { "off" });
            Ok(())
        }
        "/signs" => {
            if session.is_polling_signs() {
                session.stop_sign_polling();
            } else {
                session.start_sign_polling();
            }
            Ok(())
        }
        "/help" => {
            println!("{}", HELP);
            Ok(())
        }
        _ => match say_text(line) {
            Some(text) => {
                if !feed.push(RecognitionResult::single(text, true)) {
                    println!("Transcription is off; /transcribe first");
                }
                Ok(())
            }
            None => session.send_chat(line),
        },
    };
    if let Err(e) = outcome {
        println!("{}", e);
    }
    true
}

/// Text after `/say`; `None` for any other line, `/sayings` included.
fn say_text(line: &str) -> Option<&str> {
    match line.strip_prefix("/say")? {
        "" => Some(""),
        rest if rest.starts_with(char::is_whitespace) => Some(rest.trim()),
        _ => None,
    }
}

fn render(event: UiEvent) {
    match event {
        UiEvent::StateChanged(state) => println!("[{:?}]", state),
        UiEvent::ChatAppended(entry) => println!("{:?}: {}", entry.origin, entry.text),
        UiEvent::TranscriptChanged(segment) => {
            println!("~ {:?} ({:?}): {}", segment.origin, segment.kind, segment.text)
        }
        UiEvent::SignLabelChanged(label) => println!("Sign: {}", label),
        UiEvent::RemoteStreamChanged(Some(stream)) => {
            println!("Remote stream {} attached", stream.stream_id)
        }
        UiEvent::RemoteStreamChanged(None) => println!("Remote stream gone"),
    }
}
