//! Replay a recorded utterance through a full conversation session.
//!
//! Usage: `parley-replay <config.toml> <input.wav> <output> [profile]`
//!
//! The input WAV (16-bit mono at the profile's STT rate) is fed in 20 ms
//! chunks at real-time pace. Transcripts and assistant text go to stdout;
//! synthesized audio is written to `<output>`, as a WAV file when
//! `transport.add_wav_header` is set and as raw PCM otherwise.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use bytes::{Bytes, BytesMut};
use parley::config::TransportConfig;
use parley::llm::{MemoryRouter, OllamaClient};
use parley::stt::HttpRecognizer;
use parley::tools::ToolRegistry;
use parley::tts::WebSocketTts;
use parley::{AppConfig, AudioChunk, Backends, PipelineEvent, Session};
use tracing::info;
use tracing_subscriber::EnvFilter;

const CHUNK_MS: u32 = 20;

struct Args {
    config: PathBuf,
    input: PathBuf,
    output: PathBuf,
    profile: Option<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let (Some(config), Some(input), Some(output)) = (args.next(), args.next(), args.next())
    else {
        bail!("usage: parley-replay <config.toml> <input.wav> <output> [profile]");
    };
    Ok(Args {
        config: config.into(),
        input: input.into(),
        output: output.into(),
        profile: args.next(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the conversation.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley=info")),
        )
        .init();

    let args = parse_args()?;
    let app = AppConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let profile = app.profile(args.profile.as_deref())?.clone();
    let pcm = read_wav(&args.input, profile.stt.sample_rate_hz)?;
    let chunk_bytes = (profile.stt.sample_rate_hz * CHUNK_MS / 1000 * 2) as usize;
    let output_rate = profile.tts.sample_rate_hz;

    let backends = Backends {
        speech: Arc::new(HttpRecognizer::new(&profile.stt)?),
        llm: Arc::new(OllamaClient::new(&profile.llm)?),
        tts: Arc::new(WebSocketTts::new(&profile.tts)?),
        tools: Arc::new(ToolRegistry::with_defaults()),
        router: Arc::new(MemoryRouter::new()),
    };
    let mut session = Session::new(profile, backends)?.with_idle_timeout(
        app.transport
            .session_timeout_secs
            .map(Duration::from_secs),
    );
    let mut events = session.start()?;
    let printer = tokio::spawn(async move {
        let mut audio = BytesMut::new();
        while let Some(event) = events.recv().await {
            match event {
                PipelineEvent::Transcript(segment) if segment.is_final => {
                    println!("user: {}", segment.text);
                }
                PipelineEvent::AssistantToken(token) => print!("{token}"),
                PipelineEvent::ToolCall(call) => println!("[tool: {}]", call.name),
                PipelineEvent::Interruption { epoch } => println!("[interrupted #{epoch}]"),
                PipelineEvent::AudioOut(chunk) => audio.extend_from_slice(&chunk),
                PipelineEvent::EndOfTurn => println!(),
                _ => {}
            }
        }
        audio.freeze()
    });

    info!(chunks = pcm.len().div_ceil(chunk_bytes.max(1)), "replaying input");
    let mut pace = tokio::time::interval(Duration::from_millis(u64::from(CHUNK_MS)));
    for chunk in pcm.chunks(chunk_bytes.max(2)) {
        pace.tick().await;
        session
            .send_audio(AudioChunk::new(Bytes::copy_from_slice(chunk)))
            .await?;
    }

    let history = session.join().await;
    let audio = printer.await?;
    write_output(&args.output, &app.transport, &audio, output_rate)?;
    info!(
        messages = history.len(),
        audio_bytes = audio.len(),
        output = %args.output.display(),
        "replay finished"
    );
    Ok(())
}

/// Read a 16-bit mono WAV as little-endian PCM bytes.
fn read_wav(path: &Path, expected_rate: u32) -> anyhow::Result<Vec<u8>> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 {
        bail!(
            "{} must be 16-bit mono, got {} channel(s) at {} bits",
            path.display(),
            spec.channels,
            spec.bits_per_sample
        );
    }
    if spec.sample_rate != expected_rate {
        bail!(
            "{} is {} Hz but the profile expects {} Hz",
            path.display(),
            spec.sample_rate,
            expected_rate
        );
    }
    let mut pcm = Vec::with_capacity(reader.len() as usize * 2);
    for sample in reader.samples::<i16>() {
        pcm.extend_from_slice(&sample?.to_le_bytes());
    }
    Ok(pcm)
}

fn write_output(
    path: &Path,
    transport: &TransportConfig,
    pcm: &[u8],
    sample_rate: u32,
) -> anyhow::Result<()> {
    if !transport.add_wav_header {
        std::fs::write(path, pcm).with_context(|| format!("writing {}", path.display()))?;
        return Ok(());
    }
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("creating {}", path.display()))?;
    for pair in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
    }
    writer.finalize()?;
    Ok(())
}
