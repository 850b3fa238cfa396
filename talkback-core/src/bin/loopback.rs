//! Loopback demo: capture the microphone, feed the encoded chunks straight
//! back into the playback scheduler, and print volume levels.
//!
//! ```text
//! cargo run -p talkback-core --bin loopback -- [--seconds <n>] [--device <name>]
//! ```

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use talkback_core::{
    CaptureBridge, CaptureConfig, ContextTable, PlaybackConfig, PlaybackScheduler,
};

fn main() {
    if let Err(e) = run() {
        eprintln!("loopback failed: {e}");
        std::process::exit(1);
    }
}

struct Args {
    seconds: u64,
    device: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut seconds = 10u64;
    let mut device = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--seconds" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --seconds".into());
                };
                seconds = v
                    .parse::<u64>()
                    .map_err(|_| "invalid value for --seconds".to_string())?
                    .clamp(1, 120);
            }
            "--device" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --device".into());
                };
                device = Some(v);
            }
            "--help" | "-h" => {
                println!("Usage: loopback [--seconds <n>] [--device <name>]");
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(Args { seconds, device })
}

fn run() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;

    let runtime = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;
    runtime.block_on(async move {
        let contexts = Arc::new(ContextTable::probe().map_err(|e| e.to_string())?);

        let capture = CaptureBridge::new(
            CaptureConfig {
                preferred_device: args.device,
                ..CaptureConfig::default()
            },
            Arc::clone(&contexts),
        );
        // Loopback: play back at the capture wire rate instead of 24 kHz.
        let playback = Arc::new(PlaybackScheduler::new(
            PlaybackConfig {
                sample_rate: 16_000,
                frame_samples: 1_600,
                ..PlaybackConfig::default()
            },
            Arc::clone(&contexts),
        ));

        let mut chunks = capture.subscribe_chunks();
        let mut volume = capture.subscribe_volume();

        let feeder = {
            let playback = Arc::clone(&playback);
            tokio::spawn(async move {
                while let Ok(chunk) = chunks.recv().await {
                    match BASE64.decode(&chunk.audio) {
                        Ok(bytes) => {
                            if let Err(e) = playback.add_pcm16(&bytes) {
                                eprintln!("playback rejected chunk: {e}");
                                break;
                            }
                        }
                        Err(e) => eprintln!("bad chunk payload: {e}"),
                    }
                }
            })
        };

        let meter = tokio::spawn(async move {
            while let Ok(level) = volume.recv().await {
                let bars = (level.level * 40.0) as usize;
                println!("volume [{:<40}] {:.3}", "#".repeat(bars), level.level);
            }
        });

        capture.start().await.map_err(|e| e.to_string())?;
        println!("looping microphone to speakers for {} s …", args.seconds);
        tokio::time::sleep(Duration::from_secs(args.seconds)).await;

        capture.stop().await;
        playback.finish();
        tokio::time::sleep(Duration::from_millis(500)).await;
        playback.stop();

        feeder.abort();
        meter.abort();
        Ok(())
    })
}
