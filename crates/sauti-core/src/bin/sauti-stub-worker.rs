//! Loopback worker for development and protocol testing.
//!
//! Speaks the engine's framed stdio protocol and fabricates plausible
//! outputs per capability instead of running a model. Behavior is
//! scriptable through the payload's text field:
//!
//! - `sleep:<ms>`  respond after a delay
//! - `fail:internal`  report an execution failure
//! - `fail:invalid`  reject the payload as malformed
//! - `crash`  exit mid-task
//! - `mute`  never respond to this task
//! - `misroute`  respond with a wrong correlation id
//!
//! Flags: `--ready-delay-ms <ms>` delays the ready signal (simulates model
//! loading), `--deny-probes` swallows probes (simulates a wedged worker).

use std::time::Duration;

use tokio::io::{stdin, stdout};

use sauti_core::protocol::{Frame, FrameKind, FrameReader, FrameWriter, WireErrorCode};
use sauti_core::Capability;

struct Options {
    ready_delay: Duration,
    deny_probes: bool,
}

fn parse_options() -> Options {
    let mut options = Options {
        ready_delay: Duration::ZERO,
        deny_probes: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--ready-delay-ms" => {
                let value = args.next().unwrap_or_default();
                let ms: u64 = value.parse().unwrap_or_else(|_| {
                    eprintln!("invalid --ready-delay-ms value '{value}'");
                    std::process::exit(2);
                });
                options.ready_delay = Duration::from_millis(ms);
            }
            "--deny-probes" => options.deny_probes = true,
            other => {
                eprintln!("unknown flag '{other}'");
                std::process::exit(2);
            }
        }
    }
    options
}

/// The scriptable directive, if any, hiding in a payload.
fn directive(body: &serde_json::Value) -> Option<String> {
    if let Some(text) = body.get("text").and_then(|v| v.as_str()) {
        return Some(text.to_string());
    }
    if let Some(audio) = body.get("audio_base64").and_then(|v| v.as_str()) {
        return Some(audio.to_string());
    }
    body.get("messages")
        .and_then(|v| v.as_array())
        .and_then(|msgs| msgs.last())
        .and_then(|msg| msg.get("content"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn fabricate_output(capability: Option<Capability>, directive: &str) -> serde_json::Value {
    match capability {
        Some(Capability::Synthesis) => serde_json::json!({
            "audio_base64": "c2F1dGktc3R1Yg==",
            "sample_rate": 24000,
            "duration_secs": 0.42,
        }),
        Some(Capability::Transcription) => serde_json::json!({
            "text": format!("transcript of {} bytes", directive.len()),
            "language": "en",
        }),
        Some(Capability::ActivityDetection) => serde_json::json!({
            "segments": [{"start_ms": 0, "end_ms": 300}],
            "speech_ratio": 0.5,
        }),
        Some(Capability::Chat) => serde_json::json!({
            "text": format!("ok: {directive}"),
            "tokens_generated": 3,
        }),
        None => serde_json::json!({}),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let options = parse_options();

    let mut reader = FrameReader::new(stdin());
    let mut writer = FrameWriter::new(stdout());

    if !options.ready_delay.is_zero() {
        tokio::time::sleep(options.ready_delay).await;
    }
    if writer.write(&Frame::ready()).await.is_err() {
        return;
    }

    loop {
        let frame = match reader.read().await {
            Ok(Some(frame)) => frame,
            // Engine closed stdin: graceful shutdown.
            Ok(None) => return,
            Err(e) => {
                eprintln!("stub-worker: bad input: {e}");
                std::process::exit(3);
            }
        };

        match frame.kind {
            FrameKind::Probe => {
                if options.deny_probes {
                    eprintln!("stub-worker: swallowing probe {}", frame.id);
                    continue;
                }
                if writer.write(&Frame::probe_ack(frame.id)).await.is_err() {
                    return;
                }
            }
            FrameKind::Request => {
                let body = frame.body.unwrap_or(serde_json::Value::Null);
                let script = directive(&body).unwrap_or_default();

                if let Some(ms) = script.strip_prefix("sleep:") {
                    let ms: u64 = ms.parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }

                let reply = if script == "crash" {
                    eprintln!("stub-worker: crashing on request");
                    std::process::exit(7);
                } else if script == "mute" {
                    continue;
                } else if script == "fail:internal" {
                    Frame::error(frame.id, WireErrorCode::Internal, "scripted failure")
                } else if script == "fail:invalid" {
                    Frame::error(
                        frame.id,
                        WireErrorCode::InvalidPayload,
                        "scripted rejection",
                    )
                } else if script == "misroute" {
                    Frame::response(
                        "not-the-request-id",
                        fabricate_output(frame.capability, &script),
                    )
                } else {
                    Frame::response(frame.id, fabricate_output(frame.capability, &script))
                };

                if writer.write(&reply).await.is_err() {
                    return;
                }
            }
            // The engine never sends these; tolerate and move on.
            other => eprintln!("stub-worker: ignoring {other:?} frame"),
        }
    }
}
