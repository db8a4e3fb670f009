mod settings;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use voxlink_core::{
    audio::device::{list_input_devices, list_output_devices},
    AudioDevices, GeminiLiveConnector, SessionStatus, VoiceSession,
};

use crate::settings::{default_settings_path, load_settings, save_settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voxlink=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--list-devices") {
        print_devices();
        return Ok(());
    }

    // ── Settings ──────────────────────────────────────────────────────────
    let settings_path = default_settings_path();
    if !settings_path.exists() {
        match save_settings(&settings_path, &Default::default()) {
            Ok(()) => info!(settings_path = ?settings_path, "wrote default settings"),
            Err(e) => warn!("could not write default settings: {e}"),
        }
    }
    let mut app_settings = load_settings(&settings_path);
    app_settings.apply_env_overrides();
    if let Some(language) = args.iter().find(|a| !a.starts_with("--")) {
        app_settings.language = language.clone();
        app_settings.normalize();
    }
    info!(
        settings_path = ?settings_path,
        language = %app_settings.language,
        model = %app_settings.model,
        has_api_key = app_settings.api_key.is_some(),
        "runtime settings loaded"
    );

    // ── Session setup ─────────────────────────────────────────────────────
    let connector = Arc::new(GeminiLiveConnector::new(app_settings.gemini_config()));
    let devices = AudioDevices::system(
        app_settings.preferred_input_device.clone(),
        app_settings.preferred_output_device.clone(),
    );
    let session = Arc::new(VoiceSession::new(
        app_settings.session_config(),
        connector,
        devices,
    ));

    let mut status_rx = session.subscribe_status();
    let mut transcript_rx = session.subscribe_transcript();
    let mut closed_rx = session.subscribe_closed();

    session
        .activate(&app_settings.language)
        .context("failed to activate voice session")?;
    println!("voice mode ({}), press Ctrl+C to stop", app_settings.language);

    // ── Event forwarding ──────────────────────────────────────────────────
    let stop_session = Arc::clone(&session);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, closing session");
            stop_session.deactivate();
        }
    });

    loop {
        tokio::select! {
            status = status_rx.recv() => match status {
                Ok(event) => {
                    let label = match event.status {
                        SessionStatus::Idle => "idle",
                        SessionStatus::Connecting => "connecting…",
                        SessionStatus::Listening => "listening",
                        SessionStatus::Speaking => "speaking",
                    };
                    match event.detail {
                        Some(detail) => println!("[{label}] {detail}"),
                        None => println!("[{label}]"),
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "status events lagged"),
                Err(RecvError::Closed) => break,
            },
            transcript = transcript_rx.recv() => match transcript {
                Ok(event) if event.text.is_empty() => println!(),
                Ok(event) => println!("model: {}", event.text),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "transcript events lagged"),
                Err(RecvError::Closed) => break,
            },
            closed = closed_rx.recv() => {
                if let Ok(event) = closed {
                    if event.reason.is_error() {
                        eprintln!(
                            "session ended: {}",
                            event.reason.detail().unwrap_or("unknown error")
                        );
                    }
                }
                break;
            }
        }
    }

    session.join().await;
    let diagnostics = serde_json::to_string_pretty(&session.diagnostics())?;
    info!("session diagnostics:\n{diagnostics}");
    Ok(())
}

fn print_devices() {
    println!("input devices:");
    for device in list_input_devices() {
        println!(
            "  {}{}{}",
            device.name,
            if device.is_default { " (default)" } else { "" },
            if device.is_loopback_like { " [loopback]" } else { "" }
        );
    }
    println!("output devices:");
    for device in list_output_devices() {
        println!(
            "  {}{}",
            device.name,
            if device.is_default { " (default)" } else { "" }
        );
    }
}
