//! Audible cue and terminal notifications.
//!
//! The cue is fire-and-forget: [`AudioCue::play`] queues a sound and returns
//! at once. [`RodioCue`] owns the audio device on a dedicated thread because
//! the rodio output stream cannot move between threads. When no device is
//! available the daemon falls back to [`TerminalBell`].
//!
//! [`emit_terminal_notifications`] is used by the CLI to surface lifecycle
//! changes as desktop notifications in terminals that support them.

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{Context, Result};
use rodio::source::{SineWave, Source};
use rodio::{Decoder, OutputStream, Sink};

use crate::session::config::CueSettings;

/// Pitch and length of the synthesized click
const CLICK_FREQUENCY_HZ: f32 = 1760.0;
const CLICK_DURATION: Duration = Duration::from_millis(60);

/// Plays the "clicked" sound
pub trait AudioCue: Send + Sync {
    fn play(&self);
}

/// Rodio-backed cue running on its own thread
pub struct RodioCue {
    tx: mpsc::Sender<()>,
}

impl RodioCue {
    /// Open the default output device. Fails when there is no usable device.
    pub fn start(settings: CueSettings) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        std::thread::Builder::new()
            .name("clicker-audio".to_string())
            .spawn(move || {
                // The stream must outlive the sink, so both stay on this thread
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let sink = match Sink::try_new(&handle) {
                    Ok(sink) => sink,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                sink.set_volume(settings.volume);
                let _ = ready_tx.send(Ok(()));

                while rx.recv().is_ok() {
                    queue_cue(&sink, &settings);
                }
            })
            .context("Failed to spawn audio thread")?;

        ready_rx
            .recv()
            .context("Audio thread exited during startup")?
            .map_err(|e| anyhow::anyhow!("Failed to open audio device: {}", e))?;

        Ok(Self { tx })
    }
}

impl AudioCue for RodioCue {
    fn play(&self) {
        if self.tx.send(()).is_err() {
            tracing::warn!("audio thread is gone, cue dropped");
        }
    }
}

fn queue_cue(sink: &Sink, settings: &CueSettings) {
    if let Some(path) = &settings.sound_file {
        match File::open(path)
            .map_err(anyhow::Error::from)
            .and_then(|file| Decoder::new(BufReader::new(file)).map_err(anyhow::Error::from))
        {
            Ok(source) => {
                sink.append(source);
                return;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot play sound file, using click");
            }
        }
    }

    sink.append(
        SineWave::new(CLICK_FREQUENCY_HZ)
            .take_duration(CLICK_DURATION)
            .amplify(0.5),
    );
}

/// Rings the terminal bell. Used when no audio device can be opened.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalBell;

impl AudioCue for TerminalBell {
    fn play(&self) {
        let mut stdout = io::stdout();
        let _ = stdout.write_all(b"\x07");
        let _ = stdout.flush();
    }
}

/// Best available cue for this machine
pub fn default_cue(settings: &CueSettings) -> Arc<dyn AudioCue> {
    match RodioCue::start(settings.clone()) {
        Ok(cue) => Arc::new(cue),
        Err(e) => {
            tracing::warn!(error = %e, "no audio output, falling back to terminal bell");
            Arc::new(TerminalBell)
        }
    }
}

/// Emits terminal notification escape codes to stdout.
///
/// Writes several sequences so most terminal emulators show something:
/// - BEL (`\x07`) - Universal terminal bell
/// - OSC 9 (iTerm2) - Desktop notification
/// - OSC 777 (Konsole/VTE/Gnome Terminal) - Desktop notification
/// - OSC 99 (kitty) - Desktop notification
pub fn emit_terminal_notifications(title: &str, message: &str) {
    let mut stdout = io::stdout();
    let _ = stdout.write_all(notification_sequences(title, message).as_bytes());
    let _ = stdout.flush();
}

fn notification_sequences(title: &str, message: &str) -> String {
    let title = escape_osc(title);
    let message = escape_osc(message);

    let mut out = String::from("\x07");
    // OSC 9: ESC ] 9 ; message BEL
    out.push_str(&format!("\x1b]9;{}\x07", message));
    // OSC 777: ESC ] 777 ; notify ; title ; message BEL
    out.push_str(&format!("\x1b]777;notify;{};{}\x07", title, message));
    // OSC 99: d=0 keeps kitty quiet, the cue is our sound
    out.push_str(&format!(
        "\x1b]99;i=1:d=0:p=title;{}\x1b\\\x1b]99;i=1:d=0:p=body;{}\x1b\\",
        title, message
    ));
    out
}

/// OSC sequences end at BEL or ST, so those can't appear in the payload
fn escape_osc(s: &str) -> String {
    s.replace('\x07', "")
        .replace('\x1b', "")
        .replace('\n', " ")
        .replace('\r', "")
}
