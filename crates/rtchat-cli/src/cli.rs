//! Interactive line-mode chat loop.
//!
//! Input is read on a dedicated thread and fed through a channel; replies
//! are rendered by a separate task as message events arrive, so a prompt
//! can be typed while a reply is still streaming.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use indicatif::ProgressBar;
use rtchat_core::realtime::{MessageEvent, MessageKind, RealtimeClient};
use rtchat_core::sync::lock;
use rtchat_core::{AppError, Config, Disposition, ErrorPolicy};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::commands::{Command, HELP_TEXT, unknown_command_message};
use crate::theme as t;

const WELCOME: &str = "Chat with Me!";
const DESCRIPTION: &str = "Ask me anything. Replies stream in as they are written.";
const GOODBYE: &str = "Goodbye!";
const PROMPT: &str = "> ";
const USER_PREFIX: &str = "You: ";
const CHAT_PREFIX: &str = "Chat: ";

type SpinnerSlot = Arc<Mutex<Option<ProgressBar>>>;

/// How the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Failed,
}

impl Outcome {
    pub fn is_failure(self) -> bool {
        self == Self::Failed
    }
}

pub struct Repl {
    config: Config,
    client: Arc<RealtimeClient>,
    policy: ErrorPolicy,
    spinner: SpinnerSlot,
    fatal: Arc<AtomicBool>,
}

impl Repl {
    pub fn new(config: Config, client: Arc<RealtimeClient>, policy: ErrorPolicy) -> Self {
        Self {
            config,
            client,
            policy,
            spinner: Arc::new(Mutex::new(None)),
            fatal: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Outcome {
        if let Err(err) = self.client.connect(&cancel).await {
            self.policy.handle(&err);
            return Outcome::Failed;
        }
        let (Some(messages), Some(errors)) = (self.client.take_messages(), self.client.take_errors())
        else {
            self.policy
                .handle(&AppError::error("chat output streams are unavailable"));
            return Outcome::Failed;
        };
        let output = tokio::spawn(render_output(
            messages,
            errors,
            self.spinner.clone(),
            self.policy,
            cancel.clone(),
            self.fatal.clone(),
        ));

        if let Err(err) = self.wait_until_ready(&cancel).await {
            self.policy.handle(&err);
            cancel.cancel();
            let _ = output.await;
            return Outcome::Failed;
        }

        self.show_welcome();
        let outcome = self.input_loop(&cancel).await;

        cancel.cancel();
        let _ = output.await;
        clear_spinner(&self.spinner);
        println!("\n{}", t::bold(GOODBYE));

        if self.fatal.load(Ordering::SeqCst) {
            Outcome::Failed
        } else {
            outcome
        }
    }

    async fn wait_until_ready(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        let interval = self.config.readiness_poll_interval();
        while !self.client.is_connected() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(AppError::error("failed to wait until ready")
                        .with_cause("cancelled before the session was created"));
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("Session ready");
        Ok(())
    }

    async fn input_loop(&self, cancel: &CancellationToken) -> Outcome {
        let mut lines = spawn_line_reader(self.config.channel_buffer);
        let mut show_prompt = true;
        loop {
            if show_prompt {
                print_prompt();
            }
            show_prompt = true;

            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                line = lines.recv() => line,
            };
            let line = match line {
                Some(Ok(line)) => line,
                Some(Err(err)) => {
                    self.policy
                        .handle(&AppError::error("input scanner error").with_cause(err));
                    return Outcome::Failed;
                }
                None => break,
            };

            match Command::parse(&line) {
                Command::Empty => {}
                Command::Quit => break,
                Command::Help => println!("{}", t::muted(HELP_TEXT)),
                Command::Clear => clear_screen(),
                Command::Debug => self.show_config(),
                Command::Functions => self.show_functions(),
                Command::Unknown(command) => {
                    eprintln!("{}", t::icon_warn(&unknown_command_message(&command)));
                }
                Command::Chat(text) => show_prompt = !self.send_chat(cancel, &text).await,
            }
        }
        Outcome::Finished
    }

    /// True when the message went out and the renderer owns the prompt.
    async fn send_chat(&self, cancel: &CancellationToken, text: &str) -> bool {
        println!("{}{}", t::user(USER_PREFIX), text);
        start_spinner(&self.spinner);
        match self.client.send_message(cancel, text).await {
            Ok(()) => true,
            Err(err) => {
                clear_spinner(&self.spinner);
                if self.policy.handle(&err) == Disposition::Terminate {
                    self.fatal.store(true, Ordering::SeqCst);
                    cancel.cancel();
                }
                false
            }
        }
    }

    fn show_welcome(&self) {
        t::print_banner(WELCOME);
        println!("{}", t::muted(DESCRIPTION));
        println!("{}", t::muted(HELP_TEXT));
        println!("{}", t::muted("Additional current custom functions:"));
        for name in self.client.available_functions() {
            println!("{}", t::muted(&format!(" - {name}")));
        }
        println!();
    }

    fn show_config(&self) {
        match self.config.info() {
            Ok(info) => println!("{}\n{}", t::bold("Debug config:"), info),
            Err(err) => eprintln!(
                "{}",
                t::icon_fail(&format!("failed to render configuration: {err}"))
            ),
        }
    }

    fn show_functions(&self) {
        println!("{}", t::bold("Available functions:"));
        for name in self.client.available_functions() {
            println!(" - {name}");
        }
    }
}

/// Read stdin on its own thread so a pending read never holds up shutdown.
fn spawn_line_reader(capacity: usize) -> mpsc::Receiver<io::Result<String>> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let failed = line.is_err();
            if tx.blocking_send(line).is_err() || failed {
                break;
            }
        }
    });
    rx
}

async fn render_output(
    mut messages: mpsc::Receiver<MessageEvent>,
    mut errors: mpsc::Receiver<AppError>,
    spinner: SpinnerSlot,
    policy: ErrorPolicy,
    cancel: CancellationToken,
    fatal: Arc<AtomicBool>,
) {
    let mut messages_open = true;
    let mut errors_open = true;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            report = errors.recv(), if errors_open => match report {
                Some(report) => {
                    let was_waiting = clear_spinner(&spinner);
                    if policy.handle(&report) == Disposition::Terminate {
                        fatal.store(true, Ordering::SeqCst);
                        cancel.cancel();
                        return;
                    }
                    if was_waiting {
                        print_prompt();
                    }
                }
                None => errors_open = false,
            },
            event = messages.recv(), if messages_open => match event {
                Some(event) => {
                    if let Err(err) = render_message(&event, &spinner) {
                        policy.handle(&AppError::warning("Response handler fault").with_cause(err));
                    }
                }
                None => messages_open = false,
            },
            else => return,
        }
    }
}

fn render_message(event: &MessageEvent, spinner: &SpinnerSlot) -> io::Result<()> {
    if matches!(event.kind, MessageKind::Prefix | MessageKind::Done) {
        clear_spinner(spinner);
    }
    let mut out = io::stdout().lock();
    match event.kind {
        MessageKind::Prefix => write!(out, "\r\x1b[K{}", t::assistant(CHAT_PREFIX))?,
        MessageKind::Delta if event.text.is_empty() => return Ok(()),
        MessageKind::Delta => write!(out, "{}", event.text)?,
        MessageKind::Done => write!(out, "\n{}", t::prompt(PROMPT))?,
    }
    out.flush()
}

fn print_prompt() {
    let mut out = io::stdout().lock();
    let _ = write!(out, "{}", t::prompt(PROMPT));
    let _ = out.flush();
}

fn clear_screen() {
    let mut out = io::stdout().lock();
    let _ = write!(out, "\x1b[2J\x1b[H");
    let _ = out.flush();
}

fn start_spinner(slot: &SpinnerSlot) {
    let previous = lock(slot).replace(t::spinner("Processing..."));
    if let Some(previous) = previous {
        previous.finish_and_clear();
    }
}

/// Returns whether a spinner was running.
fn clear_spinner(slot: &SpinnerSlot) -> bool {
    let current = lock(slot).take();
    match current {
        Some(spinner) => {
            spinner.finish_and_clear();
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_deltas_render_nothing() {
        let slot: SpinnerSlot = Arc::new(Mutex::new(None));
        assert!(render_message(&MessageEvent::delta(""), &slot).is_ok());
    }

    #[test]
    fn prefix_stops_the_spinner() {
        let slot: SpinnerSlot = Arc::new(Mutex::new(Some(ProgressBar::hidden())));
        render_message(&MessageEvent::prefix(), &slot).unwrap();
        assert!(lock(&slot).is_none());
        assert!(!clear_spinner(&slot));
    }

    #[test]
    fn final_event_stops_the_spinner() {
        let slot: SpinnerSlot = Arc::new(Mutex::new(Some(ProgressBar::hidden())));
        render_message(&MessageEvent::done(), &slot).unwrap();
        assert!(lock(&slot).is_none());
    }

    #[test]
    fn outcome_reports_failure() {
        assert!(Outcome::Failed.is_failure());
        assert!(!Outcome::Finished.is_failure());
    }

    #[tokio::test]
    async fn fatal_report_cancels_the_session() {
        let (_messages_tx, messages) = mpsc::channel(4);
        let (errors_tx, errors) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let fatal = Arc::new(AtomicBool::new(false));

        errors_tx
            .send(AppError::warning("reconnection attempt 1 failed"))
            .await
            .unwrap();
        errors_tx
            .send(AppError::error("failed to reconnect after 1 attempts"))
            .await
            .unwrap();
        render_output(
            messages,
            errors,
            Arc::new(Mutex::new(None)),
            ErrorPolicy::default(),
            cancel.clone(),
            fatal.clone(),
        )
        .await;

        assert!(cancel.is_cancelled());
        assert!(fatal.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn closed_streams_end_rendering() {
        let (messages_tx, messages) = mpsc::channel::<MessageEvent>(1);
        let (errors_tx, errors) = mpsc::channel::<AppError>(1);
        drop(messages_tx);
        drop(errors_tx);
        let cancel = CancellationToken::new();
        let fatal = Arc::new(AtomicBool::new(false));

        render_output(
            messages,
            errors,
            Arc::new(Mutex::new(None)),
            ErrorPolicy::default(),
            cancel.clone(),
            fatal.clone(),
        )
        .await;
        assert!(!cancel.is_cancelled());
        assert!(!fatal.load(Ordering::SeqCst));
    }
}
