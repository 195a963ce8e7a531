use std::borrow::Cow;
use std::io::Read as _;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use std::{io, thread};

use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use log::LevelFilter;
use once_cell::sync::OnceCell;

use crate::config::Config;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

static VERBOSITY: OnceCell<LevelFilter> = OnceCell::new();
static CONFIG: OnceCell<Config> = OnceCell::new();

pub fn verbosity() -> &'static LevelFilter {
    VERBOSITY.get().unwrap_or(&LevelFilter::Info)
}

pub fn config() -> &'static Config {
    CONFIG.get().expect("config is not initialized")
}

pub fn set_global_verbosity(verbosity: LevelFilter) {
    VERBOSITY.set(verbosity).unwrap()
}

pub fn set_global_config(config: Config) {
    CONFIG.set(config).unwrap()
}

/// Cooperative cancellation shared between the caller and long-running
/// external commands. Cloning hands out another handle to the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Captured result of a finished (or killed) external command.
#[derive(Clone, Debug)]
pub struct Captured {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    /// Tool output for diagnostics: stderr when there is any, stdout
    /// otherwise, the exit code as a last resort.
    pub fn detail(&self) -> String {
        if !self.stderr.trim().is_empty() {
            self.stderr.trim().to_string()
        } else if !self.stdout.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            format!("exit code {:?}", self.code)
        }
    }
}

/// How a monitored command concluded.
#[derive(Debug)]
pub enum Monitored {
    Finished(Captured),
    TimedOut(Captured),
    Cancelled(Captured),
}

pub fn render_command(command: &Command) -> String {
    format!(
        "{} {}",
        command.get_program().to_string_lossy(),
        command
            .get_args()
            .map(|arg| arg.to_string_lossy())
            .join(" ")
    )
}

/// Run a command behind a spinner, with optional deadline and cooperative
/// cancellation. Output is drained on reader threads while the parent polls
/// child exit, the token, and the clock. Spawn failure is the only `Err`
/// case; everything else is reported through [`Monitored`].
pub fn run_monitored(
    command: &mut Command,
    message: impl Into<Cow<'static, str>>,
    deadline: Option<Duration>,
    cancel: &CancelToken,
) -> io::Result<Monitored> {
    let progress_bar = progress_bar();
    progress_bar.set_message(message);
    let result = monitor(command, deadline, cancel);
    progress_bar.finish_and_clear();
    result
}

/// [`run_monitored`] without the spinner, for commands that run concurrently
/// with one another (a shared terminal cannot host several spinners).
pub fn run_quiet(
    command: &mut Command,
    deadline: Option<Duration>,
    cancel: &CancelToken,
) -> io::Result<Monitored> {
    monitor(command, deadline, cancel)
}

fn monitor(
    command: &mut Command,
    deadline: Option<Duration>,
    cancel: &CancelToken,
) -> io::Result<Monitored> {
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command.spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_handle = thread::spawn(move || drain(stdout));
    let err_handle = thread::spawn(move || drain(stderr));

    let started = Instant::now();
    let conclusion = loop {
        match child.try_wait()? {
            Some(status) => {
                break Conclusion::Exited(status.success(), status.code());
            }
            None => {
                if cancel.is_cancelled() {
                    break Conclusion::Killed(Kill::Cancelled);
                }
                if deadline.is_some_and(|limit| started.elapsed() >= limit) {
                    break Conclusion::Killed(Kill::TimedOut);
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    };

    if let Conclusion::Killed(_) = conclusion {
        child.kill().ok();
        child.wait().ok();
    }

    let rendered = render_command(command);
    let captured = |success, code| Captured {
        success,
        code,
        stdout: out_handle.join().unwrap_or_default(),
        stderr: err_handle.join().unwrap_or_default(),
    };
    Ok(match conclusion {
        Conclusion::Exited(success, code) => Monitored::Finished(captured(success, code)),
        Conclusion::Killed(Kill::TimedOut) => {
            let mut captured = captured(false, None);
            captured.stderr = format!("killed after deadline: {rendered}\n{}", captured.stderr);
            Monitored::TimedOut(captured)
        }
        Conclusion::Killed(Kill::Cancelled) => {
            let mut captured = captured(false, None);
            captured.stderr = format!("killed by cancellation: {rendered}\n{}", captured.stderr);
            Monitored::Cancelled(captured)
        }
    })
}

enum Conclusion {
    Exited(bool, Option<i32>),
    Killed(Kill),
}

enum Kill {
    TimedOut,
    Cancelled,
}

fn drain(pipe: Option<impl io::Read>) -> String {
    let mut buffer = String::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_string(&mut buffer).ok();
    }
    buffer
}

fn progress_bar() -> ProgressBar {
    let progress_bar = ProgressBar::new_spinner();
    progress_bar.enable_steady_tick(Duration::from_millis(125));
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg:.magenta.bold}") {
        // https://github.com/sindresorhus/cli-spinners/blob/master/spinners.json
        progress_bar.set_style(style.tick_strings(&["∙∙∙", "●∙∙", "∙●∙", "∙∙●", "∙∙∙"]));
    }
    progress_bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());

        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn captured_detail_prefers_stderr() {
        let captured = Captured {
            success: false,
            code: Some(1),
            stdout: "partial progress\n".into(),
            stderr: "fatal: no such cluster\n".into(),
        };
        assert_eq!(captured.detail(), "fatal: no such cluster");

        let quiet = Captured {
            stderr: String::new(),
            ..captured
        };
        assert_eq!(quiet.detail(), "partial progress");
    }
}
