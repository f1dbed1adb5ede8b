/// Process launch collaborator.
///
/// `ProcessLauncher::launch` starts the process and hands back channels for its
/// exit status and captured output. The action queue decides how long to wait.
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::{RunAs, WindowStyle};
use crate::error::LaunchError;

/// Everything needed to start one external process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub file_name: String,
    pub arguments: String,
    pub verb: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub use_shell_execute: bool,
    pub window_style: WindowStyle,
    pub create_no_window: bool,
    pub redirect_stdout: bool,
    pub redirect_stderr: bool,
    pub run_as: Option<RunAs>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when the process was terminated by a signal or could not be waited on.
    pub code: Option<i32>,
}

/// A started process. `exit` resolves once; `output` closes when both streams end.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub pid: Option<u32>,
    pub exit: oneshot::Receiver<ExitInfo>,
    pub output: mpsc::UnboundedReceiver<(OutputStream, String)>,
}

pub trait ProcessLauncher: Send + Sync {
    /// Must be called from within a tokio runtime.
    fn launch(&self, spec: &ProcessSpec) -> Result<LaunchedProcess, LaunchError>;
}

/// Launches real processes with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessLauncher;

impl ProcessLauncher for TokioProcessLauncher {
    fn launch(&self, spec: &ProcessSpec) -> Result<LaunchedProcess, LaunchError> {
        let mut cmd = build_command(spec)?;
        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            file_name: spec.file_name.clone(),
            source,
        })?;
        let pid = child.id();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, OutputStream::Stdout, out_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, OutputStream::Stderr, out_tx.clone()));
        }
        drop(out_tx);

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to wait on process {pid:?}: {e}");
                    None
                }
            };
            let _ = exit_tx.send(ExitInfo { code });
        });

        Ok(LaunchedProcess {
            pid,
            exit: exit_rx,
            output: out_rx,
        })
    }
}

async fn forward_lines<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<(OutputStream, String)>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send((stream, line)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading {stream:?}: {e}");
                break;
            }
        }
    }
}

fn build_command(spec: &ProcessSpec) -> Result<Command, LaunchError> {
    if spec.file_name.trim().is_empty() {
        return Err(LaunchError::MissingFileName);
    }
    if let Some(verb) = spec.verb.as_deref().map(str::trim) {
        if !verb.is_empty() && !verb.eq_ignore_ascii_case("open") {
            return Err(LaunchError::Unsupported(format!("verb '{verb}'")));
        }
    }

    let mut cmd = if spec.use_shell_execute {
        let line = if spec.arguments.trim().is_empty() {
            quote(&spec.file_name)
        } else {
            format!("{} {}", quote(&spec.file_name), spec.arguments)
        };
        shell_command(line)
    } else {
        let mut cmd = Command::new(&spec.file_name);
        cmd.args(split_arguments(&spec.arguments));
        cmd
    };

    if let Some(dir) = &spec.working_directory {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(if spec.redirect_stdout { Stdio::piped() } else { Stdio::null() })
        .stderr(if spec.redirect_stderr { Stdio::piped() } else { Stdio::null() });

    apply_platform_options(&mut cmd, spec)?;
    Ok(cmd)
}

#[cfg(windows)]
fn shell_command(line: String) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(line);
    cmd
}

#[cfg(not(windows))]
fn shell_command(line: String) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(windows)]
fn apply_platform_options(cmd: &mut Command, spec: &ProcessSpec) -> Result<(), LaunchError> {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    if spec.create_no_window || spec.window_style == WindowStyle::Hidden {
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    if let Some(run_as) = &spec.run_as {
        return Err(LaunchError::Unsupported(format!(
            "running as user '{}'",
            run_as.user
        )));
    }
    Ok(())
}

#[cfg(not(windows))]
fn apply_platform_options(cmd: &mut Command, spec: &ProcessSpec) -> Result<(), LaunchError> {
    if spec.window_style != WindowStyle::Normal || spec.create_no_window {
        debug!("Window options have no effect on this platform");
    }
    if let Some(run_as) = &spec.run_as {
        let uid: u32 = run_as.user.trim().parse().map_err(|_| {
            LaunchError::Unsupported(format!(
                "run-as user '{}' must be a numeric uid on this platform",
                run_as.user
            ))
        })?;
        cmd.uid(uid);
    }
    Ok(())
}

fn quote(s: &str) -> String {
    if s.contains(char::is_whitespace) && !s.starts_with('"') {
        format!("\"{s}\"")
    } else {
        s.to_string()
    }
}

/// Splits an argument string on whitespace, keeping quoted sections together.
pub fn split_arguments(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(file_name: &str, arguments: &str) -> ProcessSpec {
        ProcessSpec {
            file_name: file_name.to_string(),
            arguments: arguments.to_string(),
            verb: None,
            working_directory: None,
            use_shell_execute: false,
            window_style: WindowStyle::Normal,
            create_no_window: false,
            redirect_stdout: true,
            redirect_stderr: true,
            run_as: None,
        }
    }

    // ── split_arguments ───────────────────────────────────────────────────────

    #[test]
    fn split_plain_words() {
        assert_eq!(split_arguments("a  b\tc"), vec!["a", "b", "c"]);
    }

    #[test]
    fn split_keeps_quoted_sections() {
        assert_eq!(
            split_arguments(r#"--file "/tmp/my file.txt" --tag 'two words'"#),
            vec!["--file", "/tmp/my file.txt", "--tag", "two words"]
        );
    }

    #[test]
    fn split_empty_quotes_make_empty_argument() {
        assert_eq!(split_arguments(r#"a "" b"#), vec!["a", "", "b"]);
    }

    #[test]
    fn split_blank_input_is_empty() {
        assert!(split_arguments("   ").is_empty());
    }

    // ── build_command ─────────────────────────────────────────────────────────

    #[test]
    fn missing_file_name_is_rejected() {
        assert!(matches!(
            build_command(&spec("  ", "")),
            Err(LaunchError::MissingFileName)
        ));
    }

    #[test]
    fn unknown_verb_is_unsupported() {
        let mut s = spec("/bin/true", "");
        s.verb = Some("print".to_string());
        assert!(matches!(build_command(&s), Err(LaunchError::Unsupported(_))));
        s.verb = Some("open".to_string());
        assert!(build_command(&s).is_ok());
    }

    // ── TokioProcessLauncher ──────────────────────────────────────────────────

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_captures_output_and_exit_code() {
        let s = spec("sh", "-c 'echo hello; echo oops >&2; exit 3'");
        let mut launched = TokioProcessLauncher.launch(&s).unwrap();
        assert!(launched.pid.is_some());

        let mut lines = Vec::new();
        while let Some(item) = launched.output.recv().await {
            lines.push(item);
        }
        let exit = launched.exit.await.unwrap();

        assert_eq!(exit.code, Some(3));
        assert!(lines.contains(&(OutputStream::Stdout, "hello".to_string())));
        assert!(lines.contains(&(OutputStream::Stderr, "oops".to_string())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_through_shell() {
        let mut s = spec("echo", "from-shell");
        s.use_shell_execute = true;
        let mut launched = TokioProcessLauncher.launch(&s).unwrap();
        let first = launched.output.recv().await;
        assert_eq!(first, Some((OutputStream::Stdout, "from-shell".to_string())));
        assert_eq!(launched.exit.await.unwrap().code, Some(0));
    }

    #[tokio::test]
    async fn launch_missing_binary_fails() {
        let s = spec("/definitely/not/a/binary-dirwatch", "");
        assert!(matches!(
            TokioProcessLauncher.launch(&s),
            Err(LaunchError::Spawn { .. })
        ));
    }
}
