use std::io::{Read, Write};
use std::path::PathBuf;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

/// Errors from PTY operations.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("PTY spawn failed: {0}")]
    SpawnFailed(String),
    #[error("PTY I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("PTY resize failed: {0}")]
    ResizeFailed(String),
}

/// Everything needed to start a process on a fresh PTY.
#[derive(Debug, Clone)]
pub struct SpawnCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl SpawnCommand {
    fn builder(&self) -> CommandBuilder {
        let mut builder = CommandBuilder::new(&self.program);
        builder.args(&self.args);
        builder.cwd(&self.cwd);
        for (key, value) in &self.env {
            builder.env(key, value);
        }
        builder
    }
}

fn size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// The master side of a PTY and the child running on it.
///
/// The reader is handed out once to the session's I/O thread; everything
/// else stays here and is driven by the registry.
pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    reader: Option<Box<dyn Read + Send>>,
    child: Box<dyn Child + Send + Sync>,
}

impl PtyHandle {
    pub fn spawn(command: &SpawnCommand) -> Result<Self, PtyError> {
        let pair = native_pty_system()
            .openpty(size(command.cols, command.rows))
            .map_err(|e| PtyError::SpawnFailed(format!("open PTY: {e}")))?;
        let child = pair
            .slave
            .spawn_command(command.builder())
            .map_err(|e| PtyError::SpawnFailed(format!("{}: {e}", command.program)))?;

        let master = pair.master;
        let reader = master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("clone reader: {e}")))?;
        let writer = master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("take writer: {e}")))?;

        Ok(Self {
            master,
            writer,
            reader: Some(reader),
            child,
        })
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .resize(size(cols, rows))
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))
    }

    /// Send input to the child.
    pub fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Hand out the blocking output reader. `None` once taken.
    pub fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        self.reader.take()
    }

    pub fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }

    /// Exit code, once the child has exited.
    pub fn try_wait(&mut self) -> Option<u32> {
        self.child
            .try_wait()
            .ok()
            .flatten()
            .map(|status| status.exit_code())
    }

    /// Terminate the child. Killing an exited child is not an error.
    pub fn kill(&mut self) -> Result<(), PtyError> {
        if self.try_wait().is_some() {
            return Ok(());
        }
        match self.child.kill() {
            Ok(()) => Ok(()),
            Err(_) if self.try_wait().is_some() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// `$SHELL` when set, otherwise `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn command(program: &str, args: &[&str]) -> SpawnCommand {
        SpawnCommand {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: PathBuf::from("/"),
            env: vec![("TERMHOST_MARKER".to_string(), "from-env".to_string())],
            cols: 80,
            rows: 24,
        }
    }

    /// Read until `needle` shows up, EOF, or a few seconds pass.
    fn read_until(mut reader: Box<dyn Read + Send>, needle: &'static str) -> String {
        thread::spawn(move || {
            let mut output = Vec::new();
            let mut buf = [0u8; 4096];
            let deadline = Instant::now() + Duration::from_secs(3);
            while Instant::now() < deadline {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => output.extend_from_slice(&buf[..n]),
                }
                if String::from_utf8_lossy(&output).contains(needle) {
                    break;
                }
            }
            String::from_utf8_lossy(&output).into_owned()
        })
        .join()
        .unwrap()
    }

    #[test]
    fn test_input_reaches_child_with_env() {
        let mut pty = PtyHandle::spawn(&command("/bin/sh", &[])).unwrap();
        assert!(pty.process_id().is_some());
        let reader = pty.take_reader().unwrap();
        assert!(pty.take_reader().is_none());

        pty.write(b"echo marker=$TERMHOST_MARKER\n").unwrap();
        let text = read_until(reader, "marker=from-env\r\n");
        assert!(text.contains("marker=from-env"), "got: {text}");
        pty.kill().unwrap();
    }

    #[test]
    fn test_exit_code_after_eof() {
        let mut pty = PtyHandle::spawn(&command("/bin/sh", &["-c", "exit 7"])).unwrap();
        let reader = pty.take_reader().unwrap();
        read_until(reader, "never printed");

        let deadline = Instant::now() + Duration::from_secs(3);
        while pty.try_wait().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pty.try_wait(), Some(7));
        assert!(pty.kill().is_ok(), "killing an exited child is fine");
    }

    #[test]
    fn test_resize_and_kill() {
        let mut pty = PtyHandle::spawn(&command("/bin/sh", &[])).unwrap();
        pty.resize(132, 43).unwrap();
        pty.kill().unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while pty.try_wait().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(pty.try_wait().is_some());
    }

    #[test]
    fn test_missing_program_fails() {
        assert!(matches!(
            PtyHandle::spawn(&command("/definitely/not/a/shell", &[])),
            Err(PtyError::SpawnFailed(_))
        ));
    }

    #[test]
    fn test_default_shell_is_absolute() {
        assert!(default_shell().starts_with('/'));
    }
}
