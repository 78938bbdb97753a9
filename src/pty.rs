use std::{
    env,
    ffi::OsString,
    io::{Read, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;

/// One pseudoterminal pair fronting a child CLI process. The reader runs on a
/// dedicated thread and forwards raw chunks over an mpsc channel; writes go
/// through a mutex so injection and control responses never interleave bytes.
pub struct PtySession {
    master: Box<dyn portable_pty::MasterPty>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send>>>,
    child_pid: Option<u32>,
    reaped: Arc<AtomicBool>,
    /// Consecutive liveness checks with no PID and try_wait stuck at
    /// Ok(None). Some platforms never report PTY children; after a threshold
    /// the child is assumed gone.
    no_pid_alive_checks: AtomicU32,
}

fn canonicalize_display(path: &Path) -> String {
    std::fs::canonicalize(path)
        .ok()
        .and_then(|resolved| resolved.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

/// Resolve a bare command name against PATH so the PTY layer gets an
/// unambiguous program path.
pub fn resolve_command_path(command: &str) -> String {
    if command.contains('/') || command.contains('\\') || command.starts_with('.') {
        return canonicalize_display(Path::new(command));
    }

    let path_env = env::var_os("PATH")
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| OsString::from("/usr/local/bin:/usr/bin:/bin"));

    for dir in env::split_paths(&path_env) {
        let candidate = dir.join(command);
        if candidate.is_file() {
            return canonicalize_display(&candidate);
        }
    }

    command.to_string()
}

impl PtySession {
    pub fn spawn(
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        env_vars: &[(String, String)],
        rows: u16,
        cols: u16,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let resolved_command = resolve_command_path(command);
        let mut cmd = CommandBuilder::new(&resolved_command);
        let workdir = match cwd {
            Some(dir) => dir.to_path_buf(),
            None => std::env::current_dir().context("failed to get current directory")?,
        };
        cmd.cwd(workdir);
        for arg in args {
            cmd.arg(arg);
        }
        for (key, value) in env_vars {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("failed to spawn agent command")?;
        let child_pid = child.process_id();

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;

        let (tx, rx) = mpsc::channel(256);
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok((
            Self {
                master: pair.master,
                writer: Arc::new(Mutex::new(writer)),
                child: Arc::new(Mutex::new(child)),
                child_pid,
                reaped: Arc::new(AtomicBool::new(false)),
                no_pid_alive_checks: AtomicU32::new(0),
            },
            rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.child_pid
    }

    pub fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock();
        guard.write_all(bytes)?;
        guard.flush()?;
        Ok(())
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to resize pty")
    }

    /// Non-blocking child liveness check. Combines waitpid(WNOHANG), a
    /// `kill(pid, 0)` existence probe, and a consecutive no-PID fallback for
    /// platforms where the PTY child never reports a PID.
    pub fn has_exited(&self) -> bool {
        const NO_PID_THRESHOLD: u32 = 6;

        if self.reaped.load(Ordering::Relaxed) {
            return true;
        }

        let live_pid: Option<u32>;
        {
            let mut child = self.child.lock();
            match child.try_wait() {
                Ok(Some(_status)) => {
                    self.reaped.store(true, Ordering::Relaxed);
                    return true;
                }
                Ok(None) => {}
                Err(error) => {
                    // ECHILD: someone else already reaped the child.
                    tracing::debug!(
                        target = "fleet::worker::pty",
                        pid = ?self.child_pid,
                        error = %error,
                        "try_wait errored; treating child as exited"
                    );
                    self.reaped.store(true, Ordering::Relaxed);
                    return true;
                }
            }
            live_pid = child.process_id().or(self.child_pid);
        }

        #[cfg(unix)]
        if let Some(pid) = live_pid {
            self.no_pid_alive_checks.store(0, Ordering::Relaxed);
            // SAFETY: signal 0 performs an existence check only.
            let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
            if ret == -1 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if errno == libc::ESRCH {
                    self.reaped.store(true, Ordering::Relaxed);
                    return true;
                }
            }
            return false;
        }

        #[cfg(unix)]
        {
            let count = self.no_pid_alive_checks.fetch_add(1, Ordering::Relaxed) + 1;
            if count >= NO_PID_THRESHOLD {
                tracing::warn!(
                    target = "fleet::worker::pty",
                    consecutive_checks = count,
                    "no PID and try_wait stuck at Ok(None); assuming child exited"
                );
                self.reaped.store(true, Ordering::Relaxed);
                return true;
            }
        }

        let _ = live_pid;
        false
    }

    /// Reset the no-PID counter. Called whenever PTY output arrives, which
    /// proves the child is alive regardless of PID availability.
    pub fn reset_no_pid_checks(&self) {
        self.no_pid_alive_checks.store(0, Ordering::Relaxed);
    }

    pub fn shutdown(&self) -> Result<()> {
        if self.reaped.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mut child = self.child.lock();
        let _ = child.kill();
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => {}
            Ok(None) => {
                let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
                loop {
                    match child.try_wait() {
                        Ok(Some(_)) | Err(_) => break,
                        Ok(None) => {
                            if std::time::Instant::now() >= deadline {
                                tracing::warn!(
                                    target = "fleet::worker::pty",
                                    "child did not exit within 2s after kill"
                                );
                                break;
                            }
                            std::thread::sleep(std::time::Duration::from_millis(50));
                        }
                    }
                }
            }
        }
        self.reaped.store(true, Ordering::Relaxed);
        Ok(())
    }
}
