//! Desktop ports: clipboard and notifications.
//!
//! These are the seams the core calls, never logic to grow. The Linux
//! adapters shell out to `wl-copy`/`xclip` and `notify-send`; every failure
//! is logged and swallowed so a missing tool never breaks a recording flow.

use std::io::Write;
use std::process::{Command, Stdio};

use tracing::{debug, error};

use crate::config::NotificationsConfig;

/// System clipboard port.
pub trait Clipboard: Send + Sync {
    fn copy(&self, text: &str);
}

/// Desktop notification port.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// Which display server the adapters talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisplayBackend {
    Wayland,
    X11,
}

fn detect_display_backend() -> DisplayBackend {
    if std::env::var_os("WAYLAND_DISPLAY").is_some() {
        DisplayBackend::Wayland
    } else {
        // DISPLAY set or not, xclip against :0 is the usable default.
        DisplayBackend::X11
    }
}

/// Clipboard over `wl-copy` (Wayland) or `xclip` (X11).
pub struct SystemClipboard {
    backend: DisplayBackend,
}

impl SystemClipboard {
    pub fn new() -> Self {
        let backend = detect_display_backend();
        debug!(?backend, "clipboard backend selected");
        Self { backend }
    }

    fn command(&self) -> Command {
        match self.backend {
            DisplayBackend::Wayland => Command::new("wl-copy"),
            DisplayBackend::X11 => {
                let mut cmd = Command::new("xclip");
                cmd.args(["-selection", "clipboard"]);
                cmd
            }
        }
    }
}

impl Default for SystemClipboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Clipboard for SystemClipboard {
    fn copy(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut cmd = self.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match cmd.spawn() {
            Ok(mut child) => {
                if let Some(stdin) = child.stdin.as_mut() {
                    if let Err(e) = stdin.write_all(text.as_bytes()) {
                        error!(error = %e, "failed to write clipboard payload");
                        return;
                    }
                }
                drop(child.stdin.take());
                match child.wait() {
                    Ok(status) if status.success() => {
                        debug!(chars = text.chars().count(), "text copied to clipboard")
                    }
                    Ok(status) => error!(%status, "clipboard tool exited non-zero"),
                    Err(e) => error!(error = %e, "failed to reap clipboard tool"),
                }
            }
            Err(e) => error!(error = %e, "clipboard tool unavailable (install wl-clipboard or xclip)"),
        }
    }
}

/// Notifications over `notify-send`.
pub struct SystemNotifier {
    config: NotificationsConfig,
}

impl SystemNotifier {
    pub fn new(config: NotificationsConfig) -> Self {
        Self { config }
    }
}

impl Notifier for SystemNotifier {
    fn notify(&self, title: &str, message: &str) {
        let mut cmd = Command::new("notify-send");
        if self.config.auto_dismiss {
            cmd.arg("-t").arg(self.config.expire_time_ms.to_string());
        }
        cmd.arg(title).arg(message);
        cmd.stdout(Stdio::null()).stderr(Stdio::null());

        match cmd.status() {
            Ok(status) if status.success() => {}
            Ok(status) => debug!(%status, "notify-send exited non-zero"),
            Err(e) => debug!(error = %e, "notify-send unavailable"),
        }
    }
}

/// No-op adapters for headless use and tests.
pub struct NullClipboard;

impl Clipboard for NullClipboard {
    fn copy(&self, _text: &str) {}
}

pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _title: &str, _message: &str) {}
}
