// Log panel
//
// The single user-visible sink every component writes to. Lines are
// timestamped on arrival and kept in order; nothing is trimmed or rotated.
// A pending alert models a blocking dialog: the terminal UI shows it until
// dismissed, the CLI prints it.

use std::sync::{Arc, Mutex};

#[derive(Default)]
struct ConsoleInner {
    lines: Vec<String>,
    alert: Option<String>,
    echo: bool,
}

/// Cloneable handle to the process-wide log panel.
#[derive(Clone, Default)]
pub struct Console {
    inner: Arc<Mutex<ConsoleInner>>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// A console that also prints each line to stdout as it arrives.
    pub fn with_echo() -> Self {
        let console = Self::new();
        if let Ok(mut inner) = console.inner.lock() {
            inner.echo = true;
        }
        console
    }

    pub fn log(&self, text: impl AsRef<str>) {
        let line = format!("{} {}", chrono::Local::now().format("%H:%M:%S"), text.as_ref());
        if let Ok(mut inner) = self.inner.lock() {
            if inner.echo {
                println!("{line}");
            }
            inner.lines.push(line);
        }
    }

    /// Raise a blocking alert. A newer alert replaces one not yet dismissed.
    pub fn alert(&self, text: impl Into<String>) {
        let text = text.into();
        tlog!("[console] alert: {}", text.replace('\n', " "));
        if let Ok(mut inner) = self.inner.lock() {
            if inner.echo {
                println!("\n!! {}\n", text.replace('\n', "\n!! "));
            }
            inner.alert = Some(text);
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.lines.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.lines.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_alert(&self) -> Option<String> {
        self.inner.lock().ok().and_then(|inner| inner.alert.clone())
    }

    /// Dismiss and return the pending alert.
    pub fn take_alert(&self) -> Option<String> {
        self.inner.lock().ok().and_then(|mut inner| inner.alert.take())
    }
}
