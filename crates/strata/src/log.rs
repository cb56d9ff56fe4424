//! Diagnostics routed to `tracing` and to an optional caller-supplied sink.
//!
//! The registry collects the diagnostics of a call with
//! [`Diagnostics::deferred`] and hands them to the sink after releasing its
//! lock, so a sink may query the runtime. Code running outside the registry
//! (stubs reporting through a null error channel, dispatch proxies) reports
//! through [`process`], which reaches the sink of the last successful
//! initialization.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Severity of a diagnostic passed to a [`LogSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Callback receiving runtime diagnostics.
pub type LogSink = Arc<dyn Fn(Severity, &str) + Send + Sync>;

type Pending = Arc<Mutex<Vec<(Severity, String)>>>;

static PROCESS_SINK: RwLock<Option<LogSink>> = RwLock::new(None);

/// Make `sink` the process-wide sink.
pub(crate) fn install_process_sink(sink: Option<LogSink>) {
    *PROCESS_SINK.write().unwrap_or_else(|e| e.into_inner()) = sink;
}

/// Clear the process-wide sink if it is still `sink`.
pub(crate) fn release_process_sink(sink: &LogSink) {
    let mut current = PROCESS_SINK.write().unwrap_or_else(|e| e.into_inner());
    if current.as_ref().is_some_and(|installed| Arc::ptr_eq(installed, sink)) {
        *current = None;
    }
}

/// Diagnostics reaching the process-wide sink.
pub fn process() -> Diagnostics {
    let sink = PROCESS_SINK.read().unwrap_or_else(|e| e.into_inner()).clone();
    Diagnostics::new(sink)
}

/// Emits diagnostics through `tracing` and the registered sink.
///
/// A deferred instance buffers sink messages until [`Diagnostics::flush`];
/// `tracing` always sees them immediately. Clones share the buffer.
#[derive(Clone, Default)]
pub struct Diagnostics {
    sink: Option<LogSink>,
    pending: Option<Pending>,
}

impl Diagnostics {
    pub fn new(sink: Option<LogSink>) -> Self {
        Self { sink, pending: None }
    }

    /// Buffer messages for a sink chosen at [`Diagnostics::flush`] time.
    pub fn deferred() -> Self {
        Self {
            sink: None,
            pending: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    pub fn sink(&self) -> Option<&LogSink> {
        self.sink.as_ref()
    }

    pub fn emit(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Debug => debug!("{}", message),
            Severity::Info => info!("{}", message),
            Severity::Warning => warn!("{}", message),
            Severity::Error => error!("{}", message),
        }
        if let Some(pending) = &self.pending {
            pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((severity, message.to_string()));
        } else if let Some(sink) = &self.sink {
            sink(severity, message);
        }
    }

    /// Deliver buffered messages to `sink`, in order.
    ///
    /// Must not be called while holding a lock the sink may need.
    pub fn flush(&self, sink: Option<&LogSink>) {
        let Some(pending) = &self.pending else {
            return;
        };
        let messages = std::mem::take(&mut *pending.lock().unwrap_or_else(|e| e.into_inner()));
        if let Some(sink) = sink {
            for (severity, message) in messages {
                sink(severity, &message);
            }
        }
    }

    pub fn debug(&self, message: &str) {
        self.emit(Severity::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.emit(Severity::Info, message);
    }

    pub fn warning(&self, message: &str) {
        self.emit(Severity::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.emit(Severity::Error, message);
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("sink", &self.sink.is_some())
            .field("deferred", &self.pending.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> (LogSink, Arc<Mutex<Vec<(Severity, String)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink: LogSink = Arc::new(move |severity: Severity, message: &str| {
            captured.lock().unwrap().push((severity, message.to_string()));
        });
        (sink, seen)
    }

    #[test]
    fn test_sink_receives_messages() {
        let (sink, seen) = capture();
        let diagnostics = Diagnostics::new(Some(sink));
        diagnostics.warning("symbol missing");
        diagnostics.debug("opened");

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (Severity::Warning, "symbol missing".to_string()),
                (Severity::Debug, "opened".to_string()),
            ]
        );
    }

    #[test]
    fn test_without_sink() {
        let diagnostics = Diagnostics::default();
        assert!(diagnostics.sink().is_none());
        diagnostics.error("nowhere to go but tracing");
    }

    #[test]
    fn test_deferred_messages_wait_for_flush() {
        let (sink, seen) = capture();
        let diagnostics = Diagnostics::deferred();
        diagnostics.info("loaded");
        diagnostics.clone().warning("missing symbol");
        assert!(seen.lock().unwrap().is_empty());

        diagnostics.flush(Some(&sink));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (Severity::Info, "loaded".to_string()),
                (Severity::Warning, "missing symbol".to_string()),
            ]
        );

        // Flushed messages are not delivered twice.
        diagnostics.flush(Some(&sink));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
