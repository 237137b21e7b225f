//! Host-facing engine messages
//!
//! The engine reports user-relevant events (swapchain recreation, degraded
//! present modes, device selection) through a [`MessageSink`] owned by the
//! engine and passed by reference into the components that produce messages.
//! Internal developer breadcrumbs additionally go through the `log` facade.

use bitflags::bitflags;

bitflags! {
    /// Severity classes a host can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageSeverity: u32 {
        /// Fine-grained progress messages
        const VERBOSE = 0b0001;
        /// Normal operational messages
        const INFO = 0b0010;
        /// Something degraded but the engine continues
        const WARNING = 0b0100;
        /// Unrecoverable conditions, reported just before they surface as errors
        const ERROR = 0b1000;
    }
}

/// Host callback receiving engine messages.
pub type MessageCallback = Box<dyn FnMut(MessageSeverity, &str)>;

/// Sink for host-facing messages with a severity filter.
pub struct MessageSink {
    callback: Option<MessageCallback>,
    filter: MessageSeverity,
}

impl MessageSink {
    /// Create a sink; `callback` may be `None` for log-only operation.
    pub fn new(callback: Option<MessageCallback>) -> Self {
        Self {
            callback,
            filter: MessageSeverity::all(),
        }
    }

    /// Restrict which severities reach the host callback.
    pub fn set_filter(&mut self, filter: MessageSeverity) {
        self.filter = filter;
    }

    /// Report a message: mirrored into `log`, forwarded to the host callback
    /// when its severity passes the filter.
    pub fn print(&mut self, severity: MessageSeverity, text: &str) {
        if severity.contains(MessageSeverity::ERROR) {
            log::error!("{text}");
        } else if severity.contains(MessageSeverity::WARNING) {
            log::warn!("{text}");
        } else if severity.contains(MessageSeverity::VERBOSE) {
            log::debug!("{text}");
        } else {
            log::info!("{text}");
        }

        if self.filter.intersects(severity) {
            if let Some(callback) = self.callback.as_mut() {
                callback(severity, text);
            }
        }
    }
}

impl std::fmt::Debug for MessageSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSink")
            .field("callback", &self.callback.is_some())
            .field("filter", &self.filter)
            .finish()
    }
}
