use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use rusqlite::OpenFlags;

use crate::command::CommandObserver;
use crate::mapping::MappingRegistry;

/// Sink for command trace lines.
pub type TraceSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Options for one database connection.
///
/// The path accepts a file path, `":memory:"`, or a
/// `"file:<name>?mode=memory"` URI for a shared in-memory database.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub path: String,
    pub open_flags: OpenFlags,
    /// Store wall-clock date-times as ticks (integer) rather than
    /// ISO-8601 text.
    pub store_date_time_as_ticks: bool,
    /// Forwarded to the engine's busy handler.
    pub busy_timeout: Duration,
    /// Emit one trace line per command.
    pub trace: bool,
    /// Receives trace lines; unset traces go to the log.
    pub tracer: Option<TraceSink>,
    /// Emit an elapsed-time line for slow commands.
    pub trace_time: bool,
    /// Threshold for the elapsed-time line.
    pub trace_time_exceeding: Duration,
    /// Page size applied during bootstrap, when set.
    pub page_size: Option<u32>,
    pub observer: Option<Arc<dyn CommandObserver>>,
    /// Mapping registry to resolve record types against; the process
    /// global one when unset.
    pub registry: Option<Arc<MappingRegistry>>,
}

impl ConnectionConfig {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            open_flags: OpenFlags::default(),
            store_date_time_as_ticks: true,
            busy_timeout: Duration::from_secs(1),
            trace: false,
            tracer: None,
            trace_time: false,
            trace_time_exceeding: Duration::from_millis(500),
            page_size: None,
            observer: None,
            registry: None,
        }
    }

    /// An in-memory database private to this connection.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }

    #[must_use]
    pub fn with_open_flags(mut self, flags: OpenFlags) -> Self {
        self.open_flags = flags;
        self
    }

    #[must_use]
    pub fn with_store_date_time_as_ticks(mut self, ticks: bool) -> Self {
        self.store_date_time_as_ticks = ticks;
        self
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: TraceSink) -> Self {
        self.trace = true;
        self.tracer = Some(tracer);
        self
    }

    #[must_use]
    pub fn with_trace_time(mut self, exceeding: Duration) -> Self {
        self.trace_time = true;
        self.trace_time_exceeding = exceeding;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn CommandObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<MappingRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("path", &self.path)
            .field("open_flags", &self.open_flags)
            .field("store_date_time_as_ticks", &self.store_date_time_as_ticks)
            .field("busy_timeout", &self.busy_timeout)
            .field("trace", &self.trace)
            .field("trace_time", &self.trace_time)
            .field("trace_time_exceeding", &self.trace_time_exceeding)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

/// Options for the connection manager: one writer plus a bounded reader
/// pool.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub connection: ConnectionConfig,
    /// Readers opened up front. At least 1.
    pub min_pool_size: usize,
    /// Upper bound on open readers. At least `min_pool_size`.
    pub max_pool_size: usize,
    /// How long a writer waits for the write lock before failing with
    /// the holder's reason.
    pub write_lock_timeout: Duration,
}

impl ManagerConfig {
    #[must_use]
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            min_pool_size: 1,
            max_pool_size: 4,
            write_lock_timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_pool_size(mut self, min: usize, max: usize) -> Self {
        self.min_pool_size = min;
        self.max_pool_size = max;
        self
    }

    #[must_use]
    pub fn with_write_lock_timeout(mut self, timeout: Duration) -> Self {
        self.write_lock_timeout = timeout;
        self
    }
}
