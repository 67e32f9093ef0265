//! Logging setup for tree-injector
//!
//! Every event the crate emits uses the `tree_injector` target. Fatal
//! configuration errors are `ERROR` events carrying `fatal = true`, so they
//! can be filtered apart from user-hook failures.
//!
//! # Features
//!
//! - `logging` - emit `tracing` events (default)
//! - `logging-json` - JSON subscriber output
//! - `logging-pretty` - human-readable subscriber output
//!
//! # Example
//!
//! ```rust,ignore
//! use tree_injector::logging;
//!
//! logging::builder()
//!     .trace()
//!     .injector_only()
//!     .with_directive("tree_injector[instance]=debug")
//!     .pretty()
//!     .init();
//! ```

#[cfg(feature = "logging")]
use tracing::Level;

/// Target of every event emitted by this crate
pub const TARGET: &str = "tree_injector";

/// Subscriber output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

/// Builder for a `tracing-subscriber` registry
#[cfg(feature = "logging")]
#[derive(Debug, Clone)]
pub struct LoggingBuilder {
    level: Level,
    format: LogFormat,
    target: Option<&'static str>,
    directives: Vec<String>,
    from_env: bool,
    with_file: bool,
    with_line_number: bool,
    with_thread_names: bool,
}

#[cfg(feature = "logging")]
impl Default for LoggingBuilder {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: if cfg!(feature = "logging-json") {
                LogFormat::Json
            } else {
                LogFormat::Pretty
            },
            target: None,
            directives: Vec::new(),
            from_env: false,
            with_file: false,
            with_line_number: false,
            with_thread_names: false,
        }
    }
}

#[cfg(feature = "logging")]
impl LoggingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Every lifecycle transition and lookup
    pub fn trace(self) -> Self {
        self.with_level(Level::TRACE)
    }

    pub fn debug(self) -> Self {
        self.with_level(Level::DEBUG)
    }

    /// Woven modules and warnings only
    pub fn info(self) -> Self {
        self.with_level(Level::INFO)
    }

    /// Hook failures and fatal errors only
    pub fn error(self) -> Self {
        self.with_level(Level::ERROR)
    }

    pub fn with_target_filter(mut self, target: &'static str) -> Self {
        self.target = Some(target);
        self
    }

    /// Drop events from every other crate
    pub fn injector_only(self) -> Self {
        self.with_target_filter(TARGET)
    }

    /// Add an `EnvFilter` directive, e.g. `tree_injector=warn`
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Let `RUST_LOG` take over when it is set
    pub fn from_env(mut self) -> Self {
        self.from_env = true;
        self
    }

    pub fn with_file(mut self) -> Self {
        self.with_file = true;
        self
    }

    pub fn with_line_number(mut self) -> Self {
        self.with_line_number = true;
        self
    }

    pub fn with_thread_names(mut self) -> Self {
        self.with_thread_names = true;
        self
    }

    pub fn json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.format = LogFormat::Pretty;
        self
    }

    pub fn compact(mut self) -> Self {
        self.format = LogFormat::Compact;
        self
    }

    /// Filter expression built from the level, target and extra directives
    pub fn filter_spec(&self) -> String {
        let base = match self.target {
            Some(target) => format!("{}={}", target, self.level),
            None => self.level.to_string(),
        };
        std::iter::once(base)
            .chain(self.directives.iter().cloned())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Install the subscriber globally
    ///
    /// Requires `logging-json` or `logging-pretty`. Fails if a global
    /// subscriber is already set.
    #[cfg(any(feature = "logging-json", feature = "logging-pretty"))]
    pub fn try_init(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        let filter = if self.from_env {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.filter_spec()))
        } else {
            EnvFilter::new(self.filter_spec())
        };

        let layer = fmt::layer()
            .with_file(self.with_file)
            .with_line_number(self.with_line_number)
            .with_thread_names(self.with_thread_names)
            .with_target(true);

        let registry = tracing_subscriber::registry().with(filter);
        match self.format {
            #[cfg(feature = "logging-json")]
            LogFormat::Json => registry.with(layer.json()).try_init()?,
            #[cfg(not(feature = "logging-json"))]
            LogFormat::Json => registry.with(layer).try_init()?,
            LogFormat::Pretty => registry.with(layer.pretty()).try_init()?,
            LogFormat::Compact => registry.with(layer.compact()).try_init()?,
        }
        Ok(())
    }

    /// Install the subscriber globally, ignoring an already installed one
    #[cfg(any(feature = "logging-json", feature = "logging-pretty"))]
    pub fn init(self) {
        let _ = self.try_init();
    }

    /// No-op without a subscriber feature
    #[cfg(not(any(feature = "logging-json", feature = "logging-pretty")))]
    pub fn init(self) {}
}

#[cfg(feature = "logging")]
pub fn builder() -> LoggingBuilder {
    LoggingBuilder::new()
}
