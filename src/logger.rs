//! Component-aware logging contract.
//!
//! Every framework component logs through this contract so each record
//! carries a component identifier (`framework/<module>`, `tool/<id>`,
//! `agent/<id>`). Parents hand the original, unwrapped logger to
//! sub-components; each sub-component applies its own `with_component`.
//!
//! Error values are always attached as rendered strings, never as raw
//! error objects.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Key/value attachments for one log record. Ordered so rendered output
/// is stable.
pub type Fields = BTreeMap<String, Value>;

/// Build a [`Fields`] map inline:
///
/// ```
/// use gomind_core::fields;
/// let f = fields! { "service_id" => "calc-1", "attempt" => 3 };
/// assert_eq!(f["attempt"], serde_json::json!(3));
/// ```
#[macro_export]
macro_rules! fields {
    () => { $crate::logger::Fields::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut fields = $crate::logger::Fields::new();
        $( fields.insert(($key).to_string(), ::serde_json::json!($value)); )+
        fields
    }};
}

/// Log levels exposed by the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Distributed-tracing context attached to context-aware log calls.
#[derive(Debug, Clone, Default)]
pub struct TraceContext {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl TraceContext {
    fn merge_into(&self, fields: &mut Fields) {
        if let Some(trace_id) = &self.trace_id {
            fields.insert("trace_id".to_string(), Value::String(trace_id.clone()));
        }
        if let Some(span_id) = &self.span_id {
            fields.insert("span_id".to_string(), Value::String(span_id.clone()));
        }
    }
}

/// The component-aware logger contract.
///
/// `with_component` returns `None` on sinks that cannot produce tagged
/// children; callers then keep using the logger as-is (see
/// [`for_component`]).
pub trait Logger: Send + Sync {
    /// Emit one record.
    fn log(&self, level: LogLevel, message: &str, fields: &Fields);

    /// Child logger forwarding to the same sink, tagged with `component`.
    fn with_component(&self, _component: &str) -> Option<Arc<dyn Logger>> {
        None
    }

    fn debug(&self, message: &str, fields: &Fields) {
        self.log(LogLevel::Debug, message, fields);
    }

    fn info(&self, message: &str, fields: &Fields) {
        self.log(LogLevel::Info, message, fields);
    }

    fn warn(&self, message: &str, fields: &Fields) {
        self.log(LogLevel::Warn, message, fields);
    }

    fn error(&self, message: &str, fields: &Fields) {
        self.log(LogLevel::Error, message, fields);
    }

    /// Context-aware variants: trace/span ids are merged into the fields.
    fn info_ctx(&self, ctx: &TraceContext, message: &str, fields: &Fields) {
        let mut merged = fields.clone();
        ctx.merge_into(&mut merged);
        self.log(LogLevel::Info, message, &merged);
    }

    fn warn_ctx(&self, ctx: &TraceContext, message: &str, fields: &Fields) {
        let mut merged = fields.clone();
        ctx.merge_into(&mut merged);
        self.log(LogLevel::Warn, message, &merged);
    }

    fn error_ctx(&self, ctx: &TraceContext, message: &str, fields: &Fields) {
        let mut merged = fields.clone();
        ctx.merge_into(&mut merged);
        self.log(LogLevel::Error, message, &merged);
    }
}

/// Apply `with_component` when the sink supports it, otherwise reuse the
/// logger unchanged.
pub fn for_component(logger: &Arc<dyn Logger>, component: &str) -> Arc<dyn Logger> {
    logger
        .with_component(component)
        .unwrap_or_else(|| logger.clone())
}

/// Default logger forwarding to the `tracing` macros.
pub struct TracingLogger {
    component: String,
}

impl TracingLogger {
    /// Logger tagged with the given component identifier.
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Logger for framework-internal modules (`framework/<module>`).
    pub fn framework(module: &str) -> Arc<dyn Logger> {
        Arc::new(Self::new(format!("framework/{}", module)))
    }

    fn render(fields: &Fields) -> String {
        serde_json::to_string(fields).unwrap_or_default()
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str, fields: &Fields) {
        let attached = Self::render(fields);
        match level {
            LogLevel::Debug => {
                tracing::debug!(component = %self.component, fields = %attached, "{}", message)
            }
            LogLevel::Info => {
                tracing::info!(component = %self.component, fields = %attached, "{}", message)
            }
            LogLevel::Warn => {
                tracing::warn!(component = %self.component, fields = %attached, "{}", message)
            }
            LogLevel::Error => {
                tracing::error!(component = %self.component, fields = %attached, "{}", message)
            }
        }
    }

    fn with_component(&self, component: &str) -> Option<Arc<dyn Logger>> {
        Some(Arc::new(TracingLogger::new(component)))
    }
}

/// Logger that drops every record. Used in tests and as the default
/// before a real sink is wired.
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _level: LogLevel, _message: &str, _fields: &Fields) {}
}

/// Shared no-op logger instance.
pub fn noop() -> Arc<dyn Logger> {
    Arc::new(NoopLogger)
}

/// Install the global `tracing` subscriber with env-filter support
/// (`RUST_LOG`). Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
