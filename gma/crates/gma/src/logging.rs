//! Allocator Logging and Tracing
//!
//! Structured events for the slow paths of the allocator: block creation and
//! destruction, failed allocations, budget rejections, defragmentation passes
//! and leaks found at teardown. The hot allocate/free path does not log.
//!
//! Events are retained for inspection and forwarded to the `log` facade,
//! either human-readable or as one JSON object per line.
//!
//! Log Levels:
//! - ERROR: Leaks
//! - WARN: Allocation failures, budget rejections
//! - INFO: Defragmentation passes
//! - DEBUG: Block lifecycle

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Log level for allocator events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

/// Allocator event types
#[derive(Debug, Clone, PartialEq)]
pub enum AllocEvent {
    /// New block (heap) added to a vector
    BlockCreated { block_id: u32, size: u64 },

    /// Block removed from a vector and its heap released
    BlockDestroyed { block_id: u32, size: u64 },

    /// A vector could not place a request
    AllocationFailed {
        size: u64,
        alignment: u64,
        reason: String,
    },

    /// Growth refused because of the heap-type budget
    BudgetExceeded {
        heap_type: String,
        requested: u64,
        usage: u64,
        budget: u64,
    },

    /// Defragmentation pass computed its moves
    DefragPassBegin { pass: u32, moves: usize },

    /// Defragmentation pass committed
    DefragPassEnd {
        pass: u32,
        bytes_moved: u64,
        allocations_moved: u32,
        heaps_freed: u32,
    },

    /// Allocations still alive when their block vector was destroyed
    LeakDetected { allocations: usize, bytes: u64 },
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct AllocLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Forward events to the `log` facade
    pub console: bool,

    /// Render events as JSON
    pub json: bool,

    /// Prefix human-readable lines with a wall-clock timestamp
    pub timestamps: bool,
}

impl Default for AllocLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: true,
            json: false,
            timestamps: true,
        }
    }
}

/// Central event sink
pub struct AllocLogger {
    config: AllocLoggerConfig,
    events: Mutex<Vec<(Instant, AllocEvent)>>,
    enabled: AtomicBool,
}

impl AllocLogger {
    pub fn new(config: AllocLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Record an event
    pub fn log(&self, event: AllocEvent) {
        if !self.is_enabled() {
            return;
        }

        let level = Self::event_level(&event);
        if level > self.config.level {
            return;
        }

        if self.config.console {
            self.output(level, &event);
        }
        self.events.lock().push((Instant::now(), event));
    }

    fn event_level(event: &AllocEvent) -> LogLevel {
        match event {
            AllocEvent::LeakDetected { .. } => LogLevel::Error,
            AllocEvent::AllocationFailed { .. } | AllocEvent::BudgetExceeded { .. } => {
                LogLevel::Warn
            }
            AllocEvent::DefragPassBegin { .. } | AllocEvent::DefragPassEnd { .. } => LogLevel::Info,
            AllocEvent::BlockCreated { .. } | AllocEvent::BlockDestroyed { .. } => LogLevel::Debug,
        }
    }

    fn output(&self, level: LogLevel, event: &AllocEvent) {
        let line = if self.config.json {
            Self::render_json(event).to_string()
        } else if self.config.timestamps {
            let now = chrono::Local::now();
            format!("[{}] {}", now.format("%Y-%m-%d %H:%M:%S%.3f"), Self::render_human(event))
        } else {
            Self::render_human(event)
        };

        match level {
            LogLevel::Error => log::error!(target: "gma", "{}", line),
            LogLevel::Warn => log::warn!(target: "gma", "{}", line),
            LogLevel::Info => log::info!(target: "gma", "{}", line),
            LogLevel::Debug => log::debug!(target: "gma", "{}", line),
            LogLevel::Trace => log::trace!(target: "gma", "{}", line),
        }
    }

    /// Human-readable rendering
    pub fn render_human(event: &AllocEvent) -> String {
        match event {
            AllocEvent::BlockCreated { block_id, size } => {
                format!("[GMA] Block {} created ({} bytes)", block_id, size)
            }
            AllocEvent::BlockDestroyed { block_id, size } => {
                format!("[GMA] Block {} destroyed ({} bytes)", block_id, size)
            }
            AllocEvent::AllocationFailed {
                size,
                alignment,
                reason,
            } => format!(
                "[GMA] Allocation of {} bytes (alignment {}) failed: {}",
                size, alignment, reason
            ),
            AllocEvent::BudgetExceeded {
                heap_type,
                requested,
                usage,
                budget,
            } => format!(
                "[GMA] {} heap budget exceeded: requested {}, usage {}/{}",
                heap_type, requested, usage, budget
            ),
            AllocEvent::DefragPassBegin { pass, moves } => {
                format!("[GMA] Defragmentation pass {} began with {} moves", pass, moves)
            }
            AllocEvent::DefragPassEnd {
                pass,
                bytes_moved,
                allocations_moved,
                heaps_freed,
            } => format!(
                "[GMA] Defragmentation pass {} ended: {} allocations ({} bytes) moved, {} heaps freed",
                pass, allocations_moved, bytes_moved, heaps_freed
            ),
            AllocEvent::LeakDetected { allocations, bytes } => format!(
                "[GMA] {} allocations ({} bytes) still alive at block vector teardown",
                allocations, bytes
            ),
        }
    }

    /// JSON rendering
    pub fn render_json(event: &AllocEvent) -> serde_json::Value {
        match event {
            AllocEvent::BlockCreated { block_id, size } => serde_json::json!({
                "type": "block_created",
                "block_id": block_id,
                "size": size
            }),
            AllocEvent::BlockDestroyed { block_id, size } => serde_json::json!({
                "type": "block_destroyed",
                "block_id": block_id,
                "size": size
            }),
            AllocEvent::AllocationFailed {
                size,
                alignment,
                reason,
            } => serde_json::json!({
                "type": "allocation_failed",
                "size": size,
                "alignment": alignment,
                "reason": reason
            }),
            AllocEvent::BudgetExceeded {
                heap_type,
                requested,
                usage,
                budget,
            } => serde_json::json!({
                "type": "budget_exceeded",
                "heap_type": heap_type,
                "requested": requested,
                "usage": usage,
                "budget": budget
            }),
            AllocEvent::DefragPassBegin { pass, moves } => serde_json::json!({
                "type": "defrag_pass_begin",
                "pass": pass,
                "moves": moves
            }),
            AllocEvent::DefragPassEnd {
                pass,
                bytes_moved,
                allocations_moved,
                heaps_freed,
            } => serde_json::json!({
                "type": "defrag_pass_end",
                "pass": pass,
                "bytes_moved": bytes_moved,
                "allocations_moved": allocations_moved,
                "heaps_freed": heaps_freed
            }),
            AllocEvent::LeakDetected { allocations, bytes } => serde_json::json!({
                "type": "leak_detected",
                "allocations": allocations,
                "bytes": bytes
            }),
        }
    }

    pub fn get_events(&self) -> Vec<(Instant, AllocEvent)> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }
}

impl Default for AllocLogger {
    fn default() -> Self {
        Self::new(AllocLoggerConfig::default())
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_LOGGER: Mutex<AllocLogger> = Mutex::new(AllocLogger::new(AllocLoggerConfig {
        level: LogLevel::Debug,
        ..Default::default()
    }));
}

/// Log an event to the global logger
pub fn log_event(event: AllocEvent) {
    GLOBAL_LOGGER.lock().log(event);
}

/// Replace the global logger configuration (drops retained events)
pub fn configure_logger(config: AllocLoggerConfig) {
    *GLOBAL_LOGGER.lock() = AllocLogger::new(config);
}

/// Number of events retained by the global logger
pub fn get_event_count() -> usize {
    GLOBAL_LOGGER.lock().event_count()
}

/// Copy of the events retained by the global logger
pub fn get_events() -> Vec<AllocEvent> {
    GLOBAL_LOGGER
        .lock()
        .get_events()
        .into_iter()
        .map(|(_, event)| event)
        .collect()
}
