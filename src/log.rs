//! Plumbing between the `log` facade and the client's log upcall.
//!
//! The facade accepts exactly one logger registration per process, while
//! every debugger instance arrives with its own upcalls. The registered
//! logger is therefore a fixed router whose destination is swapped out each
//! time a debugger is built; records arriving while no destination is set
//! are dropped.

use crate::debugger::hook::EventHook;
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;
use std::sync::{Arc, RwLock};

/// Forwards engine log records into the client `log` upcall.
///
/// The upcall must not log through the `log` facade itself, that would recurse.
pub struct HookLogger {
    hook: Arc<dyn EventHook>,
}

impl HookLogger {
    pub fn new(hook: Arc<dyn EventHook>) -> Self {
        Self { hook }
    }
}

impl Log for HookLogger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.hook.log(record.level(), &record.args().to_string());
    }

    fn flush(&self) {}
}

/// The process-global registration target: an exchangeable [`HookLogger`]
/// slot, empty until the first debugger is built.
struct LogRouter {
    destination: RwLock<Option<HookLogger>>,
}

static ROUTER: Lazy<LogRouter> = Lazy::new(|| LogRouter {
    destination: RwLock::new(None),
});

impl Log for LogRouter {
    fn enabled(&self, _: &Metadata) -> bool {
        self.destination.read().unwrap().is_some()
    }

    fn log(&self, record: &Record) {
        if let Some(destination) = &*self.destination.read().unwrap() {
            destination.log(record);
        }
    }

    fn flush(&self) {}
}

/// Point engine logging at the given upcalls.
///
/// The first call registers the router with the `log` facade (a second
/// registration attempt is rejected by the facade and ignored here); every
/// call replaces the active destination and the maximum level.
pub(crate) fn route_to(hook: Arc<dyn EventHook>, level: LevelFilter) {
    let router = Lazy::force(&ROUTER);
    let _ = log::set_logger(router);
    log::set_max_level(level);
    *router.destination.write().unwrap() = Some(HookLogger::new(hook));
}
