//! Shared collaborators injected into every node and request.

use std::fmt;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::WattgridConfig;
use crate::hooks::{self, HookEvent, Hooks, LogHooks};

/// Configuration, time source, and hook sink, read-only once built.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<WattgridConfig>,
    pub clock: Arc<dyn Clock>,
    pub hooks: Arc<dyn Hooks>,
}

impl Context {
    pub fn new(config: WattgridConfig, clock: Arc<dyn Clock>, hooks: Arc<dyn Hooks>) -> Self {
        Self {
            config: Arc::new(config),
            clock,
            hooks,
        }
    }

    /// Wall clock and log-only hooks.
    pub fn system(config: WattgridConfig) -> Self {
        Self::new(config, Arc::new(SystemClock), Arc::new(LogHooks))
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn fire(&self, event: HookEvent) {
        hooks::fire(self.hooks.as_ref(), event);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("now", &self.clock.now())
            .finish_non_exhaustive()
    }
}
