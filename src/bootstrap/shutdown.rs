use std::sync::{Arc, Mutex};
use tracing::debug;

type Hook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct HookState {
    hooks: Vec<(String, Hook)>,
    ran: bool,
}

/// Cleanup callbacks run by the hosting application's shutdown path
/// (signal handler or normal exit).
///
/// Hooks run once, newest first. Running again is a no-op, and a hook
/// registered after the run executes immediately.
#[derive(Clone, Default)]
pub struct ShutdownHooks {
    state: Arc<Mutex<HookState>>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_shutdown_hook<F>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.ran {
            drop(state);
            debug!(hook = %name, "shutdown already ran, invoking hook now");
            hook();
            return;
        }
        state.hooks.push((name, Box::new(hook)));
    }

    pub fn len(&self) -> usize {
        match self.state.lock() {
            Ok(guard) => guard.hooks.len(),
            Err(poisoned) => poisoned.into_inner().hooks.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs all registered hooks. Returns how many ran.
    pub fn run(&self) -> usize {
        let hooks = {
            let mut state = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.ran {
                return 0;
            }
            state.ran = true;
            std::mem::take(&mut state.hooks)
        };

        let count = hooks.len();
        for (name, hook) in hooks.into_iter().rev() {
            debug!(hook = %name, "running shutdown hook");
            hook();
        }
        count
    }
}

impl std::fmt::Debug for ShutdownHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHooks")
            .field("pending", &self.len())
            .finish()
    }
}
