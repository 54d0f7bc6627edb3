//! Listener hooks for circuit breaker state transitions

use crate::circuit::CircuitState;
use std::sync::Arc;

/// A state change that actually happened on a breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<'a> {
    pub circuit: &'a str,
    pub from: CircuitState,
    pub to: CircuitState,
}

type Listener = Arc<dyn Fn(&Transition<'_>) + Send + Sync>;

/// Registered transition listeners, fired in registration order
#[derive(Clone, Default)]
pub struct Callbacks {
    listeners: Vec<Listener>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen to every transition
    pub fn push<F>(&mut self, f: F)
    where
        F: Fn(&Transition<'_>) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(f));
    }

    /// Listen only to transitions entering `target`
    pub fn push_on_enter<F>(&mut self, target: CircuitState, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.push(move |transition| {
            if transition.to == target {
                f(transition.circuit);
            }
        });
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn fire(&self, transition: &Transition<'_>) {
        for listener in &self.listeners {
            listener(transition);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
