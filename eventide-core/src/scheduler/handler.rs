//! Explicit dispatch from command kind to enactment.

use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use futures::future::BoxFuture;

use super::command::{CommandFailed, ScheduledCommand};

/// Carries out a scheduled command against its target.
pub type Enactor<Id, C> =
    Arc<dyn Fn(ScheduledCommand<Id, C>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Reacts to a failed delivery. It may record compensating events, then
/// returns the failure, possibly after calling
/// [`cancel`](CommandFailed::cancel) or [`retry`](CommandFailed::retry).
pub type FailureHandler<Id, C> = Arc<
    dyn Fn(
            ScheduledCommand<Id, C>,
            CommandFailed,
        ) -> BoxFuture<'static, anyhow::Result<CommandFailed>>
        + Send
        + Sync,
>;

/// Builds an enactor for a command kind nobody registered explicitly.
pub type HandlerFactory<Id, C> = Arc<dyn Fn(&str) -> Option<Enactor<Id, C>> + Send + Sync>;

pub(crate) struct HandlerTable<Id, C> {
    explicit: DashMap<String, Enactor<Id, C>>,
    fallback: RwLock<Option<Enactor<Id, C>>>,
    factory: RwLock<Option<HandlerFactory<Id, C>>>,
    failure: DashMap<String, FailureHandler<Id, C>>,
}

impl<Id, C> Default for HandlerTable<Id, C> {
    fn default() -> Self {
        Self {
            explicit: DashMap::new(),
            fallback: RwLock::new(None),
            factory: RwLock::new(None),
            failure: DashMap::new(),
        }
    }
}

impl<Id, C> HandlerTable<Id, C> {
    pub(crate) fn register(&self, kind: impl Into<String>, enactor: Enactor<Id, C>) {
        self.explicit.insert(kind.into(), enactor);
    }

    pub(crate) fn set_fallback(&self, enactor: Enactor<Id, C>) {
        *self.fallback.write().expect("handler table lock poisoned") = Some(enactor);
    }

    pub(crate) fn set_factory(&self, factory: HandlerFactory<Id, C>) {
        *self.factory.write().expect("handler table lock poisoned") = Some(factory);
    }

    pub(crate) fn on_failure(&self, kind: impl Into<String>, handler: FailureHandler<Id, C>) {
        self.failure.insert(kind.into(), handler);
    }

    /// Explicit registration first, then the fallback, then the factory.
    /// Factory results are cached as explicit registrations.
    pub(crate) fn lookup(&self, kind: &str) -> Option<Enactor<Id, C>> {
        if let Some(enactor) = self.explicit.get(kind) {
            return Some(Arc::clone(enactor.value()));
        }
        let fallback = self
            .fallback
            .read()
            .expect("handler table lock poisoned")
            .clone();
        if fallback.is_some() {
            return fallback;
        }
        let factory = self
            .factory
            .read()
            .expect("handler table lock poisoned")
            .clone()?;
        let built = factory(kind)?;
        tracing::trace!(kind, "handler built by factory");
        self.explicit.insert(kind.to_string(), Arc::clone(&built));
        Some(built)
    }

    pub(crate) fn failure_handler(&self, kind: &str) -> Option<FailureHandler<Id, C>> {
        self.failure.get(kind).map(|h| Arc::clone(h.value()))
    }
}
