//! Decorator chains around `schedule` and `deliver`.
//!
//! Middleware receives the input and a [`Next`] continuation. The chain is
//! recomposed from the current registration list on every call, so layers
//! registered after earlier calls still apply. The most recently registered
//! layer is outermost: it runs first, and the code after its `next` call
//! runs last.

use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;

/// The rest of the chain.
pub type Next<T, R> = Box<dyn FnOnce(T) -> BoxFuture<'static, R> + Send>;

/// One layer of a chain.
pub type Middleware<T, R> = Arc<dyn Fn(T, Next<T, R>) -> BoxFuture<'static, R> + Send + Sync>;

pub struct Pipeline<T, R> {
    layers: RwLock<Vec<Middleware<T, R>>>,
}

impl<T, R> Default for Pipeline<T, R> {
    fn default() -> Self {
        Self {
            layers: RwLock::new(Vec::new()),
        }
    }
}

impl<T, R> Pipeline<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    pub fn register(&self, layer: Middleware<T, R>) {
        self.layers
            .write()
            .expect("pipeline lock poisoned")
            .push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.read().expect("pipeline lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wrap `terminal` in every registered layer, first registered innermost.
    pub fn resolve(&self, terminal: Next<T, R>) -> Next<T, R> {
        let layers = self.layers.read().expect("pipeline lock poisoned").clone();
        tracing::trace!(layers = layers.len(), "composing pipeline");
        layers
            .into_iter()
            .fold(terminal, |next, layer| -> Next<T, R> {
                Box::new(move |input| layer(input, next))
            })
    }
}
