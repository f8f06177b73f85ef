//! Inbound event fan-out: hooks build per-message state, callbacks react.
//!
//! Every inbound message first runs through all hooks in registration
//! order. Each hook returns a partial [`HookState`] and the partials are
//! merged (later keys win). The merged state is then handed to every
//! callback registered for the message's [`EventKind`], in list order. A
//! callback may patch the event in place and may return [`Flow::Stop`] to
//! skip the remaining callbacks for this one dispatch.
//!
//! Failures never escape the dispatch except in one case: a failure while
//! handling an [`Event::Error`] (or an error event nobody listens to) is
//! returned as [`DispatchError::Unhandled`].

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::events::{Event, EventKind, HandlerFailure};

// ---------------------------------------------------------------------------
// HookState
// ---------------------------------------------------------------------------

/// Shared state assembled by hooks for a single message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookState(Map<String, Value>);

impl HookState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Deserialize a value. `None` if missing or of the wrong shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Merge `other` into `self`; keys in `other` overwrite.
    pub fn merge(&mut self, other: HookState) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Runs on every inbound message before callbacks.
pub trait Hook: Send + Sync {
    fn run<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, anyhow::Result<HookState>>;
}

impl<F> Hook for F
where
    F: Fn(&Event) -> anyhow::Result<HookState> + Send + Sync,
{
    fn run<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, anyhow::Result<HookState>> {
        futures::future::ready(self(event)).boxed()
    }
}

/// What a callback wants to happen to the rest of the dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flow {
    #[default]
    Continue,
    /// Skip the remaining callbacks for this dispatch.
    Stop,
}

/// Runs for events of the kind it was registered under.
pub trait Callback: Send + Sync {
    fn call<'a>(
        &'a self,
        event: &'a mut Event,
        state: &'a HookState,
    ) -> BoxFuture<'a, anyhow::Result<Flow>>;
}

impl<F> Callback for F
where
    F: Fn(&mut Event, &HookState) -> anyhow::Result<Flow> + Send + Sync,
{
    fn call<'a>(
        &'a self,
        event: &'a mut Event,
        state: &'a HookState,
    ) -> BoxFuture<'a, anyhow::Result<Flow>> {
        futures::future::ready(self(event, state)).boxed()
    }
}

/// Registered callback handle. Removal compares by identity.
pub type CallbackRef = Arc<dyn Callback>;

fn same_callback(a: &CallbackRef, b: &CallbackRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

// ---------------------------------------------------------------------------
// Errors / reports
// ---------------------------------------------------------------------------

/// The one failure a dispatch returns to its caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// No error callback took the failure, or an error callback failed too.
    #[error("unhandled {0}")]
    Unhandled(HandlerFailure),
}

/// Outcome of a callback pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dispatched {
    /// Callbacks that ran.
    pub count: usize,
    /// Whether a callback returned [`Flow::Stop`].
    pub stopped: bool,
}

// ---------------------------------------------------------------------------
// DispatchPipeline
// ---------------------------------------------------------------------------

/// Hook chain plus per-kind callback lists.
///
/// Lists are snapshotted at the start of each stage, so a handler that
/// registers or removes handlers affects the next message, not the current
/// one.
#[derive(Default)]
pub struct DispatchPipeline {
    hooks: RwLock<Vec<Arc<dyn Hook>>>,
    callbacks: RwLock<HashMap<EventKind, Vec<CallbackRef>>>,
}

impl DispatchPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook. Hooks cannot be removed.
    pub fn add_hook<H: Hook + 'static>(&self, hook: H) {
        self.hooks.write().push(Arc::new(hook));
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.read().len()
    }

    /// Append a callback for `kind`, returning its handle.
    pub fn add_callback<C: Callback + 'static>(
        &self,
        kind: impl Into<EventKind>,
        callback: C,
    ) -> CallbackRef {
        let callback: CallbackRef = Arc::new(callback);
        self.add_callbacks(kind, [callback.clone()]);
        callback
    }

    /// Append several callbacks at once, keeping their order.
    pub fn add_callbacks(
        &self,
        kind: impl Into<EventKind>,
        callbacks: impl IntoIterator<Item = CallbackRef>,
    ) {
        self.callbacks
            .write()
            .entry(kind.into())
            .or_default()
            .extend(callbacks);
    }

    /// Insert a callback in front of every existing one for `kind`.
    pub fn prepend_callback<C: Callback + 'static>(
        &self,
        kind: impl Into<EventKind>,
        callback: C,
    ) -> CallbackRef {
        let callback: CallbackRef = Arc::new(callback);
        self.prepend_callbacks(kind, [callback.clone()]);
        callback
    }

    /// Insert several callbacks in front, keeping their relative order.
    pub fn prepend_callbacks(
        &self,
        kind: impl Into<EventKind>,
        callbacks: impl IntoIterator<Item = CallbackRef>,
    ) {
        let mut map = self.callbacks.write();
        let list = map.entry(kind.into()).or_default();
        list.splice(0..0, callbacks);
    }

    /// Remove `callback` from `kind`, or every callback of `kind` when
    /// `callback` is `None`. Returns the removed handle in the first case.
    pub fn remove_callback(
        &self,
        kind: impl Into<EventKind>,
        callback: Option<&CallbackRef>,
    ) -> Option<CallbackRef> {
        let mut map = self.callbacks.write();
        let list = map.get_mut(&kind.into())?;
        match callback {
            None => {
                list.clear();
                None
            }
            Some(target) => {
                let index = list.iter().position(|c| same_callback(c, target))?;
                Some(list.remove(index))
            }
        }
    }

    pub fn callback_count(&self, kind: impl Into<EventKind>) -> usize {
        self.callbacks
            .read()
            .get(&kind.into())
            .map_or(0, Vec::len)
    }

    /// Run both stages for one message.
    pub async fn dispatch(&self, mut event: Event) -> Result<Dispatched, DispatchError> {
        let state = self.run_hooks(&event).await;
        self.invoke(&mut event, &state).await
    }

    /// Hook stage. A failing hook aborts the chain, raises an error event
    /// and yields an empty state.
    pub async fn run_hooks(&self, event: &Event) -> HookState {
        let hooks = self.hooks.read().clone();
        let mut state = HookState::new();
        for hook in hooks {
            match hook.run(event).await {
                Ok(partial) => state.merge(partial),
                Err(error) => {
                    tracing::debug!(kind = %event.kind(), "Unable to execute all hooks safely");
                    let failure = HandlerFailure::new(event.kind(), error);
                    if let Err(unhandled) = self.raise(failure).await {
                        tracing::error!(error = %unhandled, "Hook failure was not handled");
                    }
                    return HookState::new();
                }
            }
        }
        state
    }

    /// Callback stage for `event`'s kind.
    pub async fn invoke(
        &self,
        event: &mut Event,
        state: &HookState,
    ) -> Result<Dispatched, DispatchError> {
        let kind = event.kind();
        let callbacks = self
            .callbacks
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        if let Event::Error(failure) = &*event
            && callbacks.is_empty()
        {
            return Err(DispatchError::Unhandled(failure.clone()));
        }

        let mut report = Dispatched::default();
        let mut unhandled = None;
        for callback in callbacks {
            report.count += 1;
            match callback.call(event, state).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => {
                    report.stopped = true;
                    break;
                }
                Err(error) => {
                    // An error handler failing must not feed back into itself.
                    if let Event::Error(original) = &*event {
                        tracing::debug!(%error, "Error callback failed");
                        return Err(DispatchError::Unhandled(original.clone()));
                    }
                    let failure = HandlerFailure::new(kind, error);
                    if let Err(err) = self.raise(failure).await {
                        unhandled.get_or_insert(err);
                    }
                }
            }
        }

        match unhandled {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Deliver a failure to the error callbacks.
    pub fn raise(&self, failure: HandlerFailure) -> BoxFuture<'_, Result<Dispatched, DispatchError>> {
        async move {
            let mut event = Event::Error(failure);
            self.invoke(&mut event, &HookState::new()).await
        }
        .boxed()
    }
}

impl std::fmt::Debug for DispatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let callbacks = self.callbacks.read();
        f.debug_struct("DispatchPipeline")
            .field("hooks", &self.hooks.read().len())
            .field("callback_kinds", &callbacks.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
