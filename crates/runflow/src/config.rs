//! Callback configuration resolution
//!
//! Call sites collect callbacks from two places: ones passed inline for a
//! single invocation, and ones inherited from an enclosing component. This
//! module merges the two into one manager. A manager instance on either side
//! becomes the base (keeping its run forest); loose handler lists are unioned
//! into it, deduplicated by handler identity.

use std::collections::HashMap;

use crate::async_manager::AsyncCallbackManager;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::manager::{CallbackManager, ManagerState};

/// A source of callbacks: a loose handler list or an existing manager.
#[derive(Debug, Clone)]
pub enum Callbacks {
    /// Plain handlers, not yet attached to a run forest
    Handlers(Vec<Handler>),
    /// An existing sync manager, carrying its run forest
    Manager(CallbackManager),
    /// An existing async manager, carrying its run forest
    AsyncManager(AsyncCallbackManager),
}

impl From<Vec<Handler>> for Callbacks {
    fn from(handlers: Vec<Handler>) -> Self {
        Self::Handlers(handlers)
    }
}

impl From<Handler> for Callbacks {
    fn from(handler: Handler) -> Self {
        Self::Handlers(vec![handler])
    }
}

impl From<CallbackManager> for Callbacks {
    fn from(manager: CallbackManager) -> Self {
        Self::Manager(manager)
    }
}

impl From<AsyncCallbackManager> for Callbacks {
    fn from(manager: AsyncCallbackManager) -> Self {
        Self::AsyncManager(manager)
    }
}

impl Callbacks {
    const fn is_manager(&self) -> bool {
        matches!(self, Self::Manager(_) | Self::AsyncManager(_))
    }
}

/// Inputs to callback resolution for one component invocation.
#[derive(Debug, Clone, Default)]
pub struct CallbackConfig {
    inline_callbacks: Option<Callbacks>,
    inherited_callbacks: Option<Callbacks>,
    verbose: bool,
    local_tags: Vec<String>,
    inheritable_tags: Vec<String>,
    local_metadata: HashMap<String, serde_json::Value>,
    inheritable_metadata: HashMap<String, serde_json::Value>,
}

impl CallbackConfig {
    /// Callbacks passed inline for this invocation.
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: impl Into<Callbacks>) -> Self {
        self.inline_callbacks = Some(callbacks.into());
        self
    }

    /// Callbacks inherited from the enclosing component.
    #[must_use]
    pub fn with_inherited_callbacks(mut self, callbacks: impl Into<Callbacks>) -> Self {
        self.inherited_callbacks = Some(callbacks.into());
        self
    }

    /// Force verbose dispatch for the resolved manager.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Tags applied to this invocation's runs only.
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.local_tags = tags;
        self
    }

    /// Tags applied here and inherited by child managers.
    #[must_use]
    pub fn with_inheritable_tags(mut self, tags: Vec<String>) -> Self {
        self.inheritable_tags = tags;
        self
    }

    /// Metadata applied to this invocation's runs only.
    #[must_use]
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.local_metadata = metadata;
        self
    }

    /// Metadata applied here and inherited by child managers.
    #[must_use]
    pub fn with_inheritable_metadata(
        mut self,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        self.inheritable_metadata = metadata;
        self
    }
}

/// Merge a config into one manager state.
///
/// A manager instance on either side is the base, keeping its parent run,
/// execution counter, and error log so nested resolution stays in the same
/// run forest. Handler lists are unioned in without duplicating instances.
pub(crate) fn resolve(config: CallbackConfig) -> Result<ManagerState> {
    let CallbackConfig {
        inline_callbacks,
        inherited_callbacks,
        verbose,
        local_tags,
        inheritable_tags,
        local_metadata,
        inheritable_metadata,
    } = config;

    if inline_callbacks.as_ref().is_some_and(Callbacks::is_manager)
        && inherited_callbacks
            .as_ref()
            .is_some_and(Callbacks::is_manager)
    {
        return Err(Error::InvalidConfig(
            "inline and inherited callbacks cannot both be manager instances".to_string(),
        ));
    }

    let mut state = ManagerState::default();
    let mut loose: Vec<Handler> = Vec::new();
    for source in [inline_callbacks, inherited_callbacks] {
        match source {
            Some(Callbacks::Manager(m)) => state = m.state,
            Some(Callbacks::AsyncManager(m)) => state = m.state,
            Some(Callbacks::Handlers(handlers)) => loose.extend(handlers),
            None => {}
        }
    }
    for handler in loose {
        if !state.handlers.iter().any(|h| h.same_handler(&handler)) {
            state.handlers.push(handler);
        }
    }

    for tag in inheritable_tags {
        if !state.tags.contains(&tag) {
            state.tags.push(tag.clone());
        }
        if !state.inheritable_tags.contains(&tag) {
            state.inheritable_tags.push(tag);
        }
    }
    for tag in local_tags {
        if !state.tags.contains(&tag) {
            state.tags.push(tag);
        }
    }

    for (key, value) in inheritable_metadata {
        state.metadata.insert(key.clone(), value.clone());
        state.inheritable_metadata.insert(key, value);
    }
    for (key, value) in local_metadata {
        state.metadata.insert(key, value);
    }

    state.verbose = state.verbose || verbose;
    Ok(state)
}

impl CallbackManager {
    /// Resolve a [`CallbackConfig`] into a sync manager.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when both callback sources are
    /// manager instances; which forest such a merge should join is ambiguous.
    pub fn configure(config: CallbackConfig) -> Result<Self> {
        Ok(Self::from_state(resolve(config)?))
    }
}

impl AsyncCallbackManager {
    /// Resolve a [`CallbackConfig`] into an async manager.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when both callback sources are
    /// manager instances; which forest such a merge should join is ambiguous.
    pub fn configure(config: CallbackConfig) -> Result<Self> {
        Ok(Self::from_state(resolve(config)?))
    }
}
