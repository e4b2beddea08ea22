//! Authorization context registry
//!
//! For each requested GRI the registry keeps a stack of "context" GRIs
//! through which the resource may be reached when a direct fetch is
//! forbidden. Each context remembers the origins (usually list resources)
//! that introduced it; a context without origins is pruned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use graphsync_gri::{auth_hint_prefix, AuthHint};

/// One context of a requested GRI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    pub context_gri: String,
    /// GRIs that introduced this context; `None` for direct registrations
    pub origins: Vec<Option<String>>,
}

impl ContextEntry {
    fn new(context_gri: &str) -> Self {
        Self {
            context_gri: context_gri.to_string(),
            origins: Vec::new(),
        }
    }

    fn add_origin(&mut self, origin: Option<&str>) {
        let origin = origin.map(str::to_string);
        if !self.origins.contains(&origin) {
            self.origins.push(origin);
        }
    }
}

/// Requested GRI -> context stack (most recent last)
#[derive(Debug, Clone, Default)]
pub struct ContextRegistry {
    contexts: Arc<Mutex<HashMap<String, Vec<ContextEntry>>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `context_gri` as a way to reach `requested_gri`
    ///
    /// Ignored (returns false) when no auth hint can be derived from the
    /// context. Registering a known context adds the origin and moves the
    /// context to the top of the stack.
    pub fn register(&self, requested_gri: &str, context_gri: &str, origin_gri: Option<&str>) -> bool {
        if auth_hint_prefix(context_gri).is_none() {
            return false;
        }
        let mut contexts = self.lock();
        Self::register_locked(&mut contexts, requested_gri, context_gri, origin_gri);
        true
    }

    /// Register the same context for every GRI of a collection
    ///
    /// With `remove_for_others`, GRIs that are no longer in the collection
    /// lose the linkage introduced by `origin_gri`.
    pub fn register_array(
        &self,
        requested_gris: &[String],
        context_gri: &str,
        origin_gri: Option<&str>,
        remove_for_others: bool,
    ) {
        if auth_hint_prefix(context_gri).is_none() {
            return;
        }
        let mut contexts = self.lock();
        for requested_gri in requested_gris {
            Self::register_locked(&mut contexts, requested_gri, context_gri, origin_gri);
        }

        if remove_for_others {
            let stale: Vec<String> = contexts
                .iter()
                .filter(|(requested, entries)| {
                    !requested_gris.contains(requested)
                        && entries.iter().any(|e| e.context_gri == context_gri)
                })
                .map(|(requested, _)| requested.clone())
                .collect();
            for requested in stale {
                tracing::trace!("Context {} no longer reaches {}", context_gri, requested);
                Self::deregister_locked(&mut contexts, context_gri, Some(origin_gri), Some(&requested));
            }
        }
    }

    /// Remove contexts whose GRI contains `context_id`
    ///
    /// With `origin_gri` only that origin is removed and the context is
    /// pruned once it has none left; without it the whole context goes.
    /// `requested_gri` limits the removal to one requested GRI.
    pub fn deregister(&self, context_id: &str, origin_gri: Option<&str>, requested_gri: Option<&str>) {
        let mut contexts = self.lock();
        Self::deregister_locked(&mut contexts, context_id, origin_gri.map(Some), requested_gri);
    }

    /// Remove the contexts of `requested_gri` that yield exactly `hint`
    ///
    /// Returns the number of removed contexts.
    pub fn deregister_hint(&self, hint: &AuthHint, requested_gri: &str) -> usize {
        let mut contexts = self.lock();
        let Some(entries) = contexts.get_mut(requested_gri) else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|entry| AuthHint::for_context(&entry.context_gri).as_ref() != Some(hint));
        let removed = before - entries.len();
        if entries.is_empty() {
            contexts.remove(requested_gri);
        }
        removed
    }

    /// Drop every context registered for `requested_gri`
    pub fn forget(&self, requested_gri: &str) {
        self.lock().remove(requested_gri);
    }

    /// Most recently registered context of `requested_gri`
    pub fn get_context(&self, requested_gri: &str) -> Option<String> {
        self.lock()
            .get(requested_gri)
            .and_then(|entries| entries.last())
            .map(|entry| entry.context_gri.clone())
    }

    /// Auth hint derived from the current context of `requested_gri`
    pub fn get_auth_hint(&self, requested_gri: &str) -> Option<AuthHint> {
        self.get_context(requested_gri)
            .and_then(|context| AuthHint::for_context(&context))
    }

    /// All contexts of `requested_gri`, most recent last
    pub fn entries(&self, requested_gri: &str) -> Vec<ContextEntry> {
        self.lock().get(requested_gri).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn register_locked(
        contexts: &mut HashMap<String, Vec<ContextEntry>>,
        requested_gri: &str,
        context_gri: &str,
        origin_gri: Option<&str>,
    ) {
        let entries = contexts.entry(requested_gri.to_string()).or_default();
        let mut entry = match entries.iter().position(|e| e.context_gri == context_gri) {
            Some(index) => entries.remove(index),
            None => ContextEntry::new(context_gri),
        };
        entry.add_origin(origin_gri);
        entries.push(entry);
    }

    // `origin`: None removes whole entries, Some(o) removes origin `o`
    fn deregister_locked(
        contexts: &mut HashMap<String, Vec<ContextEntry>>,
        context_id: &str,
        origin: Option<Option<&str>>,
        requested_gri: Option<&str>,
    ) {
        let prune = |entries: &mut Vec<ContextEntry>| {
            entries.retain_mut(|entry| {
                if !entry.context_gri.contains(context_id) {
                    return true;
                }
                match origin {
                    None => false,
                    Some(origin) => {
                        entry.origins.retain(|o| o.as_deref() != origin);
                        !entry.origins.is_empty()
                    }
                }
            });
        };

        match requested_gri {
            Some(requested) => {
                if let Some(entries) = contexts.get_mut(requested) {
                    prune(entries);
                }
            }
            None => contexts.values_mut().for_each(prune),
        }
        contexts.retain(|_, entries| !entries.is_empty());
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<ContextEntry>>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
