//! Event notifier - per-kind subscriber fan-out for server pushes

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::error::Result;

/// Subscriber callback. Returning an error stops the fan-out.
pub type Handler<P> = Arc<dyn Fn(&P) -> Result<()> + Send + Sync>;

/// Ordered subscriber lists keyed by event kind
pub struct Notifier<K, P> {
    handlers: Mutex<HashMap<K, Vec<Handler<P>>>>,
}

impl<K, P> Notifier<K, P>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe `handler` to `kind`. The same handler may be added twice.
    pub fn add(&self, kind: K, handler: Handler<P>) {
        self.lock().entry(kind).or_default().push(handler);
    }

    /// Remove the first subscription of `handler` to `kind`.
    /// Returns whether one was found.
    pub fn remove(&self, kind: &K, handler: &Handler<P>) -> bool {
        let mut handlers = self.lock();
        let Some(list) = handlers.get_mut(kind) else {
            return false;
        };
        let Some(pos) = list.iter().position(|h| Arc::ptr_eq(h, handler)) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            handlers.remove(kind);
        }
        true
    }

    /// Call every handler of `kind` in registration order.
    ///
    /// The first handler error is returned and the remaining handlers are
    /// skipped.
    pub fn notify(&self, kind: &K, payload: &P) -> Result<()> {
        // Snapshot so handlers may subscribe or unsubscribe while running
        let snapshot: Vec<Handler<P>> = match self.lock().get(kind) {
            Some(list) => list.clone(),
            None => return Ok(()),
        };
        for handler in snapshot {
            handler(payload)?;
        }
        Ok(())
    }

    /// Number of handlers subscribed to `kind`
    pub fn count(&self, kind: &K) -> usize {
        self.lock().get(kind).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Vec<Handler<P>>>> {
        self.handlers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<K, P> Default for Notifier<K, P>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Kind {
        Joined,
        Left,
    }

    fn pushing(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Handler<String> {
        let log = log.clone();
        Arc::new(move |p: &String| {
            log.lock().unwrap().push(format!("{}:{}", tag, p));
            Ok(())
        })
    }

    #[test]
    fn test_fan_out_in_registration_order() {
        let notifier: Notifier<Kind, String> = Notifier::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        notifier.add(Kind::Joined, pushing(&log, "a"));
        notifier.add(Kind::Joined, pushing(&log, "b"));
        notifier.add(Kind::Left, pushing(&log, "c"));

        notifier.notify(&Kind::Joined, &"x".to_string()).unwrap();
        assert_eq!(log.lock().unwrap().as_slice(), &["a:x", "b:x"]);
    }

    #[test]
    fn test_duplicates_and_remove_first() {
        let notifier: Notifier<Kind, String> = Notifier::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = pushing(&log, "h");
        notifier.add(Kind::Joined, handler.clone());
        notifier.add(Kind::Joined, handler.clone());
        assert_eq!(notifier.count(&Kind::Joined), 2);

        assert!(notifier.remove(&Kind::Joined, &handler));
        notifier.notify(&Kind::Joined, &"1".to_string()).unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);

        assert!(notifier.remove(&Kind::Joined, &handler));
        assert!(!notifier.remove(&Kind::Joined, &handler));
        assert_eq!(notifier.count(&Kind::Joined), 0);
    }

    #[test]
    fn test_handler_error_is_fail_fast() {
        let notifier: Notifier<Kind, String> = Notifier::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        notifier.add(
            Kind::Left,
            Arc::new(|_: &String| Err(Error::Handler("nope".into()))),
        );
        notifier.add(Kind::Left, pushing(&log, "after"));

        let result = notifier.notify(&Kind::Left, &"p".to_string());
        assert!(matches!(result, Err(Error::Handler(_))));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_clear() {
        let notifier: Notifier<Kind, String> = Notifier::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        notifier.add(Kind::Joined, pushing(&log, "a"));
        notifier.clear();
        notifier.notify(&Kind::Joined, &"x".to_string()).unwrap();
        assert!(log.lock().unwrap().is_empty());
    }
}
