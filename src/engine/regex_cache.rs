use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};

const CACHE_CAPACITY: usize = 1024;

/// Process-wide compile cache keyed by `(rule id, predicate index)`. A failed
/// compile is cached as `None` so a bad pattern costs one attempt, not one
/// per request. The stored pattern guards against a rule edit reusing the key.
static CACHE: Lazy<Mutex<LruCache<(String, usize), CachedRegex>>> = Lazy::new(|| {
    Mutex::new(LruCache::new(
        NonZeroUsize::new(CACHE_CAPACITY).expect("cache capacity is non-zero"),
    ))
});

#[derive(Clone)]
struct CachedRegex {
    pattern: Arc<str>,
    compiled: Arc<Option<Regex>>,
}

pub(crate) fn compiled(rule_id: &str, index: usize, pattern: &str) -> Arc<Option<Regex>> {
    let key = (rule_id.to_string(), index);
    let mut cache = CACHE.lock();
    if let Some(entry) = cache.get(&key) {
        if entry.pattern.as_ref() == pattern {
            return entry.compiled.clone();
        }
    }

    let compiled = Arc::new(compile(pattern));
    cache.put(
        key,
        CachedRegex {
            pattern: Arc::from(pattern),
            compiled: compiled.clone(),
        },
    );
    compiled
}

fn compile(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_compiled_pattern() {
        let first = compiled("cache-test-rule", 0, "^bot");
        let second = compiled("cache-test-rule", 0, "^bot");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.as_ref().as_ref().is_some());
    }

    #[test]
    fn invalid_pattern_caches_as_none() {
        let entry = compiled("cache-test-bad", 3, "(");
        assert!(entry.as_ref().as_ref().is_none());
    }

    #[test]
    fn pattern_change_recompiles_under_same_key() {
        let first = compiled("cache-test-edit", 1, "^a");
        let second = compiled("cache-test-edit", 1, "^b");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.as_ref().as_ref().unwrap().is_match("B-side"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let entry = compiled("cache-test-ci", 0, "mozilla");
        assert!(entry.as_ref().as_ref().unwrap().is_match("MOZILLA/5.0"));
    }
}
