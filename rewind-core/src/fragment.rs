//! # Fragments
//!
//! Fragments are the immutable serialized pieces a snapshot is made of: one
//! element's content at one point in time, keyed by (identity, version). A
//! capture is deduplicated against each element's newest surviving fragment by
//! content digest, so capturing a mostly-unchanged scene stores only what
//! actually changed. Fragments are reference counted by the snapshots naming
//! them and evicted when the last reference is released.

use crate::ElementID;

/// Key of one stored fragment: which element, and which version of its content.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct FragmentRef {
    element: ElementID,
    version: u64,
}
impl FragmentRef {
    #[must_use]
    pub fn element(&self) -> ElementID {
        self.element
    }
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }
}
impl std::fmt::Display for FragmentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.element, self.version)
    }
}

struct Fragment {
    bytes: Box<[u8]>,
    digest: blake3::Hash,
    refs: usize,
}

#[derive(Default)]
struct VersionChain {
    /// Version -> fragment. Ordered, so the newest survivor is the last entry.
    versions: std::collections::BTreeMap<u64, Fragment>,
    /// Last version number handed out. Monotonic per element, never reissued
    /// while the element has resident fragments.
    last_version: u64,
}

/// Content-addressable store of serialized element state, shared by every
/// snapshot on the timeline.
#[derive(Default)]
pub struct FragmentStore {
    elements: hashbrown::HashMap<ElementID, VersionChain>,
}

impl FragmentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes` as the newest content of `element` - or, if the content is
    /// bit-identical to the element's newest stored fragment, reuse that
    /// fragment instead of duplicating it. This is what makes capturing an
    /// unchanged element cheap.
    ///
    /// The returned reference owns one refcount on behalf of the caller.
    #[must_use = "the returned reference owns a refcount and must eventually be released"]
    pub fn put(&mut self, element: ElementID, bytes: &[u8]) -> FragmentRef {
        let digest = blake3::hash(bytes);
        let chain = self.elements.entry(element).or_default();
        if let Some((&version, newest)) = chain.versions.iter_mut().next_back() {
            if newest.digest == digest {
                newest.refs += 1;
                log::trace!("{element} unchanged, sharing v{version}");
                return FragmentRef { element, version };
            }
        }
        chain.last_version += 1;
        let version = chain.last_version;
        chain.versions.insert(
            version,
            Fragment {
                bytes: bytes.into(),
                digest,
                refs: 1,
            },
        );
        log::trace!("{element} stored as v{version}, {} bytes", bytes.len());
        FragmentRef { element, version }
    }

    /// Read a fragment's content. Never deserializes or mutates anything.
    ///
    /// A dangling reference means the timeline's reference counting is broken,
    /// and this does not return in that case - reconstructing from a half-lost
    /// snapshot would corrupt the visible scene.
    #[must_use]
    pub fn get(&self, fragment: FragmentRef) -> &[u8] {
        let Some(found) = self
            .elements
            .get(&fragment.element)
            .and_then(|chain| chain.versions.get(&fragment.version))
        else {
            log::error!("{fragment} referenced after eviction");
            panic!("{fragment} referenced after eviction");
        };
        &found.bytes
    }

    /// Add a reference to an existing fragment.
    pub fn retain(&mut self, fragment: FragmentRef) {
        self.fragment_mut(fragment).refs += 1;
    }

    /// Drop a reference. Releasing the last one evicts the fragment and frees
    /// its backing storage.
    pub fn release(&mut self, fragment: FragmentRef) {
        let found = self.fragment_mut(fragment);
        // Refs is at least 1 while the fragment is resident.
        found.refs -= 1;
        if found.refs > 0 {
            return;
        }
        // Unwraps OK - fragment_mut above just resolved both lookups.
        let chain = self.elements.get_mut(&fragment.element).unwrap();
        chain.versions.remove(&fragment.version).unwrap();
        log::trace!("{fragment} evicted");
        if chain.versions.is_empty() {
            self.elements.remove(&fragment.element);
        }
    }

    fn fragment_mut(&mut self, fragment: FragmentRef) -> &mut Fragment {
        let Some(found) = self
            .elements
            .get_mut(&fragment.element)
            .and_then(|chain| chain.versions.get_mut(&fragment.version))
        else {
            log::error!("{fragment} referenced after eviction");
            panic!("{fragment} referenced after eviction");
        };
        found
    }

    /// Total count of resident fragments across all elements.
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.elements.values().map(|chain| chain.versions.len()).sum()
    }

    /// Count of resident fragments for one element. Zero once every snapshot
    /// referencing the element is gone.
    #[must_use]
    pub fn versions_of(&self, element: ElementID) -> usize {
        self.elements
            .get(&element)
            .map_or(0, |chain| chain.versions.len())
    }

    /// Bytes of serialized content currently resident.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.elements
            .values()
            .flat_map(|chain| chain.versions.values())
            .map(|fragment| fragment.bytes.len())
            .fold(0, usize::saturating_add)
    }
}

#[cfg(test)]
mod test {
    use super::FragmentStore;
    use crate::ElementID;

    #[test]
    fn identical_content_shares_a_fragment() {
        let mut store = FragmentStore::new();
        let element = ElementID::default();

        let first = store.put(element, b"triangle soup");
        let second = store.put(element, b"triangle soup");

        assert_eq!(first, second);
        assert_eq!(store.fragment_count(), 1);
        assert_eq!(store.get(first), b"triangle soup");

        // Still resident after dropping one of the two references.
        store.release(first);
        assert_eq!(store.get(second), b"triangle soup");
    }

    #[test]
    fn changed_content_advances_the_version() {
        let mut store = FragmentStore::new();
        let element = ElementID::default();

        let old = store.put(element, b"before");
        let new = store.put(element, b"after");

        assert_ne!(old, new);
        assert!(new.version() > old.version());
        assert_eq!(store.versions_of(element), 2);
        assert_eq!(store.get(old), b"before");
        assert_eq!(store.get(new), b"after");
    }

    #[test]
    fn dedup_follows_the_newest_survivor() {
        let mut store = FragmentStore::new();
        let element = ElementID::default();

        let old = store.put(element, b"before");
        let new = store.put(element, b"after");
        // The abandoned newest version goes away...
        store.release(new);
        // ...and dedup compares against what actually survives.
        let again = store.put(element, b"before");
        assert_eq!(again, old);
        assert_eq!(store.versions_of(element), 1);
    }

    #[test]
    fn release_to_zero_evicts() {
        let mut store = FragmentStore::new();
        let element = ElementID::default();

        let fragment = store.put(element, b"ephemeral");
        store.retain(fragment);
        assert_eq!(store.memory_usage(), b"ephemeral".len());

        store.release(fragment);
        assert_eq!(store.fragment_count(), 1);
        store.release(fragment);
        assert_eq!(store.fragment_count(), 0);
        assert_eq!(store.versions_of(element), 0);
        assert_eq!(store.memory_usage(), 0);
    }

    #[test]
    #[should_panic(expected = "referenced after eviction")]
    fn get_after_eviction_is_fatal() {
        let mut store = FragmentStore::new();
        let element = ElementID::default();

        let fragment = store.put(element, b"gone");
        store.release(fragment);
        let _ = store.get(fragment);
    }
}
