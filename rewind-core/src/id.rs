//! # Identity
//!
//! The timeline recognizes "the same" scene element across captures purely by a
//! stable identity: an integer assigned once when the element is created and kept
//! for the whole session, no matter how often its content changes. Identities are
//! minted via the `StableID<T>` type, which hands out process-unique IDs
//! namespaced by the type T.
//!
//! To acquire an ID, use `StableID<YourNamespaceTy>`'s `Default` impl. To eagerly
//! acquire many ids at once, use `StableID::many`. Scene elements (objects,
//! volumes, instances) all share the single [`ElementID`] namespace, so a
//! selection pair can reference any kind uniformly.

// Collection of pending IDs by namespace type.
// An RWLock'd BTreeMap from typeID to the next available numeric ID.
static ID_SERVER: parking_lot::RwLock<
    std::collections::BTreeMap<std::any::TypeId, std::sync::atomic::AtomicU64>,
> = parking_lot::const_rwlock(std::collections::BTreeMap::new());

/// ID that is guaranteed unique within this execution of the program.
/// IDs with different namespaces may share a value but should not be considered equal.
pub struct StableID<T: std::any::Any> {
    id: std::num::NonZeroU64,
    // Namespace marker
    _phantom: std::marker::PhantomData<T>,
}
impl<T: std::any::Any> Clone for StableID<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: std::any::Any> Copy for StableID<T> {}
impl<T: std::any::Any> std::cmp::PartialEq<StableID<T>> for StableID<T> {
    fn eq(&self, other: &StableID<T>) -> bool {
        // Namespaces already agree at compile time.
        self.id == other.id
    }
}
impl<T: std::any::Any> std::cmp::Eq for StableID<T> {}

// Safety - it's just a u64. We need these because if T is !Send or !Sync that
// is carried over to the ID, even though no T is ever stored.
unsafe impl<T: std::any::Any> Send for StableID<T> {}
unsafe impl<T: std::any::Any> Sync for StableID<T> {}

impl<T: std::any::Any> std::hash::Hash for StableID<T> {
    /// A note on hashes - this relies on the internal representation of `TypeID`,
    /// which is unstable between compilations. Do NOT serialize or otherwise rely on
    /// comparisons between hashes from different executions of the program.
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::any::TypeId::of::<T>().hash(state);
        self.id.hash(state);
    }
}

impl<T: std::any::Any> StableID<T> {
    /// Get the raw numeric value of this ID.
    /// IDs from differing namespaces may share the same numeric ID!
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id.get()
    }
    /// Allocate many IDs at once, much cheaper than one at a time for bulk element
    /// creation, without allocating.
    ///
    /// IDs are assigned eagerly - dropping the returned iterator early does *not*
    /// recycle the unused IDs. Attempting to allocate past the `u64::MAX - 1`
    /// available IDs terminates the program: identities must never repeat within
    /// a session, or a snapshot could silently alias two different elements.
    ///
    /// *The order of IDs is undefined.* All that's guaranteed is uniqueness.
    pub fn many(count: usize) -> impl ExactSizeIterator<Item = Self> {
        // Count of 0 is not a logic error, it is handled gracefully.
        // Usize is always <= 64 bits.
        let count_u64 = count as u64;

        // An ID of zero would not fit NonZeroU64 - start at one and go up.
        let start_id = {
            let read = ID_SERVER.upgradable_read();
            let ty = std::any::TypeId::of::<T>();
            if let Some(atomic) = read.get(&ty) {
                // Order doesn't matter, the IDs just need to be unique.
                atomic.fetch_add(count_u64, std::sync::atomic::Ordering::Relaxed)
            } else {
                // First allocation in this namespace - transition to exclusive
                // access. Happens at most a handful of times per program run, so
                // the other path is the one worth optimizing for.
                let mut write = parking_lot::RwLockUpgradableReadGuard::upgrade(read);
                // Initialize at count+1, return a start ID of 1.
                // Wrapping add - requesting u64::MAX-1 is not incorrect, but the
                // next allocation after it will crash.
                write.insert(ty, (count_u64.wrapping_add(1)).into());
                1
            }
        };

        // Overflow occurred - the pool of unique IDs is exhausted and global
        // state is unfixably broken, so no thread may be allowed to continue.
        #[allow(clippy::manual_assert)]
        if (start_id.wrapping_add(count_u64)) <= count_u64 {
            // In builds, terminate. In testing, panic, so that tests for overflow
            // may be implemented.
            #[cfg(not(test))]
            {
                log::error!("{} ID overflow! Aborting!", std::any::type_name::<T>());
                log::logger().flush();
                std::process::abort();
            }
            #[cfg(test)]
            {
                panic!("{} ID overflow! Aborting!", std::any::type_name::<T>())
            }
        }

        // Must use `usize` indices for ExactSizeIterator, as absolute values of
        // the IDs would overflow a 32-bit system's usize.
        (0..count).map(move |idx| {
            let id = idx as u64 + start_id;
            StableID {
                // Non-zero-ness checked by the overflow catching logic.
                id: std::num::NonZeroU64::new(id).unwrap(),
                _phantom: std::marker::PhantomData,
            }
        })
    }
}
impl<T: std::any::Any> Default for StableID<T> {
    fn default() -> Self {
        Self::many(1).next().unwrap()
    }
}
impl<T: std::any::Any> std::fmt::Display for StableID<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Unwrap here is safe - rsplit always returns at least one element, even
        // for empty strings.
        write!(
            f,
            "{}#{}",
            std::any::type_name::<T>().rsplit("::").next().unwrap(),
            self.id
        )
    }
}

impl<T: std::any::Any> std::fmt::Debug for StableID<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <StableID<T> as std::fmt::Display>::fmt(self, f)
    }
}

/// Namespace for every versionable piece of the scene - objects, volumes and
/// instances draw from one shared pool, matching how selections pair them up.
pub struct SceneElement;
pub type ElementID = StableID<SceneElement>;

/// Liveness bookkeeping for element identities.
///
/// An identity is alive while the live scene still contains it, or while any
/// snapshot still pins one of its fragments. There is no removal API: an
/// identity retires by falling out of both sets, and its numeric value is never
/// reissued regardless.
#[derive(Default)]
pub struct Registry {
    /// Identities seen by the most recent capture traversal.
    live: hashbrown::HashSet<ElementID>,
    /// Identity -> number of snapshots referencing it.
    pins: hashbrown::HashMap<ElementID, usize>,
}
impl Registry {
    /// Replace the live set with the identities observed by a capture traversal.
    /// The registry never learns about the scene except through these traversals.
    pub fn observe_live(&mut self, live: impl IntoIterator<Item = ElementID>) {
        self.live.clear();
        self.live.extend(live);
    }
    /// Record one more snapshot referencing `id`.
    pub fn pin(&mut self, id: ElementID) {
        *self.pins.entry(id).or_insert(0) += 1;
    }
    /// Drop one snapshot reference to `id`.
    ///
    /// Unpinning an identity with no recorded references is a bookkeeping bug in
    /// the timeline and is fatal.
    pub fn unpin(&mut self, id: ElementID) {
        match self.pins.entry(id) {
            hashbrown::hash_map::Entry::Occupied(mut entry) => {
                *entry.get_mut() -= 1;
                if *entry.get() == 0 {
                    entry.remove();
                }
            }
            hashbrown::hash_map::Entry::Vacant(_) => {
                log::error!("{id} unpinned with no snapshot references");
                panic!("{id} unpinned with no snapshot references");
            }
        }
    }
    /// Whether the identity is still reachable - from the live scene or from any
    /// surviving snapshot.
    #[must_use]
    pub fn is_alive(&self, id: ElementID) -> bool {
        self.live.contains(&id) || self.pins.contains_key(&id)
    }
    /// Whether the most recent capture traversal saw this identity.
    #[must_use]
    pub fn is_live(&self, id: ElementID) -> bool {
        self.live.contains(&id)
    }
    /// Whether any snapshot still references this identity.
    #[must_use]
    pub fn is_pinned(&self, id: ElementID) -> bool {
        self.pins.contains_key(&id)
    }
}
