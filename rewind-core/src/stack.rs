//! # Snapshot stack
//!
//! The timeline itself: an ordered list of named captures of the whole
//! editable state, the pointer to where the editor currently is, and the
//! undo/redo moves between those points. The stack is the ground truth for
//! time travel - it decides what gets (re)serialized on each capture, which
//! abandoned futures get discarded, and when the live state must be stashed so
//! a redo can return to it.
//!
//! The host is expected to call [`Stack::take_snapshot`] once per completed
//! operation, named after it. Each snapshot's timestamp thus marks the start
//! of the interval in which the *next* operation runs, and the state after
//! operation N lives in the snapshot taken at N's end.

use crate::{
    fragment::{FragmentRef, FragmentStore},
    id::Registry,
    reconstruct,
    scene::{CaptureSource, PatchTarget, SelectionCapture, SelectionSource, ToolCapture, ToolState},
    ElementID,
};

/// Timeline position. Strictly increasing along the stack, assigned once,
/// never reissued - pruned timestamps leave permanent gaps.
pub type Timestamp = u64;

/// Name of the permanent seed snapshot every stack begins with.
pub const INITIAL_SNAPSHOT_NAME: &str = "New Project";

/// One named capture point on the timeline.
pub struct Snapshot {
    name: String,
    timestamp: Timestamp,
    fragments: hashbrown::HashMap<ElementID, FragmentRef>,
    selection: SelectionCapture,
    tool: ToolCapture,
}
impl Snapshot {
    /// The operation this capture concluded, for the history UI.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
    pub(crate) fn fragment_refs(&self) -> impl Iterator<Item = (ElementID, FragmentRef)> + '_ {
        self.fragments.iter().map(|(&element, &fragment)| (element, fragment))
    }
    pub(crate) fn fragment_len(&self) -> usize {
        self.fragments.len()
    }
    pub(crate) fn selection(&self) -> &SelectionCapture {
        &self.selection
    }
    pub(crate) fn tool(&self) -> ToolCapture {
        self.tool
    }
}
// Snapshots are compared by time alone - the timestamp totally orders the
// timeline, contents never participate.
impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
    }
}
impl Eq for Snapshot {}
impl PartialOrd for Snapshot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Snapshot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp.cmp(&other.timestamp)
    }
}

/// Whether the live state sitting at the topmost snapshot has been serialized
/// for redo yet. Transitions to `Captured` exactly once, on the first undo
/// away from the topmost position; every new capture resets it.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Topmost {
    LiveUncaptured,
    Captured,
}

pub struct Stack {
    /// Sorted by timestamp. Never empty.
    snapshots: Vec<Snapshot>,
    /// Timestamp of the snapshot the editor currently sits at. Always matches
    /// exactly one entry of `snapshots`.
    active_time: Timestamp,
    /// Next timestamp to hand out.
    next_time: Timestamp,
    topmost: Topmost,
    store: FragmentStore,
    registry: Registry,
    /// Selection pairs of the most recently reconstructed snapshot, awaiting
    /// re-resolution by the host.
    restored_selection: SelectionCapture,
}

impl Stack {
    /// An empty stack is not valid: every timeline starts with a permanent
    /// "New Project" snapshot of the state handed in here, at timestamp 0.
    #[must_use]
    pub fn new(
        scene: &impl CaptureSource,
        selection: &impl SelectionSource,
        tool: &impl ToolState,
    ) -> Self {
        let mut stack = Self {
            snapshots: Vec::new(),
            active_time: 0,
            next_time: 0,
            topmost: Topmost::LiveUncaptured,
            store: FragmentStore::new(),
            registry: Registry::default(),
            restored_selection: SelectionCapture::default(),
        };
        stack.push_capture(INITIAL_SNAPSHOT_NAME, scene, selection, tool);
        stack
    }

    /// Capture the full current state as a new snapshot named after the
    /// operation that just completed, discarding any abandoned future beyond
    /// the active pointer first. The sole way the timeline grows.
    pub fn take_snapshot(
        &mut self,
        name: &str,
        scene: &impl CaptureSource,
        selection: &impl SelectionSource,
        tool: &impl ToolState,
    ) {
        self.prune_future();
        self.push_capture(name, scene, selection, tool);
        log::debug!(
            "snapshot {name:?} taken at t{}; store holds {} fragments ({})",
            self.active_time,
            self.store.fragment_count(),
            human_bytes::human_bytes(self.store.memory_usage() as f64),
        );
    }

    /// True iff a snapshot exists before the active pointer.
    #[must_use]
    pub fn has_undo_snapshot(&self) -> bool {
        self.active_index() > 0
    }
    /// True iff a snapshot exists after the active pointer.
    #[must_use]
    pub fn has_redo_snapshot(&self) -> bool {
        self.active_index() + 1 < self.snapshots.len()
    }

    /// Roll back the time. With `time_to_load`, the target must be an existing
    /// snapshot earlier than the active one; without, the immediately
    /// preceding snapshot is activated. The first undo away from the topmost
    /// position serializes the live state into it first, so that a later redo
    /// lands back on exactly the state the user left.
    ///
    /// Returns whether a move occurred. Undoing past the beginning of history
    /// (or to an unknown timestamp) is a no-op, not an error.
    pub fn undo<Scene>(
        &mut self,
        scene: &mut Scene,
        selection: &impl SelectionSource,
        tool: &mut impl ToolState,
        time_to_load: Option<Timestamp>,
    ) -> bool
    where
        Scene: CaptureSource + PatchTarget,
    {
        let active = self.active_index();
        let target = match time_to_load {
            None => {
                if active == 0 {
                    return false;
                }
                self.snapshots[active - 1].timestamp
            }
            Some(time) => {
                // An unknown or non-earlier timestamp is a lookup failure.
                if time >= self.active_time || self.index_of(time).is_none() {
                    return false;
                }
                time
            }
        };
        if self.topmost == Topmost::LiveUncaptured && active + 1 == self.snapshots.len() {
            self.recapture_topmost(scene, selection, tool);
            self.topmost = Topmost::Captured;
        }
        self.load(target, scene, tool);
        true
    }

    /// Jump forward in time. With `time_to_load`, the target must be an
    /// existing snapshot later than the active one; without, the next snapshot
    /// is activated.
    ///
    /// Returns whether a move occurred.
    pub fn redo(
        &mut self,
        scene: &mut impl PatchTarget,
        tool: &mut impl ToolState,
        time_to_load: Option<Timestamp>,
    ) -> bool {
        let active = self.active_index();
        let target = match time_to_load {
            None => {
                let Some(next) = self.snapshots.get(active + 1) else {
                    return false;
                };
                next.timestamp
            }
            Some(time) => {
                if time <= self.active_time || self.index_of(time).is_none() {
                    return false;
                }
                time
            }
        };
        self.load(target, scene, tool);
        true
    }

    /// Timestamp-ordered history of captures, for the host's history UI.
    #[must_use]
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }
    /// Timestamp of the active snapshot. Exactly one entry of
    /// [`Self::snapshots`] carries this timestamp.
    #[must_use]
    pub fn active_snapshot_time(&self) -> Timestamp {
        self.active_time
    }
    /// Raw selection pairs captured in the most recently reconstructed
    /// snapshot. The host resolves these into live references itself once the
    /// scene is rebuilt - the pairs may name objects that were just recreated.
    #[must_use]
    pub fn selection_deserialized(&self) -> &SelectionCapture {
        &self.restored_selection
    }
    /// Whether the topmost snapshot already holds the exact live state a redo
    /// would need to return to.
    #[must_use]
    pub fn is_topmost_captured(&self) -> bool {
        self.topmost == Topmost::Captured
    }
    /// Read-only view of the fragment store, for diagnostics.
    #[must_use]
    pub fn store(&self) -> &FragmentStore {
        &self.store
    }
    /// Read-only view of the identity registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Serialize the live state and append it as a fresh snapshot, making it
    /// both topmost and active.
    fn push_capture(
        &mut self,
        name: &str,
        scene: &impl CaptureSource,
        selection: &impl SelectionSource,
        tool: &impl ToolState,
    ) {
        let (fragments, selection, tool) = self.capture(scene, selection, tool);
        let timestamp = self.next_time;
        self.next_time += 1;
        self.snapshots.push(Snapshot {
            name: name.to_owned(),
            timestamp,
            fragments,
            selection,
            tool,
        });
        self.active_time = timestamp;
        self.topmost = Topmost::LiveUncaptured;
    }

    /// Walk the scene and stash every element's content, deduplicated against
    /// what the store already holds. Pins each captured identity once on
    /// behalf of the snapshot that will own the set.
    fn capture(
        &mut self,
        scene: &impl CaptureSource,
        selection: &impl SelectionSource,
        tool: &impl ToolState,
    ) -> (
        hashbrown::HashMap<ElementID, FragmentRef>,
        SelectionCapture,
        ToolCapture,
    ) {
        let mut fragments = hashbrown::HashMap::new();
        let store = &mut self.store;
        scene.visit_elements(&mut |element, bytes| {
            let fragment = store.put(element, bytes);
            if fragments.insert(element, fragment).is_some() {
                // Two traversal entries claiming one identity would silently
                // leak a refcount.
                log::error!("{element} visited twice during capture");
                panic!("{element} visited twice during capture");
            }
        });
        self.registry.observe_live(fragments.keys().copied());
        for &element in fragments.keys() {
            self.registry.pin(element);
        }
        log::trace!("captured {} elements", fragments.len());
        (fragments, selection.capture(), tool.capture())
    }

    /// Discard every snapshot strictly after the active pointer, releasing the
    /// fragments they owned. The initial snapshot can never be after the
    /// active pointer, so it survives unconditionally.
    fn prune_future(&mut self) {
        let keep = self
            .snapshots
            .partition_point(|snapshot| snapshot.timestamp <= self.active_time);
        if keep == self.snapshots.len() {
            return;
        }
        log::debug!(
            "discarding {} snapshots after t{}",
            self.snapshots.len() - keep,
            self.active_time
        );
        for snapshot in self.snapshots.drain(keep..) {
            for (element, fragment) in snapshot.fragments {
                self.store.release(fragment);
                self.registry.unpin(element);
            }
        }
    }

    /// Re-serialize the live state into the topmost snapshot, in place, same
    /// timestamp. Called once per topmost position, on the first undo away
    /// from it; when nothing changed since the snapshot was taken this
    /// deduplicates to the identical fragment set.
    fn recapture_topmost(
        &mut self,
        scene: &impl CaptureSource,
        selection: &impl SelectionSource,
        tool: &impl ToolState,
    ) {
        // Capture before releasing the stale set, so fragments shared between
        // the two never transit through a refcount of zero.
        let (fragments, selection, tool) = self.capture(scene, selection, tool);
        // Unwrap OK - the stack is never empty.
        let topmost = self.snapshots.last_mut().unwrap();
        log::debug!(
            "capturing live state into topmost snapshot {:?} at t{}",
            topmost.name,
            topmost.timestamp
        );
        let stale = std::mem::replace(&mut topmost.fragments, fragments);
        topmost.selection = selection;
        topmost.tool = tool;
        for (element, fragment) in stale {
            self.store.release(fragment);
            self.registry.unpin(element);
        }
    }

    /// Reconstruct the snapshot at `target` into the collaborators and move
    /// the active pointer onto it. `target` must exist - callers resolve it
    /// beforehand.
    fn load(&mut self, target: Timestamp, scene: &mut impl PatchTarget, tool: &mut impl ToolState) {
        let index = self
            .index_of(target)
            .unwrap_or_else(|| panic!("loading t{target} which is not on the timeline"));
        let snapshot = &self.snapshots[index];
        log::debug!("loading snapshot {:?} at t{target}", snapshot.name);
        let rebuilt = reconstruct::reconstruct(snapshot, &self.store, &self.registry);
        if let Err(error) = scene.apply(rebuilt.patch()) {
            // Half of the scene may already be overwritten - there is no state
            // left that could be recovered to.
            log::error!("snapshot at t{target} failed to apply: {error}");
            panic!("snapshot at t{target} failed to apply: {error}");
        }
        tool.restore(rebuilt.tool());
        let selection = rebuilt.selection().clone();
        self.restored_selection = selection;
        self.active_time = target;
    }

    fn active_index(&self) -> usize {
        self.index_of(self.active_time).unwrap_or_else(|| {
            log::error!("active pointer t{} matches no snapshot", self.active_time);
            panic!("active pointer t{} matches no snapshot", self.active_time)
        })
    }
    fn index_of(&self, time: Timestamp) -> Option<usize> {
        self.snapshots
            .binary_search_by_key(&time, Snapshot::timestamp)
            .ok()
    }
}

#[cfg(test)]
mod test {
    use super::{Stack, INITIAL_SNAPSHOT_NAME};
    use crate::{
        scene::{
            CaptureSource, PatchError, PatchTarget, ScenePatch, SelectMode, SelectionCapture,
            SelectionSource, ToolCapture, ToolState,
        },
        ElementID,
    };

    /// Toy scene graph: a flat set of elements, each a blob of content,
    /// traversed in identity order.
    #[derive(Clone, Default, PartialEq, Eq, Debug)]
    struct Scene {
        elements: Vec<(ElementID, Vec<u8>)>,
    }
    impl Scene {
        fn insert(&mut self, content: &[u8]) -> ElementID {
            let element = ElementID::default();
            self.elements.push((element, content.to_vec()));
            self.elements.sort_unstable_by_key(|(element, _)| element.id());
            element
        }
        fn set(&mut self, element: ElementID, content: &[u8]) {
            let slot = self
                .elements
                .iter_mut()
                .find(|(candidate, _)| *candidate == element)
                .expect("no such element");
            slot.1 = content.to_vec();
        }
        fn remove(&mut self, element: ElementID) {
            self.elements.retain(|(candidate, _)| *candidate != element);
        }
    }
    impl CaptureSource for Scene {
        fn visit_elements(&self, visit: &mut dyn FnMut(ElementID, &[u8])) {
            for (element, content) in &self.elements {
                visit(*element, content);
            }
        }
    }
    impl PatchTarget for Scene {
        fn apply(&mut self, patch: &ScenePatch<'_>) -> Result<(), PatchError> {
            self.elements = patch
                .iter()
                .map(|(element, content)| (element, content.to_vec()))
                .collect();
            Ok(())
        }
    }

    #[derive(Default)]
    struct Selection(SelectionCapture);
    impl SelectionSource for Selection {
        fn capture(&self) -> SelectionCapture {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct Tool(ToolCapture);
    impl ToolState for Tool {
        fn capture(&self) -> ToolCapture {
            self.0
        }
        fn restore(&mut self, capture: ToolCapture) {
            self.0 = capture;
        }
    }

    fn fixture() -> (Stack, Scene, Selection, Tool) {
        let mut scene = Scene::default();
        scene.insert(b"cube");
        scene.insert(b"sphere");
        let selection = Selection::default();
        let tool = Tool::default();
        let stack = Stack::new(&scene, &selection, &tool);
        (stack, scene, selection, tool)
    }

    #[test]
    fn timestamps_strictly_increase() {
        let (mut stack, mut scene, selection, tool) = fixture();
        for turn in 0u8..4 {
            scene.insert(&[turn]);
            stack.take_snapshot("Add object", &scene, &selection, &tool);
        }
        let times: Vec<_> = stack.snapshots().iter().map(super::Snapshot::timestamp).collect();
        let mut sorted = times.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(times, sorted, "timeline must be strictly increasing");
        assert_eq!(stack.active_snapshot_time(), *times.last().unwrap());
    }

    #[test]
    fn never_empty() {
        let (mut stack, mut scene, selection, mut tool) = fixture();
        stack.take_snapshot("Edit", &scene, &selection, &tool);
        while stack.undo(&mut scene, &selection, &mut tool, None) {}
        assert_eq!(stack.snapshots().len(), 2);
        let first = &stack.snapshots()[0];
        assert_eq!(first.name(), INITIAL_SNAPSHOT_NAME);
        assert_eq!(first.timestamp(), 0);
        assert_eq!(stack.active_snapshot_time(), 0);
    }

    #[test]
    fn truncation_discards_the_abandoned_future() {
        let (mut stack, mut scene, selection, mut tool) = fixture();
        let element = scene.elements[0].0;
        for turn in 0u8..3 {
            scene.set(element, &[turn]);
            stack.take_snapshot("Edit", &scene, &selection, &tool);
        }
        // Timeline is [0, 1, 2, 3]; walk back to t1.
        assert!(stack.undo(&mut scene, &selection, &mut tool, None));
        assert!(stack.undo(&mut scene, &selection, &mut tool, None));
        assert_eq!(stack.active_snapshot_time(), 1);

        scene.set(element, b"rewritten");
        stack.take_snapshot("Rewrite", &scene, &selection, &tool);

        let times: Vec<_> = stack.snapshots().iter().map(super::Snapshot::timestamp).collect();
        assert_eq!(times, [0, 1, 4], "t2 and t3 discarded, fresh time appended");
        assert_eq!(stack.active_snapshot_time(), 4);
        assert!(!stack.has_redo_snapshot());
    }

    #[test]
    fn undo_redo_round_trips_by_content() {
        let (mut stack, mut scene, selection, mut tool) = fixture();
        let before = scene.clone();
        let element = scene.elements[0].0;

        scene.set(element, b"stretched cube");
        let after = scene.clone();
        stack.take_snapshot("Stretch", &scene, &selection, &tool);

        assert!(stack.undo(&mut scene, &selection, &mut tool, None));
        assert_eq!(scene, before);
        assert!(stack.redo(&mut scene, &mut tool, None));
        assert_eq!(scene, after);
    }

    #[test]
    fn unchanged_capture_stores_nothing_new() {
        let (mut stack, scene, selection, tool) = fixture();
        let resident = stack.store().fragment_count();
        stack.take_snapshot("Nothing happened", &scene, &selection, &tool);
        stack.take_snapshot("Still nothing", &scene, &selection, &tool);
        assert_eq!(stack.store().fragment_count(), resident);
        assert_eq!(stack.snapshots().len(), 3);
    }

    #[test]
    fn lazy_topmost_capture_preserves_the_live_state() {
        let (mut stack, mut scene, selection, mut tool) = fixture();
        let element = scene.elements[0].0;
        scene.set(element, b"first edit");
        stack.take_snapshot("First edit", &scene, &selection, &tool);

        // Keep editing without a capture - the timeline end is now stale.
        scene.set(element, b"second edit, uncommitted");
        let live = scene.clone();
        assert!(!stack.is_topmost_captured());

        // Undo stashes the live state into the topmost entry, same timestamp.
        assert!(stack.undo(&mut scene, &selection, &mut tool, None));
        assert!(stack.is_topmost_captured());
        assert_eq!(stack.snapshots().len(), 2);
        assert_eq!(stack.active_snapshot_time(), 0);

        // Redo returns to exactly what the user left, not to the stale capture.
        assert!(stack.redo(&mut scene, &mut tool, None));
        assert_eq!(scene, live);

        // The transition happens only once: a second undo/redo trip does not
        // re-serialize the (now historical) topmost state.
        assert!(stack.undo(&mut scene, &selection, &mut tool, None));
        assert!(stack.redo(&mut scene, &mut tool, None));
        assert_eq!(scene, live);
    }

    #[test]
    fn pruning_releases_exclusive_fragments_only() {
        let (mut stack, mut scene, selection, mut tool) = fixture();
        let element = scene.elements[0].0;
        let shared = scene.elements[1].0;

        scene.set(element, b"v2");
        stack.take_snapshot("Edit", &scene, &selection, &tool);
        scene.set(element, b"v3");
        stack.take_snapshot("Edit again", &scene, &selection, &tool);
        assert_eq!(stack.store().versions_of(element), 3);

        stack.undo(&mut scene, &selection, &mut tool, None);
        stack.undo(&mut scene, &selection, &mut tool, None);
        assert_eq!(stack.active_snapshot_time(), 0);

        // Taking a new snapshot discards both abandoned edits. Their exclusive
        // fragments go away; the fragment shared with the initial snapshot
        // stays resident.
        stack.take_snapshot("New timeline", &scene, &selection, &tool);
        assert_eq!(stack.store().versions_of(element), 1);
        assert_eq!(stack.store().versions_of(shared), 1);
        assert!(stack.registry().is_pinned(element));
    }

    #[test]
    fn boundary_queries() {
        let (mut stack, mut scene, selection, mut tool) = fixture();
        assert!(!stack.has_undo_snapshot());
        assert!(!stack.has_redo_snapshot());
        assert!(!stack.undo(&mut scene, &selection, &mut tool, None));
        assert!(!stack.redo(&mut scene, &mut tool, None));

        scene.insert(b"cone");
        stack.take_snapshot("Add cone", &scene, &selection, &tool);
        assert!(stack.has_undo_snapshot());
        assert!(!stack.has_redo_snapshot());

        assert!(stack.undo(&mut scene, &selection, &mut tool, None));
        assert!(!stack.has_undo_snapshot(), "t0 is the beginning of history");
        assert!(stack.has_redo_snapshot());
    }

    #[test]
    fn explicit_time_travel() {
        let (mut stack, mut scene, selection, mut tool) = fixture();
        let element = scene.elements[0].0;
        let mut states = vec![scene.clone()];
        for turn in 0u8..3 {
            scene.set(element, &[turn]);
            states.push(scene.clone());
            stack.take_snapshot("Edit", &scene, &selection, &tool);
        }

        // Jump straight to t1, skipping t2.
        assert!(stack.undo(&mut scene, &selection, &mut tool, Some(1)));
        assert_eq!(stack.active_snapshot_time(), 1);
        assert_eq!(scene, states[1]);

        // Unknown or wrong-direction targets are lookup failures, not moves.
        assert!(!stack.undo(&mut scene, &selection, &mut tool, Some(7)));
        assert!(!stack.undo(&mut scene, &selection, &mut tool, Some(1)));
        assert!(!stack.redo(&mut scene, &mut tool, Some(0)));
        assert_eq!(stack.active_snapshot_time(), 1);

        // And straight forward again to the end.
        assert!(stack.redo(&mut scene, &mut tool, Some(3)));
        assert_eq!(scene, states[3]);
    }

    #[test]
    fn selection_and_tool_survive_time_travel() {
        let mut scene = Scene::default();
        let volume = scene.insert(b"volume");
        let instance = scene.insert(b"instance");
        let mut selection = Selection::default();
        let mut tool = Tool(ToolCapture(7));
        let mut stack = Stack::new(&scene, &selection, &tool);

        selection.0 = SelectionCapture {
            mode: SelectMode::VOLUME,
            volumes_and_instances: [(volume, instance)].into_iter().collect(),
        };
        tool.0 = ToolCapture(42);
        scene.set(volume, b"moved volume");
        stack.take_snapshot("Move", &scene, &selection, &tool);

        assert!(stack.undo(&mut scene, &selection, &mut tool, None));
        assert_eq!(tool.0, ToolCapture(7));
        assert!(stack.selection_deserialized().volumes_and_instances.is_empty());

        assert!(stack.redo(&mut scene, &mut tool, None));
        assert_eq!(tool.0, ToolCapture(42));
        let restored = stack.selection_deserialized();
        assert_eq!(restored.mode, SelectMode::VOLUME);
        assert_eq!(restored.volumes_and_instances[..], [(volume, instance)]);
    }

    #[test]
    fn deleted_elements_return_on_undo() {
        let (mut stack, mut scene, selection, mut tool) = fixture();
        let element = scene.elements[0].0;
        let before = scene.clone();

        scene.remove(element);
        stack.take_snapshot("Delete object", &scene, &selection, &tool);
        assert!(!stack.registry().is_live(element));
        assert!(stack.registry().is_alive(element), "history still owns it");

        assert!(stack.undo(&mut scene, &selection, &mut tool, None));
        assert_eq!(scene, before);
    }
}
