//! # Reconstruction
//!
//! Turns one snapshot's fragment set back into material the collaborators can
//! consume: serialized content per identity, plus the captured selection pairs
//! and tool mode. A resolution failure here is a reference counting or
//! identity bug inside the timeline, and aborts rather than handing the editor
//! a half-built state.

use crate::{
    fragment::FragmentStore,
    id::Registry,
    scene::{ScenePatch, SelectionCapture, ToolCapture},
    stack::Snapshot,
};

/// Everything needed to move the editor to one snapshot's state.
pub struct Reconstruction<'s> {
    patch: ScenePatch<'s>,
    selection: SelectionCapture,
    tool: ToolCapture,
}
impl<'s> Reconstruction<'s> {
    /// The scene contents of the target state, for [`crate::scene::PatchTarget::apply`].
    #[must_use]
    pub fn patch(&self) -> &ScenePatch<'s> {
        &self.patch
    }
    /// The raw selection pairs captured with the target state.
    #[must_use]
    pub fn selection(&self) -> &SelectionCapture {
        &self.selection
    }
    /// The tool mode captured with the target state.
    #[must_use]
    pub fn tool(&self) -> ToolCapture {
        self.tool
    }
}

/// Resolve every fragment of `snapshot` into its serialized content.
///
/// Every identity in the fragment set must still have a registered owner, and
/// every fragment must still be resident. Anything else means reference counts
/// were mishandled somewhere, and reconstruction refuses to continue.
#[must_use]
pub fn reconstruct<'s>(
    snapshot: &Snapshot,
    store: &'s FragmentStore,
    registry: &Registry,
) -> Reconstruction<'s> {
    let mut elements = Vec::with_capacity(snapshot.fragment_len());
    for (element, fragment) in snapshot.fragment_refs() {
        if !registry.is_alive(element) {
            log::error!(
                "{element} captured in snapshot {:?} has no registered owner",
                snapshot.name()
            );
            panic!("{element} has no registered owner");
        }
        elements.push((element, store.get(fragment)));
    }
    Reconstruction {
        patch: ScenePatch::new(elements),
        selection: snapshot.selection().clone(),
        tool: snapshot.tool(),
    }
}
