//! # Scene collaborators
//!
//! The timeline never owns the editable state. It talks to the host editor
//! through the capability contracts in this module: a scene graph that can be
//! traversed for capture and patched for reconstruction, a selection that can
//! be captured as raw identity pairs, and a tool subsystem whose mode can be
//! stashed and restored wholesale. The timeline itself stays storage and
//! versioning logic only.

use crate::ElementID;

bitflags::bitflags! {
    /// Which granularity the selection operates on.
    #[derive(Copy, Clone, PartialEq, Eq, Hash, Default, Debug)]
    pub struct SelectMode: u8 {
        const VOLUME = 1;
        const INSTANCE = 1 << 1;
    }
}

/// Excerpt of the host's selection as serialized onto the timeline: the raw
/// (volume, instance) identity pairs, never live references. After a
/// reconstruction the host re-resolves the pairs itself, since the objects they
/// name may have just been recreated and did not exist as live objects when the
/// pairs were captured.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct SelectionCapture {
    pub mode: SelectMode,
    pub volumes_and_instances: smallvec::SmallVec<[(ElementID, ElementID); 4]>,
}

/// Tool state excerpt. Opaque to the timeline; the tool collaborator owns the
/// encoding of its mode and flags.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct ToolCapture(pub u32);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PatchError {
    /// A fragment could not be deserialized into a live element. A snapshot
    /// that no longer deserializes is corrupted state, and the timeline treats
    /// this as fatal rather than leaving the scene half-applied.
    #[error("content for {0} failed to deserialize")]
    Malformed(ElementID),
}

/// A scene graph which can be walked for capture.
pub trait CaptureSource {
    /// Visit every versionable element exactly once, in a stable order,
    /// yielding its identity and serialized content.
    ///
    /// Elements must carry their [`ElementID`] from creation - the traversal is
    /// how the timeline learns which identities are currently live.
    fn visit_elements(&self, visit: &mut dyn FnMut(ElementID, &[u8]));
}

/// A scene graph which can accept a reconstructed state wholesale.
pub trait PatchTarget {
    /// Replace the live contents with `patch`: update elements whose identity
    /// is already live in place (so external references to them, like GPU
    /// buffers, stay valid), create the identities that are missing, and
    /// destroy live identities absent from the patch.
    fn apply(&mut self, patch: &ScenePatch<'_>) -> Result<(), PatchError>;
}

/// A selection which can be captured as identity pairs.
///
/// There is deliberately no restore counterpart: the timeline only ever hands
/// the raw pairs back via [`crate::stack::Stack::selection_deserialized`].
pub trait SelectionSource {
    fn capture(&self) -> SelectionCapture;
}

/// A tool subsystem whose mode survives time travel.
pub trait ToolState {
    fn capture(&self) -> ToolCapture;
    fn restore(&mut self, capture: ToolCapture);
}

/// One reconstructed state, ready to be pushed into a [`PatchTarget`].
///
/// Holds (identity, content) for every element of the target state, sorted by
/// raw identity value. Content borrows from the fragment store and never embeds
/// live references, so rebuilding an aliased or cyclic scene is the host's
/// concern alone.
pub struct ScenePatch<'s> {
    elements: Vec<(ElementID, &'s [u8])>,
}
impl<'s> ScenePatch<'s> {
    pub(crate) fn new(mut elements: Vec<(ElementID, &'s [u8])>) -> Self {
        elements.sort_unstable_by_key(|(element, _)| element.id());
        Self { elements }
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
    /// Iterate the target state in identity order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (ElementID, &'s [u8])> + '_ {
        self.elements.iter().copied()
    }
    /// Content for one element of the target state, if present.
    #[must_use]
    pub fn get(&self, element: ElementID) -> Option<&'s [u8]> {
        self.elements
            .binary_search_by_key(&element.id(), |(element, _)| element.id())
            .ok()
            .map(|index| self.elements[index].1)
    }
}
