//! Time travel for an interactive scene editor: named snapshots of the whole
//! editable state, capture cost proportional to what actually changed, and
//! undo/redo across a strictly linear timeline. The scene graph, selection and
//! tools stay outside - see [`scene`] for the contracts they plug in through.

pub mod fragment;
pub mod id;
pub mod reconstruct;
pub mod scene;
pub mod stack;

use id::ElementID;
