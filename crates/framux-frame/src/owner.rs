use std::fmt;
use std::sync::Weak;

use tracing::debug;

/// Identifier a [`FrameOwner`] hands out to each frame it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(u64);

impl FrameId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

/// The component that serialises frame activation over one transport.
///
/// Frame channels only ever ask whether they are active and report that
/// they are done; they never manage the owner's lifetime.
pub trait FrameOwner: Send + Sync {
    /// Whether `id` currently holds the transport.
    fn is_active(&self, id: FrameId) -> bool;

    /// `id` has finished; hand the transport to the next frame.
    fn complete(&self, id: FrameId);
}

/// A frame's non-owning link back to its owner.
#[derive(Clone)]
pub struct OwnerHandle {
    owner: Weak<dyn FrameOwner>,
    id: FrameId,
}

impl OwnerHandle {
    pub fn new(owner: Weak<dyn FrameOwner>, id: FrameId) -> Self {
        Self { owner, id }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    /// A frame whose owner is gone is never active.
    pub(crate) fn is_active(&self) -> bool {
        self.owner
            .upgrade()
            .is_some_and(|owner| owner.is_active(self.id))
    }

    pub(crate) fn complete(&self) {
        match self.owner.upgrade() {
            Some(owner) => owner.complete(self.id),
            None => debug!(frame = %self.id, "owner dropped before frame completed"),
        }
    }
}

impl fmt::Debug for OwnerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerHandle")
            .field("id", &self.id)
            .field("owner_alive", &(self.owner.strong_count() > 0))
            .finish()
    }
}
