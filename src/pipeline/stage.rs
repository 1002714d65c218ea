use std::fmt;

use crate::adapter::SourceKind;
use crate::capability::SharedCapability;

/// Position of a stage in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageRole {
    Head,
    Middle,
    Tail,
    /// A one-stage chain: both head and tail.
    Sole,
}

impl StageRole {
    pub fn for_position(index: usize, len: usize) -> Self {
        match (index, len) {
            (_, 0 | 1) => Self::Sole,
            (0, _) => Self::Head,
            (i, n) if i + 1 == n => Self::Tail,
            _ => Self::Middle,
        }
    }

    pub fn is_head(self) -> bool {
        matches!(self, Self::Head | Self::Sole)
    }

    pub fn is_tail(self) -> bool {
        matches!(self, Self::Tail | Self::Sole)
    }
}

/// One adapted element of a chain.
pub struct Stage<T> {
    pub index: usize,
    pub role: StageRole,
    pub capability: SharedCapability<T>,
    pub readable_side: bool,
    pub writable_side: bool,
    pub kind: SourceKind,
}

impl<T: Send + 'static> Stage<T> {
    pub fn new(
        index: usize,
        role: StageRole,
        capability: SharedCapability<T>,
        kind: SourceKind,
    ) -> Self {
        let sides = capability.sides();
        Self {
            index,
            role,
            readable_side: sides.readable,
            writable_side: sides.writable,
            capability,
            kind,
        }
    }
}

impl<T> Clone for Stage<T> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            role: self.role,
            capability: self.capability.clone(),
            readable_side: self.readable_side,
            writable_side: self.writable_side,
            kind: self.kind,
        }
    }
}

impl<T> fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("index", &self.index)
            .field("role", &self.role)
            .field("readable_side", &self.readable_side)
            .field("writable_side", &self.writable_side)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
