//! `PieceSpec` / `FilePieceSpecs` / `PieceSpecSet`: a compact, serializable
//! description of "which pieces of which file", used both as
//! a Notice/Request payload on the wire and as the key space of the
//! `ClearingHouse` outstanding-request table.

use serde::{Deserialize, Serialize};

use super::bitset::FiniteBitSet;
use super::file::FileInfo;

/// A single piece of a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceSpec {
    pub info: FileInfo,
    pub index: u32,
}

impl PieceSpec {
    pub fn new(info: FileInfo, index: u32) -> Self {
        Self { info, index }
    }
}

/// A bitmap of pieces over one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePieceSpecs {
    pub info: FileInfo,
    pub pieces: FiniteBitSet,
}

impl FilePieceSpecs {
    pub fn all_pieces(info: FileInfo) -> Self {
        let count = info.piece_count();
        Self {
            info,
            pieces: FiniteBitSet::Complete(count),
        }
    }

    pub fn single(info: FileInfo, index: u32) -> Self {
        let count = info.piece_count();
        let pieces = FiniteBitSet::empty(count).set_bit(index);
        Self { info, pieces }
    }

    pub fn iter_specs(&self) -> impl Iterator<Item = PieceSpec> + '_ {
        let info = self.info.clone();
        self.pieces
            .iter_set()
            .map(move |idx| PieceSpec::new(info.clone(), idx))
    }
}

/// A heterogeneous set of `FilePieceSpecs`, one per distinct file version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceSpecSet {
    pub files: Vec<FilePieceSpecs>,
}

impl PieceSpecSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, specs: FilePieceSpecs) {
        self.files.push(specs);
    }

    pub fn from_single(spec: PieceSpec) -> Self {
        let mut set = Self::new();
        set.push(FilePieceSpecs::single(spec.info, spec.index));
        set
    }

    pub fn iter_specs(&self) -> impl Iterator<Item = PieceSpec> + '_ {
        self.files.iter().flat_map(|f| f.iter_specs())
    }

    pub fn is_empty(&self) -> bool {
        self.files.iter().all(|f| f.pieces.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::file::{FileId, PIECE_SIZE};
    use crate::model::path::ArchivePath;
    use crate::model::time::ArchiveTime;

    fn fi() -> FileInfo {
        FileInfo::new(
            FileId::new(ArchivePath::new("a/b.txt").unwrap(), ArchiveTime::from_millis(1)),
            PIECE_SIZE * 3,
            -1,
        )
    }

    #[test]
    fn all_pieces_is_complete() {
        let specs = FilePieceSpecs::all_pieces(fi());
        assert_eq!(specs.iter_specs().count(), 3);
        assert!(matches!(specs.pieces, FiniteBitSet::Complete(3)));
    }

    #[test]
    fn set_aggregates_multiple_files() {
        let mut set = PieceSpecSet::new();
        set.push(FilePieceSpecs::single(fi(), 0));
        set.push(FilePieceSpecs::single(fi(), 1));
        assert_eq!(set.iter_specs().count(), 2);
    }
}
