//! The declarative data model shared by the archive, the wire codec, and the
//! clearinghouse.

pub mod bitset;
pub mod file;
pub mod filter;
pub mod path;
pub mod predicate;
pub mod spec;
pub mod time;

pub use bitset::FiniteBitSet;
pub use file::{FileId, FileInfo, Piece, PIECE_SIZE};
pub use filter::Filter;
pub use path::ArchivePath;
pub use predicate::Predicate;
pub use spec::{FilePieceSpecs, PieceSpec, PieceSpecSet};
pub use time::ArchiveTime;
