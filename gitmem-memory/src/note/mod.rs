//! Git notes text format and ref layout

pub mod format;
pub mod refs;

pub use format::{
    entry_key, parse_block, parse_keyed, parse_note, serialize_entry, serialize_status_change,
    serialized_key, split_blocks, KeyedEntry, MalformedEntry, NoteEntry, NoteHeader,
    StatusChange, StoredEntry,
};
pub use refs::{NoteRef, RefKind, NOTES_ROOT};
