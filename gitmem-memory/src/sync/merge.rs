//! Entry-level union of two versions of a note
//!
//! Blocks from both sides are sorted by `(timestamp header, block text)`,
//! both compared lexically, and exact duplicates dropped. The order is part
//! of the wire format: every replica must produce the same bytes for the
//! same set of blocks, whichever side merges first.

use crate::note::{parse_block, split_blocks};

/// Union of the entries of two notes
pub fn merge_note_texts(local: &str, remote: &str) -> String {
    let mut blocks: Vec<(String, String)> = split_blocks(local)
        .into_iter()
        .chain(split_blocks(remote))
        .map(|block| (parse_block(&block).timestamp_str().to_string(), block))
        .collect();
    blocks.sort();
    blocks.dedup();

    if blocks.is_empty() {
        return String::new();
    }
    let mut out = blocks
        .into_iter()
        .map(|(_, block)| block)
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}
