//! Long-lived `git cat-file --batch` session
//!
//! One process answers any number of object requests, so walking every
//! notes tree and reading every note blob costs a single spawn.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout};

use crate::error::{MemoryError, Result};
use crate::git::{GitExecutor, NoteAddr};

const TREE_MODE: &[u8] = b"40000";

/// One object returned by the session
#[derive(Debug)]
pub struct BatchObject {
    pub oid: String,
    pub kind: String,
    pub data: Vec<u8>,
}

/// Entry of a tree object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: String,
    pub name: String,
    pub oid: String,
}

impl TreeEntry {
    pub fn is_tree(&self) -> bool {
        self.mode.as_bytes() == TREE_MODE
    }
}

pub struct CatFileSession {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl CatFileSession {
    pub fn start(executor: &GitExecutor) -> Result<Self> {
        let mut child = executor.spawn_piped(&["cat-file", "--batch"])?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MemoryError::git("cat-file: stdout not captured"))?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Request one object; `None` when git reports it missing
    pub fn request(&mut self, spec: &str) -> Result<Option<BatchObject>> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| MemoryError::git("cat-file: session closed"))?;
        writeln!(stdin, "{spec}")?;
        stdin.flush()?;

        let mut header = String::new();
        if self.stdout.read_line(&mut header)? == 0 {
            return Err(MemoryError::git("cat-file: unexpected end of output"));
        }
        let header = header.trim_end();
        if header.ends_with(" missing") || header.ends_with(" ambiguous") {
            return Ok(None);
        }

        let mut parts = header.split(' ');
        let (Some(oid), Some(kind), Some(size)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(MemoryError::git(format!("cat-file: bad header {header:?}")));
        };
        let size: usize = size
            .parse()
            .map_err(|_| MemoryError::git(format!("cat-file: bad size in {header:?}")))?;

        // Object bytes followed by a single LF
        let mut data = vec![0u8; size + 1];
        self.stdout.read_exact(&mut data)?;
        data.truncate(size);

        Ok(Some(BatchObject {
            oid: oid.to_string(),
            kind: kind.to_string(),
            data,
        }))
    }

    /// Read a tree; `None` when it does not exist
    pub fn read_tree(&mut self, spec: &str) -> Result<Option<(String, Vec<TreeEntry>)>> {
        let Some(object) = self.request(spec)? else {
            return Ok(None);
        };
        if object.kind != "tree" {
            return Err(MemoryError::git(format!(
                "cat-file: {spec} is a {}, expected tree",
                object.kind
            )));
        }
        let entries = parse_tree(&object.data, object.oid.len() / 2)?;
        Ok(Some((object.oid, entries)))
    }

    pub fn read_blob(&mut self, oid: &str) -> Result<String> {
        let object = self
            .request(oid)?
            .ok_or_else(|| MemoryError::git(format!("cat-file: blob {oid} missing")))?;
        Ok(String::from_utf8(object.data)?)
    }

    /// Every note under a notes ref, ordered by object id. Fanout
    /// subdirectories are followed and their path components concatenated.
    pub fn list_notes(&mut self, ref_path: &str) -> Result<Vec<NoteAddr>> {
        let Some((root, entries)) = self.read_tree(&format!("{ref_path}^{{tree}}"))? else {
            return Ok(Vec::new());
        };
        let hex_len = root.len();

        let mut notes = Vec::new();
        let mut pending = vec![(String::new(), entries)];
        while let Some((prefix, entries)) = pending.pop() {
            for entry in entries {
                let path = format!("{prefix}{}", entry.name);
                if !entry.name.bytes().all(|b| b.is_ascii_hexdigit()) {
                    log::debug!("Skipping non-note path {} in {}", path, ref_path);
                    continue;
                }
                if entry.is_tree() {
                    if path.len() < hex_len {
                        if let Some((_, children)) = self.read_tree(&entry.oid)? {
                            pending.push((path, children));
                        }
                    }
                } else if path.len() == hex_len {
                    notes.push(NoteAddr {
                        object: path.to_ascii_lowercase(),
                        blob: entry.oid,
                    });
                }
            }
        }
        notes.sort();
        Ok(notes)
    }
}

impl Drop for CatFileSession {
    fn drop(&mut self) {
        // Closing stdin ends the batch loop
        drop(self.stdin.take());
        let _ = self.child.wait();
    }
}

/// Parse raw tree bytes: repeated `<mode> SP <name> NUL <raw oid>`
pub fn parse_tree(data: &[u8], hash_len: usize) -> Result<Vec<TreeEntry>> {
    let bad = || MemoryError::git("cat-file: malformed tree object");
    let mut entries = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        let space = rest.iter().position(|&b| b == b' ').ok_or_else(bad)?;
        let mode = std::str::from_utf8(&rest[..space]).map_err(|_| bad())?;
        rest = &rest[space + 1..];

        let nul = rest.iter().position(|&b| b == 0).ok_or_else(bad)?;
        let name = String::from_utf8_lossy(&rest[..nul]).into_owned();
        rest = &rest[nul + 1..];

        if rest.len() < hash_len {
            return Err(bad());
        }
        let oid = rest[..hash_len]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>();
        rest = &rest[hash_len..];

        entries.push(TreeEntry {
            mode: mode.to_string(),
            name,
            oid,
        });
    }
    Ok(entries)
}
