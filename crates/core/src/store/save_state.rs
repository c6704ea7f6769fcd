use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::StoreError;
use crate::conversation::{Role, Turn};

/// The line closing every block of a save file.
pub const SENTINEL: &str = "===APaI===";

/// One turn as stored in a save file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaveBlock {
    /// Author of the turn, never [`Role::System`].
    pub role: Role,
    /// Content with trailing whitespace removed.
    pub content: String,
}

/// The parsed contents of a save file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaveFile {
    /// Model the conversation was held with.
    pub model_id: String,
    /// Key of the instruction in use.
    pub instr_key: String,
    /// Turns, oldest first.
    pub blocks: Vec<SaveBlock>,
}

/// Where and why a save file failed to parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParseError {
    /// 1-based line number.
    pub line: usize,
    /// What was wrong.
    pub reason: &'static str,
}

impl SaveFile {
    /// Parses a save file.
    ///
    /// The format is strict: a `<model_id>, <instr_key>` header, a sentinel,
    /// then blocks of a role line, content lines and a closing sentinel.
    /// Roles must alternate starting with `user`; a final `user` block
    /// without a reply is accepted. Blank lines after the last block are
    /// ignored.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let fail = |line, reason| ParseError { line, reason };
        let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l));

        let Some((_, header)) = lines.next() else {
            return Err(fail(1, "missing header"));
        };
        let Some((model_id, instr_key)) = header.split_once(", ") else {
            return Err(fail(1, "header must be `<model_id>, <instr_key>`"));
        };
        let (model_id, instr_key) = (model_id.trim(), instr_key.trim());
        if model_id.is_empty() || instr_key.is_empty() {
            return Err(fail(1, "header has an empty field"));
        }
        match lines.next() {
            Some((_, line)) if line.trim() == SENTINEL => {}
            Some((n, _)) => return Err(fail(n, "expected sentinel after header")),
            None => return Err(fail(2, "missing sentinel after header")),
        }

        let mut blocks: Vec<SaveBlock> = Vec::new();
        while let Some((n, role_line)) = lines.next() {
            let role_line = role_line.trim();
            if role_line.is_empty() {
                if let Some((n, _)) =
                    lines.find(|(_, line)| !line.trim().is_empty())
                {
                    return Err(fail(n, "unexpected text after blank line"));
                }
                break;
            }

            let role = match role_line.parse() {
                Ok(role @ (Role::User | Role::Assistant)) => role,
                _ => return Err(fail(n, "unknown role")),
            };
            let expected = if blocks.len() % 2 == 0 {
                Role::User
            } else {
                Role::Assistant
            };
            if role != expected {
                return Err(fail(n, "roles must alternate starting with user"));
            }

            let mut content = Vec::new();
            let mut closed = false;
            for (_, line) in lines.by_ref() {
                if line.trim() == SENTINEL {
                    closed = true;
                    break;
                }
                content.push(line);
            }
            if !closed {
                return Err(fail(n, "block is missing its closing sentinel"));
            }
            blocks.push(SaveBlock {
                role,
                content: content.join("\n").trim_end().to_owned(),
            });
        }

        Ok(Self {
            model_id: model_id.to_owned(),
            instr_key: instr_key.to_owned(),
            blocks,
        })
    }

    /// Renders the file contents. [`SaveFile::parse`] reads it back.
    pub fn render(&self) -> String {
        render_file(&self.model_id, &self.instr_key, &self.blocks)
    }

    /// Converts the blocks into conversation turns.
    pub fn into_turns(self) -> Vec<Turn> {
        self.blocks
            .into_iter()
            .map(|block| Turn::restored(block.role, block.content))
            .collect()
    }
}

/// Reads and parses the save file at `path`.
pub fn read_save(path: &Path) -> Result<SaveFile, StoreError> {
    let text =
        fs::read_to_string(path).map_err(|err| StoreError::io(path, err))?;
    SaveFile::parse(&text).map_err(|err| StoreError::MalformedSaveFile {
        path: path.to_owned(),
        line: err.line,
        reason: err.reason,
    })
}

fn render_header(model_id: &str, instr_key: &str) -> String {
    format!("{model_id}, {instr_key}\n{SENTINEL}\n")
}

fn render_file(
    model_id: &str,
    instr_key: &str,
    blocks: &[SaveBlock],
) -> String {
    let mut text = render_header(model_id, instr_key);
    for block in blocks {
        text.push_str(&render_block(block.role, &block.content));
    }
    text
}

fn render_block(role: Role, content: &str) -> String {
    format!("{role}\n{}\n{SENTINEL}\n", content.trim_end())
}

/// The re-loadable mirror of the current conversation.
///
/// Unlike the transcript, this file always holds exactly the turns of the
/// in-memory conversation, one block per turn.
#[derive(Debug)]
pub struct SaveState {
    path: PathBuf,
    model_id: String,
    instr_key: String,
}

impl SaveState {
    /// Creates (or truncates) the save file at `path` with a fresh header.
    pub fn create<P, S1, S2>(
        path: P,
        model_id: S1,
        instr_key: S2,
    ) -> Result<Self, StoreError>
    where
        P: Into<PathBuf>,
        S1: Into<String>,
        S2: Into<String>,
    {
        let state = Self::attach(path, model_id, instr_key);
        state.write_header()?;
        Ok(state)
    }

    /// Binds to an existing save file without touching it.
    pub fn attach<P, S1, S2>(path: P, model_id: S1, instr_key: S2) -> Self
    where
        P: Into<PathBuf>,
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            path: path.into(),
            model_id: model_id.into(),
            instr_key: instr_key.into(),
        }
    }

    /// Binds to the save file at `path` and rewrites it with `blocks`.
    ///
    /// A file accepted by [`SaveFile::parse`] may carry trailing blank
    /// lines, which would break the next appended block.
    pub fn restore<P, S1, S2>(
        path: P,
        model_id: S1,
        instr_key: S2,
        blocks: &[SaveBlock],
    ) -> Result<Self, StoreError>
    where
        P: Into<PathBuf>,
        S1: Into<String>,
        S2: Into<String>,
    {
        let state = Self::attach(path, model_id, instr_key);
        fs::write(
            &state.path,
            render_file(&state.model_id, &state.instr_key, blocks),
        )
        .map_err(|err| StoreError::io(&state.path, err))?;
        Ok(state)
    }

    /// Returns the file path.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncates the file down to the two header lines.
    pub fn write_header(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StoreError::io(parent, err))?;
        }
        fs::write(&self.path, render_header(&self.model_id, &self.instr_key))
            .map_err(|err| StoreError::io(&self.path, err))
    }

    /// Appends one block.
    pub fn write_dialog(
        &self,
        role: Role,
        content: &str,
    ) -> Result<(), StoreError> {
        let block = render_block(role, content);
        OpenOptions::new()
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(block.as_bytes()))
            .map_err(|err| StoreError::io(&self.path, err))
    }

    /// Reads the file back.
    #[inline]
    pub fn read(&self) -> Result<SaveFile, StoreError> {
        read_save(&self.path)
    }

    /// Removes the last `count` blocks.
    ///
    /// The file is parsed, the blocks are dropped from the parsed list and
    /// the file is rewritten. If the file holds fewer than `count` blocks it
    /// is left as is.
    pub fn drop_last(&self, count: usize) -> Result<(), StoreError> {
        if count == 0 {
            return Ok(());
        }
        let mut save = self.read()?;
        let found = save.blocks.len();
        if found < count {
            return Err(StoreError::MissingBlocks {
                path: self.path.clone(),
                wanted: count,
                found,
            });
        }
        save.blocks.truncate(found - count);
        fs::write(&self.path, save.render())
            .map_err(|err| StoreError::io(&self.path, err))?;
        trace!("dropped {count} block(s) from {}", self.path.display());
        Ok(())
    }
}
