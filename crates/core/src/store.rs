//! On-disk stores of a chat session.
//!
//! Each session writes two files. The [`Transcript`] is a human-readable,
//! append-only log of everything that was said. The [`SaveState`] mirrors
//! the current in-memory conversation exactly and can be parsed back to
//! resume the session later. [`SessionLog`] keeps the two in step.

mod save_state;
mod transcript;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub use save_state::{
    ParseError, SENTINEL, SaveBlock, SaveFile, SaveState, read_save,
};
pub use transcript::{HeaderState, Transcript};

use crate::conversation::Role;

/// Marker written to the transcript when a reply is regenerated.
pub const RETRY_MARKER: &str = "[retry]";
/// Marker written to the transcript when an exchange is taken back.
pub const UNDO_MARKER: &str = "[undo]";

/// Errors from reading or writing session files.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A save file does not follow the expected structure.
    #[error("malformed save file {}, line {line}: {reason}", path.display())]
    MalformedSaveFile {
        /// The offending file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        reason: &'static str,
    },
    /// A save file holds fewer blocks than the conversation assumes.
    #[error(
        "save file {} holds {found} block(s), cannot drop {wanted}",
        path.display()
    )]
    MissingBlocks {
        /// The offending file.
        path: PathBuf,
        /// Blocks that should have been dropped.
        wanted: usize,
        /// Blocks actually present.
        found: usize,
    },
    /// Any I/O failure.
    #[error("cannot access {}: {error}", path.display())]
    Io {
        /// The file or directory being accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: &Path, error: io::Error) -> Self {
        StoreError::Io {
            path: path.to_owned(),
            error,
        }
    }
}

/// Turns a model id into something usable as a file name.
pub fn file_stem(model_id: &str) -> String {
    model_id
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

/// The transcript and save state of one session.
#[derive(Debug)]
pub struct SessionLog {
    transcript: Transcript,
    save: SaveState,
}

impl SessionLog {
    /// Starts a new session in `log_dir`: the transcript is appended to
    /// `<model>.log` and the save state is recreated as `<model>.apai`.
    pub fn create(
        log_dir: &Path,
        model_id: &str,
        instr_key: &str,
    ) -> Result<Self, StoreError> {
        let stem = file_stem(model_id);
        let transcript = Transcript::new(
            log_dir.join(format!("{stem}.log")),
            model_id,
            instr_key,
        );
        let save = SaveState::create(
            log_dir.join(format!("{stem}.apai")),
            model_id,
            instr_key,
        )?;
        debug!("started session log for {model_id} in {}", log_dir.display());
        Ok(Self { transcript, save })
    }

    /// Resumes a session from a parsed save at `save_path`. The file is
    /// rewritten in canonical form and new turns are appended to it.
    pub fn attach(
        log_dir: &Path,
        save_path: &Path,
        save: &SaveFile,
        model_id: &str,
        instr_key: &str,
    ) -> Result<Self, StoreError> {
        let transcript = Transcript::new(
            log_dir.join(format!("{}.log", file_stem(model_id))),
            model_id,
            instr_key,
        );
        let save =
            SaveState::restore(save_path, model_id, instr_key, &save.blocks)?;
        Ok(Self { transcript, save })
    }

    /// Returns the transcript.
    #[inline]
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Returns the save state.
    #[inline]
    pub fn save_state(&self) -> &SaveState {
        &self.save
    }

    /// Records a turn in both files.
    pub fn write_dialog(
        &mut self,
        role: Role,
        content: &str,
    ) -> Result<(), StoreError> {
        self.transcript.write_dialog(role, content)?;
        self.save.write_dialog(role, content)
    }

    /// Drops the newest `blocks` blocks from the save state. The transcript
    /// keeps them, since they were really said.
    #[inline]
    pub fn drop_blocks(&mut self, blocks: usize) -> Result<(), StoreError> {
        self.save.drop_last(blocks)
    }

    /// Marks a regenerated reply in the transcript.
    #[inline]
    pub fn mark_retry(&mut self) -> Result<(), StoreError> {
        self.transcript.write_marker(RETRY_MARKER)
    }

    /// Marks a taken back exchange in the transcript.
    #[inline]
    pub fn mark_undo(&mut self) -> Result<(), StoreError> {
        self.transcript.write_marker(UNDO_MARKER)
    }

    /// Copies the save state to `path` and continues writing there.
    pub fn save_as(&mut self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StoreError::io(parent, err))?;
        }
        if path != self.save.path() {
            fs::copy(self.save.path(), path)
                .map_err(|err| StoreError::io(path, err))?;
        }
        let save = self.save.read()?;
        self.save = SaveState::attach(path, save.model_id, save.instr_key);
        info!("save state moved to {}", path.display());
        Ok(())
    }

    /// Deletes the transcript.
    #[inline]
    pub fn clean(&mut self) -> Result<(), StoreError> {
        self.transcript.clean()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("deepseek-chat"), "deepseek-chat");
        assert_eq!(file_stem("openai/gpt-4o:free"), "openai_gpt-4o_free");
    }

    #[test]
    fn test_retry_and_undo_keep_files_in_step() {
        let dir = TempDir::new().unwrap();
        let mut log = SessionLog::create(dir.path(), "gpt", "default").unwrap();
        log.write_dialog(Role::User, "Hello").unwrap();
        log.write_dialog(Role::Assistant, "Hi").unwrap();
        log.write_dialog(Role::User, "Bye").unwrap();
        log.write_dialog(Role::Assistant, "See you").unwrap();

        log.drop_blocks(1).unwrap();
        log.mark_retry().unwrap();
        assert_eq!(log.save_state().read().unwrap().blocks.len(), 3);
        log.write_dialog(Role::Assistant, "Later").unwrap();

        log.drop_blocks(2).unwrap();
        log.mark_undo().unwrap();
        let blocks = log.save_state().read().unwrap().blocks;
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].content, "Hi");

        let transcript = fs::read_to_string(log.transcript().path()).unwrap();
        let retry_at = transcript.find(RETRY_MARKER).unwrap();
        assert!(transcript.find("See you").unwrap() < retry_at);
        assert!(retry_at < transcript.find("Later").unwrap());
        assert!(transcript.ends_with("[undo]\n\n"));
    }

    #[test]
    fn test_save_as_rebinds() {
        let dir = TempDir::new().unwrap();
        let mut log = SessionLog::create(dir.path(), "gpt", "default").unwrap();
        log.write_dialog(Role::User, "Hello").unwrap();

        let target = dir.path().join("saves").join("greeting.apai");
        log.save_as(&target).unwrap();
        assert_eq!(log.save_state().path(), target);

        log.write_dialog(Role::Assistant, "Hi").unwrap();
        assert_eq!(read_save(&target).unwrap().blocks.len(), 2);
        let working = dir.path().join("gpt.apai");
        assert_eq!(read_save(&working).unwrap().blocks.len(), 1);
    }
}
