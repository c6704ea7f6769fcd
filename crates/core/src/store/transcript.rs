use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;

use super::StoreError;
use crate::conversation::Role;

const DOUBLE_LINE: &str = "==================================================";
const SINGLE_LINE: &str = "--------------------------------------------------";

/// Whether the session header has been written to the transcript.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HeaderState {
    /// Nothing of this session is in the file yet.
    #[default]
    NotWritten,
    /// The header is in the file, dialogs can follow.
    Written,
}

/// The append-only, human-readable log of a session.
///
/// Every turn is mirrored here and never taken back: retries and undos only
/// leave a marker line. The file grows until [`Transcript::clean`] removes
/// it.
#[derive(Debug)]
pub struct Transcript {
    path: PathBuf,
    model_id: String,
    instr_key: String,
    header: HeaderState,
}

impl Transcript {
    /// Binds a transcript to `path`. Nothing is written until the first
    /// dialog.
    pub fn new<P, S1, S2>(path: P, model_id: S1, instr_key: S2) -> Self
    where
        P: Into<PathBuf>,
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            path: path.into(),
            model_id: model_id.into(),
            instr_key: instr_key.into(),
            header: HeaderState::NotWritten,
        }
    }

    /// Returns the file path.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` if the file exists on disk.
    #[inline]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Returns whether the header of this session has been written.
    #[inline]
    pub fn header_state(&self) -> HeaderState {
        self.header
    }

    /// Appends a session header. Every call appends a new one.
    pub fn write_header(&mut self) -> Result<(), StoreError> {
        let text = format!(
            "{DOUBLE_LINE}\n\nmodel_id: {}\nInstr_key: {}\n\n",
            self.model_id, self.instr_key
        );
        self.append(&text)?;
        self.header = HeaderState::Written;
        Ok(())
    }

    /// Appends a timestamped dialog block, writing the header first if this
    /// is the first dialog of the session.
    pub fn write_dialog(
        &mut self,
        role: Role,
        content: &str,
    ) -> Result<(), StoreError> {
        if self.header == HeaderState::NotWritten {
            self.write_header()?;
        }
        let time = Local::now().format("%Y-%m-%d %H:%M:%S");
        self.append(&format!(
            "{SINGLE_LINE}\n\n{time}\n{role}:\n{content}\n\n"
        ))
    }

    /// Appends a one-line annotation such as `[retry]`.
    pub fn write_marker(&mut self, marker: &str) -> Result<(), StoreError> {
        self.append(&format!("{marker}\n\n"))
    }

    /// Deletes the file. A missing file is not an error.
    ///
    /// The next dialog starts the file over with a fresh header.
    pub fn clean(&mut self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(StoreError::io(&self.path, err)),
        }
        debug!("removed transcript {}", self.path.display());
        self.header = HeaderState::NotWritten;
        Ok(())
    }

    fn append(&self, text: &str) -> Result<(), StoreError> {
        append_to(&self.path, text).map_err(|err| StoreError::io(&self.path, err))
    }
}

fn append_to(path: &Path, text: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(text.as_bytes())
}
