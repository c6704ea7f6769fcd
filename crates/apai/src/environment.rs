//! The configuration environment.
//!
//! A working directory holds three TOML files:
//!
//! - `api_bin.toml` lists providers, each with an API key, a base URL and
//!   the models it serves.
//! - `instr_bin.toml` lists instructions by key.
//! - `config.toml` records the current choice of provider, model,
//!   instruction and context length. It is rewritten on every change.
//!
//! Session files live next to them, under `log/` and `saves/`.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use similar::TextDiff;

const API_FILE: &str = "api_bin.toml";
const INSTR_FILE: &str = "instr_bin.toml";
const CONFIG_FILE: &str = "config.toml";
const LOG_DIR: &str = "log";
const SAVES_DIR: &str = "saves";
const SAVE_EXT: &str = "apai";

/// Candidates scoring below this similarity never match a query.
const MATCH_CUTOFF: f32 = 0.2;

/// Errors from loading or changing the configuration.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    /// No model is close enough to the query.
    #[error("no model matches `{0}`")]
    ModelNotFound(String),
    /// No instruction is close enough to the query.
    #[error("no instruction matches `{0}`")]
    InstructionNotFound(String),
    /// A context length of zero was requested.
    #[error("context length must be at least 1, got {0}")]
    InvalidContextLength(usize),
    /// `api_bin.toml` lists no model at all.
    #[error("no model found in {API_FILE}")]
    NoModels,
    /// A configuration file could not be read or written.
    #[error("cannot access {}: {source}", path.display())]
    Io {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },
    /// A configuration file is not valid TOML of the expected shape.
    #[error("cannot parse {}: {source}", path.display())]
    Parse {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        source: toml::de::Error,
    },
    /// The configuration could not be serialized.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),
}

/// A provider entry of `api_bin.toml`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ApiEntry {
    /// The API key.
    pub api: String,
    /// The base URL of the OpenAI-compatible endpoint.
    pub url: String,
    /// Model ids served by this provider.
    pub models: Vec<String>,
}

/// An instruction entry of `instr_bin.toml`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Instruction {
    /// The system prompt text.
    pub content: String,
}

/// The contents of `config.toml`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Name of the provider entry serving the model.
    pub provider: String,
    /// API key of that provider.
    pub api: String,
    /// Base URL of that provider.
    pub url: String,
    /// The current model. Empty until one is chosen.
    pub model_id: String,
    /// Key of the current instruction.
    pub instr_key: String,
    /// Number of exchanges sent as context.
    pub context_len: usize,
}

/// The loaded configuration files of a working directory.
#[derive(Clone, Debug)]
pub struct Environment {
    dir: PathBuf,
    apis: BTreeMap<String, ApiEntry>,
    instructions: BTreeMap<String, Instruction>,
    config: Config,
}

impl Environment {
    /// Loads the configuration files from `dir`.
    pub fn load<P: Into<PathBuf>>(dir: P) -> Result<Self, EnvError> {
        let dir = dir.into();
        let apis: BTreeMap<String, ApiEntry> = read_toml(&dir.join(API_FILE))?;
        let instructions = read_toml(&dir.join(INSTR_FILE))?;
        let config = read_toml(&dir.join(CONFIG_FILE))?;
        if apis.values().all(|api| api.models.is_empty()) {
            return Err(EnvError::NoModels);
        }
        debug!("loaded environment from {}", dir.display());
        Ok(Self {
            dir,
            apis,
            instructions,
            config,
        })
    }

    /// Returns the current configuration.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns every model id, grouped by provider.
    pub fn model_ids(&self) -> Vec<&str> {
        self.apis
            .values()
            .flat_map(|api| api.models.iter().map(String::as_str))
            .collect()
    }

    /// Returns every instruction key.
    pub fn instr_keys(&self) -> Vec<&str> {
        self.instructions.keys().map(String::as_str).collect()
    }

    /// Returns `true` if the configured model is not served by any
    /// provider, which is the case before the first model is chosen.
    pub fn needs_model(&self) -> bool {
        self.provider_of(&self.config.model_id).is_none()
    }

    /// Returns the text of the configured instruction.
    pub fn instruction(&self) -> Result<&str, EnvError> {
        self.instructions
            .get(&self.config.instr_key)
            .map(|instr| instr.content.as_str())
            .ok_or_else(|| {
                EnvError::InstructionNotFound(self.config.instr_key.clone())
            })
    }

    /// Returns the model id closest to `query`.
    pub fn match_model_id(&self, query: &str) -> Option<&str> {
        closest_match(query, self.model_ids())
    }

    /// Returns the instruction key closest to `query`.
    pub fn match_instr_key(&self, query: &str) -> Option<&str> {
        closest_match(query, self.instr_keys())
    }

    /// Switches to the model closest to `query` and persists the change.
    /// Returns the id of the model switched to.
    pub fn change_model(&mut self, query: &str) -> Result<String, EnvError> {
        let model_id = self
            .match_model_id(query)
            .ok_or_else(|| EnvError::ModelNotFound(query.to_owned()))?
            .to_owned();
        self.set_model(&model_id)?;
        Ok(model_id)
    }

    /// Switches to the instruction closest to `query` and persists the
    /// change. Returns the key switched to.
    pub fn change_instr_key(&mut self, query: &str) -> Result<String, EnvError> {
        let instr_key = self
            .match_instr_key(query)
            .ok_or_else(|| EnvError::InstructionNotFound(query.to_owned()))?
            .to_owned();
        self.config.instr_key = instr_key.clone();
        self.persist()?;
        Ok(instr_key)
    }

    /// Changes the context length and persists the change.
    pub fn change_context_len(
        &mut self,
        context_len: usize,
    ) -> Result<(), EnvError> {
        if context_len == 0 {
            return Err(EnvError::InvalidContextLength(context_len));
        }
        self.config.context_len = context_len;
        self.persist()
    }

    /// Switches to exactly `model_id` and `instr_key`, as recorded in a
    /// save file. Nothing changes unless both are known.
    ///
    /// Unlike the other setters this does not write `config.toml`; call
    /// [`Environment::persist`] once the switch is committed.
    pub fn apply_save_header(
        &mut self,
        model_id: &str,
        instr_key: &str,
    ) -> Result<(), EnvError> {
        if self.provider_of(model_id).is_none() {
            return Err(EnvError::ModelNotFound(model_id.to_owned()));
        }
        if !self.instructions.contains_key(instr_key) {
            return Err(EnvError::InstructionNotFound(instr_key.to_owned()));
        }
        self.select_model(model_id)?;
        self.config.instr_key = instr_key.to_owned();
        Ok(())
    }

    /// Writes the current configuration to `config.toml`.
    pub fn persist(&self) -> Result<(), EnvError> {
        let path = self.dir.join(CONFIG_FILE);
        let text = toml::to_string(&self.config)?;
        fs::write(&path, text).map_err(|source| EnvError::Io { path, source })?;
        debug!("config saved: {:?}", self.config);
        Ok(())
    }

    /// Returns the directory of transcripts and working save files.
    #[inline]
    pub fn log_dir(&self) -> PathBuf {
        self.dir.join(LOG_DIR)
    }

    /// Returns the path of the named save.
    #[inline]
    pub fn save_path(&self, name: &str) -> PathBuf {
        self.dir.join(SAVES_DIR).join(format!("{name}.{SAVE_EXT}"))
    }

    /// Resolves a user-supplied path against the working directory.
    #[inline]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.dir.join(path)
    }

    fn provider_of(&self, model_id: &str) -> Option<(&String, &ApiEntry)> {
        if model_id.is_empty() {
            return None;
        }
        self.apis
            .iter()
            .find(|(_, api)| api.models.iter().any(|m| m == model_id))
    }

    fn set_model(&mut self, model_id: &str) -> Result<(), EnvError> {
        self.select_model(model_id)?;
        self.persist()
    }

    fn select_model(&mut self, model_id: &str) -> Result<(), EnvError> {
        let (provider, api) = self
            .provider_of(model_id)
            .map(|(provider, api)| (provider.clone(), api.clone()))
            .ok_or_else(|| EnvError::ModelNotFound(model_id.to_owned()))?;
        self.config.provider = provider;
        self.config.api = api.api;
        self.config.url = api.url;
        self.config.model_id = model_id.to_owned();
        Ok(())
    }
}

fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T, EnvError> {
    let text = fs::read_to_string(path).map_err(|source| EnvError::Io {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| EnvError::Parse {
        path: path.to_owned(),
        source,
    })
}

/// Picks the candidate most similar to `query`. An exact match always
/// wins; otherwise the best character-level similarity ratio at or above
/// the cutoff does, the earliest candidate winning ties.
fn closest_match<'a>(query: &str, candidates: Vec<&'a str>) -> Option<&'a str> {
    if let Some(exact) = candidates.iter().find(|c| **c == query) {
        return Some(*exact);
    }
    let mut best: Option<(f32, &str)> = None;
    for candidate in candidates {
        let ratio = TextDiff::from_chars(query, candidate).ratio();
        if ratio < MATCH_CUTOFF {
            continue;
        }
        if best.is_none_or(|(best_ratio, _)| ratio > best_ratio) {
            best = Some((ratio, candidate));
        }
    }
    best.map(|(_, candidate)| candidate)
}
