use std::{collections::HashMap, path::Path};

use crate::error::{ConfigError, Error, Result};

pub const BLANK_TOKEN: &str = "<blank>";
pub const EOS_TOKEN: &str = "<eos>";

/// Fixed token <-> id mapping: `0` is the CTC blank, labels take `1..=n`
/// and `n + 1` marks both the start and the end of a sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct Vocabulary {
    tokens: Vec<String>,
    index: HashMap<String, u32>,
}

impl Vocabulary {
    pub fn new<S: Into<String>>(
        tokens: impl IntoIterator<Item = S>,
    ) -> std::result::Result<Self, ConfigError> {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        if tokens.is_empty() {
            return Err(ConfigError::InvalidVocabulary("no labels".into()));
        }
        let mut index = HashMap::with_capacity(tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            if token == BLANK_TOKEN || token == EOS_TOKEN {
                return Err(ConfigError::InvalidVocabulary(format!(
                    "reserved token {token} listed as a label"
                )));
            }
            if index.insert(token.clone(), i as u32 + 1).is_some() {
                return Err(ConfigError::InvalidVocabulary(format!(
                    "duplicate token {token}"
                )));
            }
        }
        Ok(Self { tokens, index })
    }

    /// One token per line; blank lines are skipped.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io("read vocabulary", e))?;
        let tokens = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned);
        Ok(Self::new(tokens)?)
    }

    pub fn num_labels(&self) -> usize {
        self.tokens.len()
    }

    /// Size of the attention output space: blank, labels and sos/eos.
    pub fn len(&self) -> usize {
        self.tokens.len() + 2
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Size of the CTC output space: blank and labels.
    pub fn ctc_size(&self) -> usize {
        self.tokens.len() + 1
    }

    pub fn blank(&self) -> u32 {
        0
    }

    pub fn sos(&self) -> u32 {
        self.tokens.len() as u32 + 1
    }

    pub fn eos(&self) -> u32 {
        self.sos()
    }

    pub fn is_label(&self, id: u32) -> bool {
        id >= 1 && (id as usize) <= self.tokens.len()
    }

    pub fn id(&self, token: &str) -> Option<u32> {
        self.index.get(token).copied()
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        match id {
            0 => Some(BLANK_TOKEN),
            id if id == self.eos() => Some(EOS_TOKEN),
            id => self.tokens.get(id as usize - 1).map(String::as_str),
        }
    }

    pub fn encode<S: AsRef<str>>(&self, tokens: &[S]) -> Result<Vec<u32>> {
        tokens
            .iter()
            .map(|t| {
                self.id(t.as_ref())
                    .ok_or_else(|| Error::input(format!("unknown token {:?}", t.as_ref())))
            })
            .collect()
    }

    /// Label tokens of `ids`; blank and end markers are dropped.
    pub fn decode(&self, ids: &[u32]) -> Vec<&str> {
        ids.iter()
            .filter(|&&id| self.is_label(id))
            .filter_map(|&id| self.token(id))
            .collect()
    }
}
