//! # CoNLL-U Documents
//!
//! Reading and writing of the ten-column CoNLL-U format, and the in-memory
//! [`Document`] that the rest of the crate treats as a corpus. A document is
//! immutable once read, except through [`Document::set`], which overwrites
//! annotation columns with model predictions.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ArborError, Result};

/// Placeholder written for an empty column.
pub const EMPTY: &str = "_";

/// Annotation columns that predictions may overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    Upos,
    Xpos,
    Feats,
    Head,
    Deprel,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Upos => write!(f, "UPOS"),
            Field::Xpos => write!(f, "XPOS"),
            Field::Feats => write!(f, "FEATS"),
            Field::Head => write!(f, "HEAD"),
            Field::Deprel => write!(f, "DEPREL"),
        }
    }
}

/// One syntactic word of a sentence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// One-based position in the sentence.
    pub id: usize,
    pub form: String,
    pub lemma: Option<String>,
    pub upos: Option<String>,
    pub xpos: Option<String>,
    pub feats: Option<String>,
    /// Index of the governing word; `0` is the root.
    pub head: Option<usize>,
    pub deprel: Option<String>,
    pub deps: Option<String>,
    pub misc: Option<String>,
}

impl Token {
    /// Creates a token with only a surface form.
    pub fn new(id: usize, form: impl Into<String>) -> Self {
        Self {
            id,
            form: form.into(),
            ..Self::default()
        }
    }

    /// Builder-style setter for the UPOS column.
    pub fn with_upos(mut self, upos: impl Into<String>) -> Self {
        self.upos = Some(upos.into());
        self
    }

    /// Builder-style setter for the XPOS column.
    pub fn with_xpos(mut self, xpos: impl Into<String>) -> Self {
        self.xpos = Some(xpos.into());
        self
    }

    /// Builder-style setter for the FEATS column.
    pub fn with_feats(mut self, feats: impl Into<String>) -> Self {
        self.feats = Some(feats.into());
        self
    }

    /// Builder-style setter for HEAD and DEPREL.
    pub fn with_arc(mut self, head: usize, deprel: impl Into<String>) -> Self {
        self.head = Some(head);
        self.deprel = Some(deprel.into());
        self
    }

    /// Value of a tag column, or `_` when empty.
    pub fn field(&self, field: Field) -> String {
        match field {
            Field::Upos => column(&self.upos).to_string(),
            Field::Xpos => column(&self.xpos).to_string(),
            Field::Feats => column(&self.feats).to_string(),
            Field::Head => self
                .head
                .map_or_else(|| EMPTY.to_string(), |h| h.to_string()),
            Field::Deprel => column(&self.deprel).to_string(),
        }
    }

    fn set_field(&mut self, field: Field, value: &str) -> Result<()> {
        match field {
            Field::Upos => self.upos = non_empty(value),
            Field::Xpos => self.xpos = non_empty(value),
            Field::Feats => self.feats = non_empty(value),
            Field::Deprel => self.deprel = non_empty(value),
            Field::Head => {
                self.head = match value {
                    EMPTY => None,
                    v => Some(v.parse().map_err(|_| {
                        ArborError::Configuration(format!("head index must be numeric, got {v:?}"))
                    })?),
                }
            }
        }
        Ok(())
    }

    fn to_line(&self) -> String {
        let head = self
            .head
            .map_or_else(|| EMPTY.to_string(), |h| h.to_string());
        [
            self.id.to_string().as_str(),
            &self.form,
            column(&self.lemma),
            column(&self.upos),
            column(&self.xpos),
            column(&self.feats),
            &head,
            column(&self.deprel),
            column(&self.deps),
            column(&self.misc),
        ]
        .join("\t")
    }
}

/// A sentence: its words plus the lines that are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentence {
    /// Comment lines including the leading `#`.
    pub comments: Vec<String>,
    pub tokens: Vec<Token>,
    /// Multi-word token range lines, keyed by the index of the word they precede.
    pub multiword: Vec<(usize, String)>,
}

impl Sentence {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// An ordered corpus of sentences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub sentences: Vec<Sentence>,
}

impl Document {
    pub fn new(sentences: Vec<Sentence>) -> Self {
        Self { sentences }
    }

    /// Reads a CoNLL-U file.
    pub fn from_conllu_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ArborError::ResourceNotFound(path.to_path_buf()));
        }
        let reader = BufReader::new(File::open(path)?);
        Self::from_reader(reader, path)
    }

    /// Parses CoNLL-U text. `origin` is only used in error messages.
    pub fn from_reader<R: BufRead>(reader: R, origin: &Path) -> Result<Self> {
        let mut sentences = Vec::new();
        let mut current = Sentence::default();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end_matches(['\r', '\n']);

            if line.trim().is_empty() {
                if !current.is_empty() {
                    sentences.push(std::mem::take(&mut current));
                } else {
                    current = Sentence::default();
                }
                continue;
            }

            if line.starts_with('#') {
                current.comments.push(line.to_string());
                continue;
            }

            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() != 10 {
                return Err(ArborError::format(
                    origin,
                    line_no + 1,
                    format!("expected 10 columns, found {}", parts.len()),
                ));
            }

            let id = parts[0];
            if id.contains('-') {
                current.multiword.push((current.tokens.len(), line.to_string()));
                continue;
            }
            if id.contains('.') {
                // Empty nodes are not modeled.
                continue;
            }

            let id: usize = id.parse().map_err(|_| {
                ArborError::format(origin, line_no + 1, format!("invalid word id {id:?}"))
            })?;
            if id != current.tokens.len() + 1 {
                return Err(ArborError::format(
                    origin,
                    line_no + 1,
                    format!("word id {id} out of sequence"),
                ));
            }
            let head = match parts[6] {
                EMPTY => None,
                h => Some(h.parse().map_err(|_| {
                    ArborError::format(origin, line_no + 1, format!("invalid head {h:?}"))
                })?),
            };

            current.tokens.push(Token {
                id,
                form: parts[1].to_string(),
                lemma: non_empty(parts[2]),
                upos: non_empty(parts[3]),
                xpos: non_empty(parts[4]),
                feats: non_empty(parts[5]),
                head,
                deprel: non_empty(parts[7]),
                deps: non_empty(parts[8]),
                misc: non_empty(parts[9]),
            });
        }

        if !current.is_empty() {
            sentences.push(current);
        }

        Ok(Self { sentences })
    }

    /// Writes the document as CoNLL-U.
    pub fn write_conllu<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        for sentence in &self.sentences {
            for comment in &sentence.comments {
                writeln!(writer, "{comment}")?;
            }
            let mut ranges = sentence.multiword.iter().peekable();
            for (i, token) in sentence.tokens.iter().enumerate() {
                while let Some((_, line)) = ranges.next_if(|(before, _)| *before == i) {
                    writeln!(writer, "{line}")?;
                }
                writeln!(writer, "{}", token.to_line())?;
            }
            writeln!(writer)?;
        }
        Ok(())
    }

    /// Overwrites `fields` of every token, in document order.
    ///
    /// `values` holds one entry per token across all sentences; each entry has
    /// one value per field.
    pub fn set(&mut self, fields: &[Field], values: &[Vec<String>]) -> Result<()> {
        let num_tokens = self.num_tokens();
        if values.len() != num_tokens {
            return Err(ArborError::Configuration(format!(
                "expected {num_tokens} predictions, got {}",
                values.len()
            )));
        }

        let tokens = self.sentences.iter_mut().flat_map(|s| s.tokens.iter_mut());
        for (token, row) in tokens.zip(values) {
            if row.len() != fields.len() {
                return Err(ArborError::Configuration(format!(
                    "expected {} values per token, got {}",
                    fields.len(),
                    row.len()
                )));
            }
            for (field, value) in fields.iter().zip(row) {
                token.set_field(*field, value)?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    pub fn num_tokens(&self) -> usize {
        self.sentences.iter().map(Sentence::len).sum()
    }

    /// Whether any token carries a value in the given column.
    pub fn has_field(&self, field: Field) -> bool {
        self.sentences
            .iter()
            .flat_map(|s| &s.tokens)
            .any(|t| t.field(field) != EMPTY)
    }
}

fn column(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or(EMPTY)
}

fn non_empty(value: &str) -> Option<String> {
    if value == EMPTY {
        None
    } else {
        Some(value.to_string())
    }
}
