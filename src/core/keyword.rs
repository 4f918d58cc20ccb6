// Library identity and keyword descriptor records shared by every layer.
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

/// Logical identity of a library import: where it lives and how it is constructed.
///
/// Equality is structural; no path canonicalization happens here.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LibraryKey {
    pub path: String,
    pub args: Vec<String>,
}

impl LibraryKey {
    pub fn new<I, S>(path: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// One callable operation exposed by a library.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KeywordInfo {
    pub name: String,
    pub doc: String,
    pub source: String,
    /// Display-ready signature parts: `name`, `name=default`, or `*name`.
    pub arguments: Vec<String>,
}

impl KeywordInfo {
    pub fn new<I, S>(
        name: impl Into<String>,
        doc: impl Into<String>,
        source: impl Into<String>,
        arguments: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            doc: doc.into(),
            source: source.into(),
            arguments: arguments.into_iter().map(Into::into).collect(),
        }
    }
}

/// Structured parameter list as a library declares it.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(default)]
    pub names: Vec<String>,
    /// Defaults for the trailing `defaults.len()` names.
    #[serde(default)]
    pub defaults: Vec<String>,
    #[serde(default)]
    pub varargs: Option<String>,
}

impl ParamSpec {
    pub fn required_count(&self) -> usize {
        self.names.len().saturating_sub(self.defaults.len())
    }

    /// Flattens the parameter list into the display form stored in `KeywordInfo::arguments`.
    pub fn flatten(&self) -> Result<Vec<String>, Error> {
        if self.defaults.len() > self.names.len() {
            return Err(Error::new(ErrorKind::Introspection).with_message(format!(
                "{} defaults declared for {} parameters",
                self.defaults.len(),
                self.names.len()
            )));
        }
        let first_default = self.required_count();
        let mut out: Vec<String> = self.names.clone();
        for (offset, value) in self.defaults.iter().enumerate() {
            let slot = &mut out[first_default + offset];
            slot.push('=');
            slot.push_str(value);
        }
        if let Some(varargs) = &self.varargs {
            out.push(format!("*{varargs}"));
        }
        Ok(out)
    }
}
