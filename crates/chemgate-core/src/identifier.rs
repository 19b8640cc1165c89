use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Identifier types accepted as exchange input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    /// Structural line notation.
    Smiles,
    /// Registry number.
    Cid,
    /// International identifier string.
    Inchi,
}

impl IdentifierKind {
    pub const ALL: [Self; 3] = [Self::Smiles, Self::Cid, Self::Inchi];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Smiles => "smiles",
            Self::Cid => "cid",
            Self::Inchi => "inchi",
        }
    }

    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        match input.trim().to_ascii_lowercase().as_str() {
            "smiles" => Ok(Self::Smiles),
            "cid" | "cids" => Ok(Self::Cid),
            "inchi" => Ok(Self::Inchi),
            _ => Err(ValidationError::InvalidIdentifierKind {
                value: input.to_owned(),
            }),
        }
    }
}

impl Display for IdentifierKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentifierKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Output field requested from an identifier-exchange job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputField {
    Cid,
    Inchi,
    /// Preferred (IUPAC) name. Output only.
    Iupac,
    Smiles,
}

impl OutputField {
    pub const ALL: [Self; 4] = [Self::Cid, Self::Inchi, Self::Iupac, Self::Smiles];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cid => "cid",
            Self::Inchi => "inchi",
            Self::Iupac => "iupac",
            Self::Smiles => "smiles",
        }
    }

    /// The input kind carrying the same information, if any.
    pub const fn kind(self) -> Option<IdentifierKind> {
        match self {
            Self::Cid => Some(IdentifierKind::Cid),
            Self::Inchi => Some(IdentifierKind::Inchi),
            Self::Smiles => Some(IdentifierKind::Smiles),
            Self::Iupac => None,
        }
    }

    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        match input.trim().to_ascii_lowercase().as_str() {
            "cid" | "cids" => Ok(Self::Cid),
            "inchi" => Ok(Self::Inchi),
            "iupac" | "name" => Ok(Self::Iupac),
            "smiles" => Ok(Self::Smiles),
            _ => Err(ValidationError::InvalidOutputField {
                value: input.to_owned(),
            }),
        }
    }
}

impl Display for OutputField {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputField {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parses a registry number, rejecting zero and non-digits.
pub fn parse_registry_number(value: &str) -> Result<u64, ValidationError> {
    let trimmed = value.trim();
    match trimmed.parse::<u64>() {
        Ok(cid) if cid > 0 && trimmed.bytes().all(|b| b.is_ascii_digit()) => Ok(cid),
        _ => Err(ValidationError::InvalidRegistryNumber {
            value: value.to_owned(),
        }),
    }
}

fn normalize(kind: IdentifierKind, index: usize, raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyIdentifier { index });
    }
    match kind {
        IdentifierKind::Cid => parse_registry_number(trimmed).map(|cid| cid.to_string()),
        IdentifierKind::Smiles | IdentifierKind::Inchi => Ok(trimmed.to_owned()),
    }
}

/// One validated identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    kind: IdentifierKind,
    value: String,
}

impl Identifier {
    pub fn new(kind: IdentifierKind, value: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            kind,
            value: normalize(kind, 0, value)?,
        })
    }

    pub const fn kind(&self) -> IdentifierKind {
        self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// Non-empty batch of identifiers that all share one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierBatch {
    kind: IdentifierKind,
    values: Vec<String>,
}

impl IdentifierBatch {
    pub fn new<I, S>(kind: IdentifierKind, values: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let values = values
            .into_iter()
            .enumerate()
            .map(|(index, value)| normalize(kind, index, value.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if values.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        Ok(Self { kind, values })
    }

    pub const fn kind(&self) -> IdentifierKind {
        self.kind
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_is_rejected_at_construction() {
        let error = IdentifierKind::parse("casrn").expect_err("not an input type");
        assert_eq!(
            error,
            ValidationError::InvalidIdentifierKind {
                value: String::from("casrn")
            }
        );
        assert_eq!("SMILES".parse::<IdentifierKind>(), Ok(IdentifierKind::Smiles));
    }

    #[test]
    fn iupac_names_have_no_input_kind() {
        assert_eq!(OutputField::Iupac.kind(), None);
        assert_eq!(OutputField::Cid.kind(), Some(IdentifierKind::Cid));
    }

    #[test]
    fn registry_numbers_are_normalized_and_validated() {
        let batch = IdentifierBatch::new(IdentifierKind::Cid, [" 2244", "0702"]).expect("valid");
        assert_eq!(batch.values(), &["2244", "702"]);

        let error = IdentifierBatch::new(IdentifierKind::Cid, ["2244", "-3"])
            .expect_err("negative registry number");
        assert_eq!(
            error,
            ValidationError::InvalidRegistryNumber {
                value: String::from("-3")
            }
        );
        assert!(parse_registry_number("0").is_err());
        assert!(parse_registry_number("+12").is_err());
    }

    #[test]
    fn batches_must_be_non_empty_without_blank_entries() {
        let empty: [&str; 0] = [];
        assert_eq!(
            IdentifierBatch::new(IdentifierKind::Smiles, empty),
            Err(ValidationError::EmptyBatch)
        );
        assert_eq!(
            IdentifierBatch::new(IdentifierKind::Smiles, ["CCO", "  "]),
            Err(ValidationError::EmptyIdentifier { index: 1 })
        );
    }

    #[test]
    fn structural_identifiers_are_kept_verbatim_after_trimming() {
        let id = Identifier::new(IdentifierKind::Inchi, " InChI=1S/CH4/h1H4 ").expect("valid");
        assert_eq!(id.value(), "InChI=1S/CH4/h1H4");
        assert_eq!(id.to_string(), "inchi:InChI=1S/CH4/h1H4");
    }
}
