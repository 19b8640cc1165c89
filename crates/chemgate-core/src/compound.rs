use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Which identifier defines compound identity and ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryIdentifier {
    /// Registry number.
    #[default]
    Cid,
    Smiles,
    Inchi,
}

impl PrimaryIdentifier {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cid => "cid",
            Self::Smiles => "smiles",
            Self::Inchi => "inchi",
        }
    }

    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        match input.trim().to_ascii_lowercase().as_str() {
            "cid" => Ok(Self::Cid),
            "smiles" => Ok(Self::Smiles),
            "inchi" => Ok(Self::Inchi),
            _ => Err(ValidationError::InvalidPrimaryIdentifier {
                value: input.to_owned(),
            }),
        }
    }
}

/// Borrowed identity of a [`Compound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CompoundKey<'a> {
    Cid(u64),
    Smiles(&'a str),
    Inchi(&'a str),
}

impl Display for CompoundKey<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cid(cid) => write!(f, "cid: {cid}"),
            Self::Smiles(smiles) => write!(f, "smiles: {smiles}"),
            Self::Inchi(inchi) => write!(f, "inchi: {inchi}"),
        }
    }
}

/// Resolved compound.
///
/// Equality, hashing and ordering look only at the primary identifier, so two
/// compounds with the same registry number are the same compound whatever
/// their other fields say.
#[derive(Debug, Clone, Serialize)]
pub struct Compound {
    cid: u64,
    smiles: Option<String>,
    inchi: Option<String>,
    iupac: Option<String>,
    properties: BTreeMap<String, String>,
    #[serde(skip)]
    primary: PrimaryIdentifier,
}

impl Compound {
    /// Compound keyed by registry number with no other fields.
    pub fn new(cid: u64) -> Self {
        Self {
            cid,
            smiles: None,
            inchi: None,
            iupac: None,
            properties: BTreeMap::new(),
            primary: PrimaryIdentifier::Cid,
        }
    }

    pub fn builder(cid: u64) -> CompoundBuilder {
        CompoundBuilder {
            compound: Self::new(cid),
        }
    }

    pub const fn cid(&self) -> u64 {
        self.cid
    }

    pub fn smiles(&self) -> Option<&str> {
        self.smiles.as_deref()
    }

    pub fn inchi(&self) -> Option<&str> {
        self.inchi.as_deref()
    }

    pub fn iupac(&self) -> Option<&str> {
        self.iupac.as_deref()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub const fn primary(&self) -> PrimaryIdentifier {
        self.primary
    }

    pub fn key(&self) -> CompoundKey<'_> {
        // Builders guarantee the primary field is present.
        match self.primary {
            PrimaryIdentifier::Cid => CompoundKey::Cid(self.cid),
            PrimaryIdentifier::Smiles => CompoundKey::Smiles(self.smiles.as_deref().unwrap_or_default()),
            PrimaryIdentifier::Inchi => CompoundKey::Inchi(self.inchi.as_deref().unwrap_or_default()),
        }
    }
}

impl PartialEq for Compound {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Compound {}

impl Hash for Compound {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Compound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Compound {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl Display for Compound {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Compound - {}", self.key())
    }
}

/// Builder producing immutable [`Compound`] values.
#[derive(Debug, Clone)]
pub struct CompoundBuilder {
    compound: Compound,
}

impl CompoundBuilder {
    pub fn smiles(mut self, smiles: impl Into<String>) -> Self {
        self.compound.smiles = Some(smiles.into());
        self
    }

    pub fn inchi(mut self, inchi: impl Into<String>) -> Self {
        self.compound.inchi = Some(inchi.into());
        self
    }

    pub fn iupac(mut self, iupac: impl Into<String>) -> Self {
        self.compound.iupac = Some(iupac.into());
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.compound.properties.insert(name.into(), value.into());
        self
    }

    /// Finishes the compound keyed by `primary`; that field must be present.
    pub fn build(mut self, primary: PrimaryIdentifier) -> Result<Compound, ValidationError> {
        let present = match primary {
            PrimaryIdentifier::Cid => true,
            PrimaryIdentifier::Smiles => self.compound.smiles.is_some(),
            PrimaryIdentifier::Inchi => self.compound.inchi.is_some(),
        };
        if !present {
            return Err(ValidationError::MissingPrimaryIdentifier {
                field: primary.as_str(),
            });
        }
        self.compound.primary = primary;
        Ok(self.compound)
    }
}
