use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Digest algorithms understood by the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DigestType {
    #[serde(rename = "dandi:md5")]
    Md5,
    #[serde(rename = "dandi:sha1")]
    Sha1,
    #[serde(rename = "dandi:sha2-256")]
    Sha2_256,
    #[serde(rename = "dandi:sha3-256")]
    Sha3_256,
    #[serde(rename = "dandi:blake2b-256")]
    Blake2b256,
    #[serde(rename = "dandi:blake3")]
    Blake3,
    #[serde(rename = "dandi:dandi-etag")]
    DandiEtag,
    #[serde(rename = "dandi:dandi-zarr-checksum")]
    DandiZarrChecksum,
}

impl DigestType {
    pub const ALL: [DigestType; 8] = [
        DigestType::Md5,
        DigestType::Sha1,
        DigestType::Sha2_256,
        DigestType::Sha3_256,
        DigestType::Blake2b256,
        DigestType::Blake3,
        DigestType::DandiEtag,
        DigestType::DandiZarrChecksum,
    ];

    /// Wire name, e.g. `dandi:dandi-etag`
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestType::Md5 => "dandi:md5",
            DigestType::Sha1 => "dandi:sha1",
            DigestType::Sha2_256 => "dandi:sha2-256",
            DigestType::Sha3_256 => "dandi:sha3-256",
            DigestType::Blake2b256 => "dandi:blake2b-256",
            DigestType::Blake3 => "dandi:blake3",
            DigestType::DandiEtag => "dandi:dandi-etag",
            DigestType::DandiZarrChecksum => "dandi:dandi-zarr-checksum",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for DigestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content digest: algorithm plus lowercase hex value.
///
/// Equality requires both the algorithm and the value to match. Serializes as
/// a single-entry map `{"dandi:md5": "..."}`, the shape used in asset metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    pub algorithm: DigestType,
    pub value: String,
}

impl Digest {
    pub fn new<S: Into<String>>(algorithm: DigestType, value: S) -> Self {
        Self {
            algorithm,
            value: value.into(),
        }
    }

    pub fn md5<S: Into<String>>(value: S) -> Self {
        Self::new(DigestType::Md5, value)
    }

    pub fn dandi_etag<S: Into<String>>(value: S) -> Self {
        Self::new(DigestType::DandiEtag, value)
    }

    pub fn zarr_checksum<S: Into<String>>(value: S) -> Self {
        Self::new(DigestType::DandiZarrChecksum, value)
    }

    /// `{algorithm, value}` body used by upload initialization
    pub fn as_request(&self) -> DigestRequest<'_> {
        DigestRequest {
            algorithm: self.algorithm,
            value: &self.value,
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

#[derive(Debug, Serialize)]
pub struct DigestRequest<'a> {
    pub algorithm: DigestType,
    pub value: &'a str,
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.algorithm, &self.value)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DigestVisitor;

        impl<'de> Visitor<'de> for DigestVisitor {
            type Value = Digest;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a single-entry map of digest algorithm to value")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Digest, A::Error> {
                let (algorithm, value) = map
                    .next_entry::<DigestType, String>()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                if map.next_key::<de::IgnoredAny>()?.is_some() {
                    return Err(de::Error::invalid_length(2, &self));
                }
                Ok(Digest { algorithm, value })
            }
        }

        deserializer.deserialize_map(DigestVisitor)
    }
}
