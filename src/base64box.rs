use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::{alphabet, Engine as _};
use lazy_static::lazy_static;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

lazy_static! {
    // Media payloads arrive padded from some platforms and unpadded from others.
    static ref ENGINE: GeneralPurpose = GeneralPurpose::new(
        &alphabet::STANDARD,
        GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
    );
}

/// Raw audio bytes carried as a base64 string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Base64Box(pub Vec<u8>);

impl Base64Box {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl Serialize for Base64Box {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&ENGINE.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Base64Box {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Vis;
        impl serde::de::Visitor<'_> for Vis {
            type Value = Base64Box;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a base64 encoded audio payload")
            }

            fn visit_str<E: Error>(self, v: &str) -> Result<Self::Value, E> {
                ENGINE.decode(v.trim()).map(Base64Box).map_err(Error::custom)
            }
        }
        deserializer.deserialize_str(Vis)
    }
}
