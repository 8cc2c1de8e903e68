//! Contains a common set of types used across all of the `arweave_gateway`
//! modules.
//!
//! This module implements a single location where these types are managed,
//! making them easy to reference and maintain.

#![allow(clippy::assign_op_pattern)]
#![allow(clippy::non_canonical_clone_impl)]
use fixed_hash::construct_fixed_hash;
use serde::{de, de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use std::{ops::Index, slice::SliceIndex, str::FromStr};
use uint::construct_uint;

pub mod block;
pub mod chunk;
pub mod consensus;
/// Decodes hashes from `base64_url` encoded strings
pub mod decode;
pub mod request;

use self::decode::DecodeHash;

pub use block::{PartialBlockHeader, TxHeader, TxOffsetInfo};
pub use chunk::{Chunk, ChunkJson, ChunkMetadata, ChunkSource, ChunkUploadJson, TxBoundary};
pub use request::RequestAttributes;

//==============================================================================
// String to integer type
//------------------------------------------------------------------------------
/// Serializes and deserializes numbers represented as Strings.
pub mod stringify {
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        String::deserialize(deserializer)?
            .parse::<T>()
            .map_err(|e| D::Error::custom(format!("{}", e)))
    }

    pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: std::fmt::Display,
    {
        format!("{}", value).serialize(serializer)
    }
}

//==============================================================================
// Optional<*Hash*> Type
//------------------------------------------------------------------------------
pub mod optional_hash {
    use serde::{self, Deserialize, Deserializer, Serializer};

    use super::{decode::DecodeHash, H256};

    pub fn serialize<S>(value: &Option<H256>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(hash_bytes) => serializer.serialize_str(&base64_url::encode(&hash_bytes.0)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: DecodeHash,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            // Return an instance of T that represents an array of 0's.
            Ok(T::empty())
        } else {
            T::from(s.as_str()).map_err(serde::de::Error::custom)
        }
    }
}

//==============================================================================
// U256 Type
//------------------------------------------------------------------------------
construct_uint! {
    /// 256-bit unsigned integer.
    pub struct U256(4);
}

/// Implement Serialize for U256
impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

/// Implement Deserialize for U256
impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D>(deserializer: D) -> Result<U256, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        U256::from_dec_str(&s).map_err(D::Error::custom)
    }
}

//==============================================================================
// H256 Type
//------------------------------------------------------------------------------

construct_fixed_hash! {
    /// A 256-bit hash type (32 bytes). Transaction ids, data roots and chunk
    /// hashes all use this width.
    pub struct H256(32);
}

impl H256 {
    pub fn to_vec(self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// The external form of an id: base64url, 43 chars, no padding.
    pub fn to_base64_url(self) -> String {
        base64_url::encode(self.as_bytes())
    }
}

// Implement Serialize for H256
impl Serialize for H256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(base64_url::encode(self.as_bytes()).as_str())
    }
}

// Implement Deserialize for H256
impl<'de> Deserialize<'de> for H256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        DecodeHash::from(&s).map_err(D::Error::custom)
    }
}

//==============================================================================
// H384 Type
//------------------------------------------------------------------------------
construct_fixed_hash! {
    /// A 384-bit hash type (48 bytes). Block ids (`indep_hash`) use this width.
    pub struct H384(48);
}

impl H384 {
    pub fn to_vec(self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn to_base64_url(self) -> String {
        base64_url::encode(self.as_bytes())
    }
}

// Implement Serialize for H384
impl Serialize for H384 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(base64_url::encode(self.as_bytes()).as_str())
    }
}

// Implement Deserialize for H384
impl<'de> Deserialize<'de> for H384 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        DecodeHash::from(&s).map_err(D::Error::custom)
    }
}

//==============================================================================
// Base64 Type
//------------------------------------------------------------------------------
/// A struct of [`Vec<u8>`] used for all `base64_url` encoded fields
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Base64(pub Vec<u8>);

impl std::fmt::Display for Base64 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let string = base64_url::encode(&self.0);
        write!(f, "{}", string)
    }
}

/// Converts a base64url encoded string to a Base64 struct.
impl FromStr for Base64 {
    type Err = base64_url::base64::DecodeError;
    fn from_str(str: &str) -> Result<Self, base64_url::base64::DecodeError> {
        let result = base64_url::decode(str)?;
        Ok(Self(result))
    }
}

impl Base64 {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn split_at(&self, mid: usize) -> (&[u8], &[u8]) {
        self.0.split_at(mid)
    }
}

impl From<Vec<u8>> for Base64 {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Serialize for Base64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&format!("{}", &self))
    }
}

impl<'de> Deserialize<'de> for Base64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Vis;
        impl serde::de::Visitor<'_> for Vis {
            type Value = Base64;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a base64 string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                base64_url::decode(v)
                    .map(Base64)
                    .map_err(|_| de::Error::custom("failed to decode base64 string"))
            }
        }
        deserializer.deserialize_str(Vis)
    }
}

//==============================================================================
// H256List Type
//------------------------------------------------------------------------------
/// A struct of [`Vec<H256>`] used for lists of `base64_url` encoded hashes
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct H256List(pub Vec<H256>);

impl H256List {
    pub fn push(&mut self, value: H256) {
        self.0.push(value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, H256> {
        self.0.iter()
    }

    pub fn get(&self, index: usize) -> Option<&<usize as SliceIndex<[H256]>>::Output> {
        self.0.get(index)
    }
}

impl Index<usize> for H256List {
    type Output = H256;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl PartialEq<Vec<H256>> for H256List {
    fn eq(&self, other: &Vec<H256>) -> bool {
        &self.0 == other
    }
}

impl PartialEq<H256List> for Vec<H256> {
    fn eq(&self, other: &H256List) -> bool {
        self == &other.0
    }
}

// Implement Serialize for H256 base64url encoded Array
impl Serialize for H256List {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

// Implement Deserialize for H256 base64url encoded Array
impl<'de> Deserialize<'de> for H256List {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<H256>::deserialize(deserializer).map(H256List)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h256_base64url_round_trip() {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let hash = <H256 as From<[u8; 32]>>::from(bytes);
        let encoded = hash.to_base64_url();
        // 32 bytes -> 43 base64url chars, no padding
        assert_eq!(encoded.len(), 43);
        let decoded: H256 = DecodeHash::from(&encoded).unwrap();
        assert_eq!(decoded, hash);
    }

    #[test]
    fn base64_serde_round_trip() {
        let value = Base64(vec![1, 2, 3, 255]);
        let json = serde_json::to_string(&value).unwrap();
        let back: Base64 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn u256_deserializes_from_decimal_string() {
        let parsed: U256 = serde_json::from_str("\"151066495197430\"").unwrap();
        assert_eq!(parsed, U256::from(151_066_495_197_430u64));
    }
}
