//! Envelope codec: one opaque payload holding a value and its dependency
//!
//! Layout: `FCE1` magic, one flag byte, then the JSON encoded [`Envelope`].
//! Flag `0` means the JSON is stored as is, flag `1` means it is deflated.
//! Anything that does not decode cleanly is treated as foreign data and
//! decodes to `None`, never to an error: the store is not a source of truth.

use std::io::{Read, Write};

use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use serde::{de::DeserializeOwned, ser, Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{dependency::Dependency, CacheError, Result};

const MAGIC: &[u8; 4] = b"FCE1";
const FLAG_PLAIN: u8 = 0;
const FLAG_DEFLATE: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1;

/// A cached value together with the dependency that guards it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<Dependency>,
}

impl Envelope {
    pub fn new(value: Value, dependency: Option<Dependency>) -> Self {
        Self { value, dependency }
    }

    /// Wrap any serializable value.
    ///
    /// Non-finite floats are rejected: JSON has no encoding for them and
    /// they would come back as `null`.
    pub fn wrap<T: Serialize + ?Sized>(value: &T, dependency: Option<Dependency>) -> Result<Self> {
        let serialization = |e: serde_json::Error| CacheError::Serialization {
            message: e.to_string(),
        };
        value.serialize(FiniteFloats).map_err(serialization)?;
        let value = serde_json::to_value(value).map_err(serialization)?;
        Ok(Self::new(value, dependency))
    }

    /// Convert the payload into the requested type, `None` if it does not fit
    pub fn value_as<T: DeserializeOwned>(&self) -> Option<T> {
        T::deserialize(&self.value).ok()
    }
}

type CheckResult = std::result::Result<(), serde_json::Error>;

fn check_float(value: f64) -> CheckResult {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ser::Error::custom(format!(
            "non-finite float {} has no JSON representation",
            value
        )))
    }
}

/// Serializer that only walks a value looking for NaN and infinities
#[derive(Clone, Copy)]
struct FiniteFloats;

macro_rules! accept {
    ($($method:ident($ty:ty)),* $(,)?) => {
        $(fn $method(self, _: $ty) -> CheckResult {
            Ok(())
        })*
    };
}

impl ser::Serializer for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    accept!(
        serialize_bool(bool),
        serialize_i8(i8),
        serialize_i16(i16),
        serialize_i32(i32),
        serialize_i64(i64),
        serialize_i128(i128),
        serialize_u8(u8),
        serialize_u16(u16),
        serialize_u32(u32),
        serialize_u64(u64),
        serialize_u128(u128),
        serialize_char(char),
        serialize_str(&str),
        serialize_bytes(&[u8]),
        serialize_unit_struct(&'static str),
    );

    fn serialize_f32(self, v: f32) -> CheckResult {
        check_float(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> CheckResult {
        check_float(v)
    }

    fn serialize_none(self) -> CheckResult {
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> CheckResult {
        value.serialize(self)
    }

    fn serialize_unit(self) -> CheckResult {
        Ok(())
    }

    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> CheckResult {
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        value: &T,
    ) -> CheckResult {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> CheckResult {
        value.serialize(self)
    }

    fn serialize_seq(self, _: Option<usize>) -> std::result::Result<Self, serde_json::Error> {
        Ok(self)
    }

    fn serialize_tuple(self, _: usize) -> std::result::Result<Self, serde_json::Error> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(self)
    }

    fn serialize_map(self, _: Option<usize>) -> std::result::Result<Self, serde_json::Error> {
        Ok(self)
    }

    fn serialize_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(self)
    }
}

macro_rules! walk_elements {
    ($($trait:ident::$method:ident),* $(,)?) => {
        $(impl ser::$trait for FiniteFloats {
            type Ok = ();
            type Error = serde_json::Error;

            fn $method<T: ?Sized + Serialize>(&mut self, value: &T) -> CheckResult {
                value.serialize(*self)
            }

            fn end(self) -> CheckResult {
                Ok(())
            }
        })*
    };
}

walk_elements!(
    SerializeSeq::serialize_element,
    SerializeTuple::serialize_element,
    SerializeTupleStruct::serialize_field,
    SerializeTupleVariant::serialize_field,
);

impl ser::SerializeMap for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> CheckResult {
        key.serialize(*self)
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> CheckResult {
        value.serialize(*self)
    }

    fn end(self) -> CheckResult {
        Ok(())
    }
}

macro_rules! walk_fields {
    ($($trait:ident),* $(,)?) => {
        $(impl ser::$trait for FiniteFloats {
            type Ok = ();
            type Error = serde_json::Error;

            fn serialize_field<T: ?Sized + Serialize>(
                &mut self,
                _: &'static str,
                value: &T,
            ) -> CheckResult {
                value.serialize(*self)
            }

            fn end(self) -> CheckResult {
                Ok(())
            }
        })*
    };
}

walk_fields!(SerializeStruct, SerializeStructVariant);

/// Packs and unpacks envelopes, optionally compressing large payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec {
    compression_threshold: Option<usize>,
}

impl EnvelopeCodec {
    /// Codec that never compresses
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec that deflates JSON bodies larger than `threshold` bytes
    pub fn with_compression_threshold(threshold: usize) -> Self {
        Self {
            compression_threshold: Some(threshold),
        }
    }

    pub fn pack(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(envelope).map_err(|e| CacheError::Serialization {
            message: e.to_string(),
        })?;

        let compress = self
            .compression_threshold
            .is_some_and(|threshold| json.len() > threshold);

        let mut out = Vec::with_capacity(HEADER_LEN + json.len());
        out.extend_from_slice(MAGIC);
        if compress {
            out.push(FLAG_DEFLATE);
            let mut encoder = DeflateEncoder::new(out, Compression::default());
            encoder.write_all(&json)?;
            Ok(encoder.finish()?)
        } else {
            out.push(FLAG_PLAIN);
            out.extend_from_slice(&json);
            Ok(out)
        }
    }

    /// Decode a payload; malformed or foreign bytes yield `None`
    pub fn unpack(&self, bytes: &[u8]) -> Option<Envelope> {
        if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
            debug!("Discarding payload without envelope header");
            return None;
        }

        let body = &bytes[HEADER_LEN..];
        let decoded = match bytes[MAGIC.len()] {
            FLAG_PLAIN => serde_json::from_slice(body),
            FLAG_DEFLATE => {
                let mut json = Vec::new();
                if let Err(e) = DeflateDecoder::new(body).read_to_end(&mut json) {
                    debug!("Discarding payload with corrupt deflate stream: {}", e);
                    return None;
                }
                serde_json::from_slice(&json)
            }
            flag => {
                debug!("Discarding payload with unknown envelope flag {}", flag);
                return None;
            }
        };

        match decoded {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                debug!("Discarding malformed envelope: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_round_trip_without_dependency() {
        let codec = EnvelopeCodec::new();
        let envelope = Envelope::new(json!({"name": "widget", "tags": [1, 2, 3]}), None);

        let bytes = codec.pack(&envelope).unwrap();
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(codec.unpack(&bytes), Some(envelope));
    }

    #[test]
    fn test_round_trip_with_dependency() {
        let codec = EnvelopeCodec::new();
        let dependency = Dependency::chain(vec![
            Dependency::global_state("deploy_version"),
            Dependency::file("/etc/hosts"),
        ]);
        let envelope = Envelope::new(json!("value"), Some(dependency));

        let bytes = codec.pack(&envelope).unwrap();
        assert_eq!(codec.unpack(&bytes), Some(envelope));
    }

    #[test]
    fn test_large_payloads_are_compressed() {
        let codec = EnvelopeCodec::with_compression_threshold(64);
        let envelope = Envelope::new(json!("a".repeat(4096)), None);

        let bytes = codec.pack(&envelope).unwrap();
        assert_eq!(bytes[4], FLAG_DEFLATE);
        assert!(bytes.len() < 4096);
        assert_eq!(codec.unpack(&bytes), Some(envelope.clone()));

        // A codec without a threshold still reads compressed payloads
        assert_eq!(EnvelopeCodec::new().unpack(&bytes), Some(envelope));
    }

    #[test]
    fn test_corrupted_bytes_are_a_miss() {
        let codec = EnvelopeCodec::new();
        let mut bytes = codec.pack(&Envelope::new(json!([1, 2]), None)).unwrap();

        assert_eq!(codec.unpack(&[]), None);
        assert_eq!(codec.unpack(b"FCE"), None);
        assert_eq!(codec.unpack(b"a:2:{i:0;s:1:\"x\";}"), None);

        let last = bytes.len() - 1;
        bytes[last] = b'{';
        assert_eq!(codec.unpack(&bytes), None);

        bytes[4] = 9;
        assert_eq!(codec.unpack(&bytes), None);

        let mut garbage = MAGIC.to_vec();
        garbage.extend_from_slice(&[FLAG_DEFLATE, 0xff, 0x00, 0x13]);
        assert_eq!(codec.unpack(&garbage), None);
    }

    #[test]
    fn test_non_finite_floats_are_rejected() {
        #[derive(Serialize)]
        struct Reading {
            sensor: &'static str,
            samples: Vec<Option<f32>>,
        }

        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                Envelope::wrap(&value, None),
                Err(CacheError::Serialization { .. })
            ));
        }
        let reading = Reading {
            sensor: "t1",
            samples: vec![Some(1.5), None, Some(f32::NAN)],
        };
        assert!(Envelope::wrap(&reading, None).is_err());

        let mut by_name = std::collections::BTreeMap::new();
        by_name.insert("ok", (1.0f64, -0.0f64));
        by_name.insert("bad", (2.0, f64::INFINITY));
        assert!(Envelope::wrap(&by_name, None).is_err());

        let envelope = Envelope::wrap(&vec![0.1f64, -2.5e300], None).unwrap();
        assert_eq!(envelope.value_as::<Vec<f64>>(), Some(vec![0.1, -2.5e300]));
    }

    #[test]
    fn test_value_as_mismatched_type() {
        let envelope = Envelope::wrap(&vec![1, 2, 3], None).unwrap();
        assert_eq!(envelope.value_as::<Vec<u32>>(), Some(vec![1, 2, 3]));
        assert_eq!(envelope.value_as::<String>(), None);
    }
}
