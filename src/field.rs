//! Field values.
//!
//! Every column cell is an element of the BLS12-381 scalar field. The engine
//! treats it opaquely: addition, multiplication, inversion and equality come
//! from `ark-ff`; this module only adds conversions the engine needs.

use ark_ff::{BigInteger, PrimeField};
use num_bigint::BigUint;
use num_traits::ToPrimitive;

pub use ark_bls12_381::Fr;

/// Builds a field element from a signed integer.
pub fn fe(value: i64) -> Fr {
    Fr::from(value)
}

/// Decodes a field element into a `usize` if its canonical value fits.
pub fn to_usize(value: &Fr) -> Option<usize> {
    BigUint::from(value.into_bigint()).to_usize()
}

/// Renders a field element as a decimal, using a leading `-` for values in
/// the upper half of the field so that `-1` does not print as `p - 1`.
pub fn to_signed_string(value: &Fr) -> String {
    if value.into_bigint() > Fr::MODULUS_MINUS_ONE_DIV_TWO {
        format!("-{}", BigUint::from((-*value).into_bigint()))
    } else {
        BigUint::from(value.into_bigint()).to_string()
    }
}

/// Parses a (possibly negative) decimal into a field element.
pub fn parse_signed(text: &str) -> Option<Fr> {
    let (negative, digits) = match text.trim().strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.trim()),
    };
    let magnitude = Fr::from(digits.parse::<BigUint>().ok()?);
    Some(if negative { -magnitude } else { magnitude })
}

/// Canonical little-endian bytes, used when hashing traces.
pub fn to_bytes(value: &Fr) -> Vec<u8> {
    value.into_bigint().to_bytes_le()
}

/// Serde adapter storing field elements as signed decimal strings.
pub mod serde_fr {
    use super::{Fr, parse_signed, to_signed_string};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Fr, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&to_signed_string(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Fr, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_signed(&text).ok_or_else(|| D::Error::custom(format!("invalid field element `{text}`")))
    }
}

/// Serde adapter for sequences of field elements.
pub mod serde_fr_vec {
    use super::{Fr, parse_signed, to_signed_string};
    use serde::de::Error;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[Fr], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            seq.serialize_element(&to_signed_string(value))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Fr>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|text| {
                parse_signed(text)
                    .ok_or_else(|| D::Error::custom(format!("invalid field element `{text}`")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_ff::{AdditiveGroup, Field};
    use proptest::prelude::*;

    #[test]
    fn test_negative_rendering() {
        assert_eq!(to_signed_string(&fe(-1)), "-1");
        assert_eq!(to_signed_string(&fe(42)), "42");
        assert_eq!(to_signed_string(&Fr::ZERO), "0");
    }

    #[test]
    fn test_usize_decoding() {
        assert_eq!(to_usize(&fe(17)), Some(17));
        assert_eq!(to_usize(&fe(-1)), None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_signed("twelve").is_none());
        assert_eq!(parse_signed(" -3 "), Some(fe(-3)));
    }

    proptest! {
        #[test]
        fn signed_text_parses_back(value in any::<i64>()) {
            let element = fe(value);
            prop_assert_eq!(parse_signed(&to_signed_string(&element)), Some(element));
        }

        #[test]
        fn nonzero_values_invert(value in 1u64..) {
            let element = Fr::from(value);
            prop_assert_eq!(element * element.inverse().unwrap(), Fr::ONE);
        }
    }
}
