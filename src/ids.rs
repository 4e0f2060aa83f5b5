// Opaque identifiers for catalog entities
//
// External callers never see raw integer ids. Instead every entity is
// addressed by base64("<TypeName>#<id>"), which makes ids self-describing
// and lets us reject lookups that use an id of the wrong type.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

/// A catalog entity that can be addressed by an opaque id.
///
/// `TYPE_NAME` is the tag baked into encoded ids; it never changes once
/// published.
pub trait Entity {
    const TYPE_NAME: &'static str;

    fn id(&self) -> i64;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("the ID isn't valid base64")]
    InvalidEncoding,
    #[error("the ID must look like \"<type>#<number>\"")]
    InvalidFormat,
    #[error("expected a {expected}, but this ID is for a {actual}")]
    WrongType {
        expected: &'static str,
        actual: String,
    },
}

/// Encode an entity's id as an opaque string.
pub fn encode<T: Entity>(entity: &T) -> String {
    encode_raw::<T>(entity.id())
}

/// Encode a bare numeric id for entity type `T` (used for page cursors).
pub fn encode_raw<T: Entity>(id: i64) -> String {
    STANDARD.encode(format!("{}#{}", T::TYPE_NAME, id))
}

/// Decode an opaque id, checking that it addresses an entity of type `T`.
pub fn decode<T: Entity>(encoded: &str) -> Result<i64, IdError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|_| IdError::InvalidEncoding)?;
    let decoded = String::from_utf8(bytes).map_err(|_| IdError::InvalidEncoding)?;

    let (type_name, raw_id) = decoded.split_once('#').ok_or(IdError::InvalidFormat)?;

    if type_name != T::TYPE_NAME {
        return Err(IdError::WrongType {
            expected: T::TYPE_NAME,
            actual: type_name.to_string(),
        });
    }

    raw_id.parse().map_err(|_| IdError::InvalidFormat)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        id: i64,
    }

    impl Entity for Dummy {
        const TYPE_NAME: &'static str = "Dummy";

        fn id(&self) -> i64 {
            self.id
        }
    }

    struct Other {
        id: i64,
    }

    impl Entity for Other {
        const TYPE_NAME: &'static str = "Other";

        fn id(&self) -> i64 {
            self.id
        }
    }

    #[test]
    fn round_trip() {
        let dummy = Dummy { id: 42 };
        let encoded = encode(&dummy);
        assert_eq!(decode::<Dummy>(&encoded), Ok(42));
    }

    #[test]
    fn encoded_form_is_base64_of_tag_and_id() {
        let encoded = encode(&Dummy { id: 7 });
        assert_eq!(
            STANDARD.decode(&encoded).unwrap(),
            b"Dummy#7".to_vec(),
        );
    }

    #[test]
    fn decoding_with_the_wrong_type_fails() {
        let encoded = encode(&Dummy { id: 1 });
        assert_eq!(
            decode::<Other>(&encoded),
            Err(IdError::WrongType {
                expected: "Other",
                actual: "Dummy".to_string(),
            }),
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(decode::<Dummy>("not base64!!"), Err(IdError::InvalidEncoding));

        let no_separator = STANDARD.encode("Dummy42");
        assert_eq!(decode::<Dummy>(&no_separator), Err(IdError::InvalidFormat));

        let bad_number = STANDARD.encode("Dummy#twelve");
        assert_eq!(decode::<Dummy>(&bad_number), Err(IdError::InvalidFormat));
    }
}
