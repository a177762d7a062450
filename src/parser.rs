//! Deserialize data from the Kafka wire format.
use bytes::Bytes;
use nom::{
    IResult,
    bytes::complete::take,
    multi::many_m_n,
    number::complete::{be_i16, be_i32, be_u16},
};
use nombytes::NomBytes;

use crate::constants::MAX_PROTOCOL_ARRAY_SIZE;

pub type NomError = nom::Err<nom::error::Error<NomBytes>>;

/// Convert bytes to a validated UTF-8 string.
pub fn bytes_to_string(bytes: &Bytes) -> Result<String, NomError> {
    std::str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(|_| {
            nom::Err::Failure(nom::error::Error::new(
                NomBytes::from(bytes.as_ref()),
                nom::error::ErrorKind::Verify,
            ))
        })
}

/// Convert optional bytes to a validated UTF-8 string.
pub fn bytes_to_string_opt(bytes: Option<Bytes>) -> Result<Option<String>, NomError> {
    match bytes {
        Some(b) => bytes_to_string(&b).map(Some),
        None => Ok(None),
    }
}

/// STRING: u16 length followed by the bytes.
pub fn parse_string(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_u16(s)?;
    let (s, string) = take(length)(s)?;
    Ok((s, string.into_bytes()))
}

/// A STRING decoded into an owned, UTF-8 checked `String`.
pub fn parse_utf8_string(s: NomBytes) -> IResult<NomBytes, String> {
    let (s, raw) = parse_string(s)?;
    let string = bytes_to_string(&raw)?;
    Ok((s, string))
}

pub fn parse_array<O, E, F>(f: F) -> impl FnMut(NomBytes) -> IResult<NomBytes, Vec<O>, E>
where
    F: nom::Parser<NomBytes, O, E> + Copy,
    E: nom::error::ParseError<NomBytes>,
{
    move |input: NomBytes| {
        let (i, length) = be_i32(input)?;

        if length == -1 {
            return Ok((i, vec![]));
        }

        if !(0..=MAX_PROTOCOL_ARRAY_SIZE).contains(&length) {
            return Err(nom::Err::Failure(E::from_error_kind(
                i,
                nom::error::ErrorKind::TooLarge,
            )));
        }

        many_m_n(length as usize, length as usize, f)(i)
    }
}

pub fn parse_nullable_string(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = be_i16(s)?;

    if length == -1 {
        return Ok((s, None));
    }

    if length < 0 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::TooLarge,
        )));
    }

    let (s, string) = take(length as u16)(s)?;
    Ok((s, Some(string.into_bytes())))
}


#[cfg(test)]
mod tests {
    use super::*;
    use nom::number::complete::be_i32;

    fn input(data: Vec<u8>) -> NomBytes {
        NomBytes::new(Bytes::from(data))
    }

    #[test]
    fn test_bytes_to_string_invalid_utf8() {
        let bytes = Bytes::from(vec![0xff, 0xfe]);
        assert!(bytes_to_string(&bytes).is_err());
        assert_eq!(bytes_to_string_opt(None).unwrap(), None);
    }

    #[test]
    fn test_parse_string() {
        let mut data = Vec::new();
        data.extend_from_slice(&5u16.to_be_bytes());
        data.extend_from_slice(b"hello");
        data.extend_from_slice(b"extra");

        let (remaining, parsed) = parse_string(input(data)).unwrap();
        assert_eq!(parsed, Bytes::from("hello"));
        assert_eq!(remaining.into_bytes(), Bytes::from("extra"));
    }

    #[test]
    fn test_parse_utf8_string_rejects_garbage() {
        let mut data = Vec::new();
        data.extend_from_slice(&2u16.to_be_bytes());
        data.extend_from_slice(&[0xc3, 0x28]);
        assert!(parse_utf8_string(input(data)).is_err());
    }

    #[test]
    fn test_parse_nullable_string() {
        let (_, parsed) = parse_nullable_string(input((-1i16).to_be_bytes().to_vec())).unwrap();
        assert_eq!(parsed, None);

        let mut data = Vec::new();
        data.extend_from_slice(&4i16.to_be_bytes());
        data.extend_from_slice(b"test");
        let (_, parsed) = parse_nullable_string(input(data)).unwrap();
        assert_eq!(parsed, Some(Bytes::from("test")));

        assert!(parse_nullable_string(input((-2i16).to_be_bytes().to_vec())).is_err());
    }

    #[test]
    fn test_parse_array() {
        let mut data = Vec::new();
        data.extend_from_slice(&3i32.to_be_bytes());
        data.extend_from_slice(&10i32.to_be_bytes());
        data.extend_from_slice(&20i32.to_be_bytes());
        data.extend_from_slice(&30i32.to_be_bytes());

        let mut parser = parse_array(be_i32::<_, nom::error::Error<NomBytes>>);
        let (_, parsed): (_, Vec<i32>) = parser(input(data)).unwrap();
        assert_eq!(parsed, vec![10, 20, 30]);
    }

    #[test]
    fn test_parse_array_null_is_empty() {
        let mut parser = parse_array(be_i32::<_, nom::error::Error<NomBytes>>);
        let (_, parsed): (_, Vec<i32>) = parser(input((-1i32).to_be_bytes().to_vec())).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_parse_array_too_large() {
        let data = (MAX_PROTOCOL_ARRAY_SIZE + 1).to_be_bytes().to_vec();
        let mut parser = parse_array(be_i32::<_, nom::error::Error<NomBytes>>);
        let result: IResult<_, Vec<i32>, nom::error::Error<NomBytes>> = parser(input(data));
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_array_truncated() {
        let mut data = Vec::new();
        data.extend_from_slice(&2i32.to_be_bytes());
        data.extend_from_slice(&10i32.to_be_bytes());
        let mut parser = parse_array(be_i32::<_, nom::error::Error<NomBytes>>);
        let result: IResult<_, Vec<i32>, nom::error::Error<NomBytes>> = parser(input(data));
        assert!(result.is_err());
    }
}
