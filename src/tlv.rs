//! BER-TLV codec.
//!
//! Tags are kept as their raw encoded bytes (`0x87`, `0x5F1F`, `0x7F61`),
//! which is how ICAO 9303 and ISO/IEC 7816-4 name them. Parsed trees own
//! copies of their values, so a [`Tlv`] never borrows the input buffer.
//! [`split_object`] is the borrowing counterpart for callers that need the
//! exact bytes as received, e.g. to compute a MAC over them.

use core::{fmt, mem};
use tracing::error;

use crate::BacError;

/// Deepest nesting of constructed objects accepted by [`Tlv::parse`].
pub const MAX_DEPTH: usize = 32;

/// Maximum number of bytes in an encoded tag.
pub const MAX_TAG_LEN: usize = 4;

/// Tag class, bits 8 and 7 of the first tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Universal,
    Application,
    Context,
    Private,
}

/// A BER tag holding its encoded bytes, big-endian, in a `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u32);

impl Tag {
    /// Tag of the secure messaging object carrying padded, encrypted data.
    pub const SM_ENCRYPTED: Self = Self(0x87);
    /// Tag of the secure messaging object carrying encrypted data without
    /// padding indicator, used for odd instruction bytes.
    pub const SM_ENCRYPTED_ODD: Self = Self(0x85);
    /// Tag of the protected Le.
    pub const SM_LE: Self = Self(0x97);
    /// Tag of the protected status word.
    pub const SM_STATUS: Self = Self(0x99);
    /// Tag of the cryptographic checksum.
    pub const SM_MAC: Self = Self(0x8E);

    /// Wraps already encoded tag bytes, e.g. `Tag::new(0x5F1F)`.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Builds the shortest encoding of a tag from its parts.
    ///
    /// # Errors
    ///
    /// * `BacError` if `number` does not fit in three subsequent bytes.
    ///
    /// # Example
    ///
    /// ```
    /// # use mrtd_bac::BacError;
    /// #
    /// # fn main() -> Result<(), BacError> {
    /// use mrtd_bac::tlv::{Class, Tag};
    ///
    /// assert_eq!(Tag::from_parts(Class::Application, false, 0x1F)?, Tag::new(0x5F1F));
    /// assert_eq!(Tag::from_parts(Class::Application, true, 0x61)?, Tag::new(0x7F61));
    /// assert_eq!(Tag::from_parts(Class::Context, false, 7)?, Tag::new(0x87));
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn from_parts(class: Class, constructed: bool, number: u32) -> Result<Self, BacError> {
        let mut first: u32 = match class {
            Class::Universal => 0x00,
            Class::Application => 0x40,
            Class::Context => 0x80,
            Class::Private => 0xC0,
        };
        if constructed {
            first |= 0x20;
        }

        if number < 0x1F {
            return Ok(Self(first | number));
        }
        if number >= 1 << 21 {
            error!("Tag number {number} does not fit in {MAX_TAG_LEN} bytes");
            return Err(BacError::ParseTlvTagError(format!(
                "tag number {number} does not fit in {MAX_TAG_LEN} bytes"
            )));
        }

        let mut raw = first | 0x1F;
        let groups = if number < 1 << 7 {
            1
        } else if number < 1 << 14 {
            2
        } else {
            3
        };
        for group in (0..groups).rev() {
            let continuation = if group == 0 { 0x00 } else { 0x80 };
            raw = (raw << 8) | continuation | ((number >> (7 * group)) & 0x7F);
        }
        Ok(Self(raw))
    }

    /// The encoded tag bytes as an integer.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Number of bytes of the encoded tag.
    #[must_use]
    pub const fn encoded_len(self) -> usize {
        if self.0 > 0x00FF_FFFF {
            4
        } else if self.0 > 0xFFFF {
            3
        } else if self.0 > 0xFF {
            2
        } else {
            1
        }
    }

    /// Encoded tag bytes.
    #[must_use]
    pub fn to_bytes(self) -> Vec<u8> {
        self.0.to_be_bytes()[MAX_TAG_LEN - self.encoded_len()..].to_vec()
    }

    fn first_byte(self) -> u8 {
        self.0.to_be_bytes()[MAX_TAG_LEN - self.encoded_len()]
    }

    #[must_use]
    pub fn class(self) -> Class {
        match self.first_byte() >> 6 {
            0 => Class::Universal,
            1 => Class::Application,
            2 => Class::Context,
            _ => Class::Private,
        }
    }

    #[must_use]
    pub fn is_constructed(self) -> bool {
        self.first_byte() & 0x20 != 0
    }

    /// Tag number with class and construction bits removed.
    #[must_use]
    pub fn number(self) -> u32 {
        let first = self.first_byte();
        if first & 0x1F != 0x1F {
            return u32::from(first & 0x1F);
        }
        self.to_bytes()[1..]
            .iter()
            .fold(0, |acc, &b| (acc << 7) | u32::from(b & 0x7F))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:0width$X}", self.0, width = self.encoded_len() * 2)
    }
}

/// Reads a tag from the start of `data`.
///
/// # Returns
///
/// The tag and the number of bytes it occupies.
///
/// # Errors
///
/// * `BacError` if the tag is truncated, longer than four bytes or has a
///   leading zero continuation byte.
pub fn read_tag(data: &[u8]) -> Result<(Tag, usize), BacError> {
    let Some(&first) = data.first() else {
        error!("Can not read a tag from empty data");
        return Err(BacError::ParseTlvDataError(1, 0));
    };

    let mut raw = u32::from(first);
    let mut consumed = 1;
    if first & 0x1F == 0x1F {
        loop {
            if consumed == MAX_TAG_LEN {
                error!("Tag starting with {first:02X} is longer than {MAX_TAG_LEN} bytes");
                return Err(BacError::ParseTlvTagError(format!(
                    "tag starting with {first:02X} is longer than {MAX_TAG_LEN} bytes"
                )));
            }
            let Some(&byte) = data.get(consumed) else {
                error!("Tag starting with {first:02X} is truncated");
                return Err(BacError::ParseTlvDataError(consumed + 1, data.len()));
            };
            if consumed == 1 && byte == 0x80 {
                error!("Tag starting with {first:02X} has a leading zero continuation byte");
                return Err(BacError::ParseTlvTagError(format!(
                    "tag {first:02X}80 is not minimally encoded"
                )));
            }
            raw = (raw << 8) | u32::from(byte);
            consumed += 1;
            if byte & 0x80 == 0 {
                break;
            }
        }
    }
    Ok((Tag(raw), consumed))
}

/// Reads a length field from the start of `data`.
///
/// Short form lengths (up to 127) use one byte. Long form lengths start with
/// `0x80 | n` followed by `n` big-endian length bytes.
///
/// # Returns
///
/// The number of bytes the length field occupies and the length value.
///
/// # Errors
///
/// * `BacError::IndefiniteLengthError` for the indefinite form `0x80`.
/// * `BacError` if the field is truncated or does not fit in a `usize`.
///
/// # Example
///
/// ```
/// # use mrtd_bac::BacError;
/// #
/// # fn main() -> Result<(), BacError> {
/// use hex_literal::hex;
/// use mrtd_bac::tlv::read_length;
///
/// assert_eq!(read_length(&hex!("2A"))?, (1, 42));
/// assert_eq!(read_length(&hex!("8207E8"))?, (3, 2024));
/// #
/// #     Ok(())
/// # }
/// ```
pub fn read_length(data: &[u8]) -> Result<(usize, usize), BacError> {
    let Some(&first) = data.first() else {
        error!("Can not read a length from empty data");
        return Err(BacError::ParseTlvDataError(1, 0));
    };

    if first & 0x80 == 0 {
        return Ok((1, usize::from(first)));
    }

    let length_of_length = usize::from(first & 0x7F);
    if length_of_length == 0 {
        error!("Indefinite length encountered");
        return Err(BacError::IndefiniteLengthError());
    }
    if length_of_length > mem::size_of::<usize>() {
        error!("Length field with {length_of_length} bytes does not fit in usize");
        return Err(BacError::ParseDataError(format!(
            "length field with {length_of_length} bytes does not fit in usize"
        )));
    }
    if data.len() < 1 + length_of_length {
        error!(
            "Length field is truncated, `data.len()`: `{}` is less than `{}`",
            data.len(),
            1 + length_of_length
        );
        return Err(BacError::ParseTlvDataError(1 + length_of_length, data.len()));
    }

    let mut buf = [0_u8; mem::size_of::<usize>()];
    buf[mem::size_of::<usize>() - length_of_length..]
        .copy_from_slice(&data[1..=length_of_length]);

    Ok((1 + length_of_length, usize::from_be_bytes(buf)))
}

/// Encodes a length field in its shortest form.
///
/// # Example
///
/// ```
/// use hex_literal::hex;
/// use mrtd_bac::tlv::encode_length;
///
/// assert_eq!(encode_length(0), hex!("00"));
/// assert_eq!(encode_length(127), hex!("7F"));
/// assert_eq!(encode_length(128), hex!("8180"));
/// assert_eq!(encode_length(2024), hex!("8207E8"));
/// assert_eq!(encode_length(65536), hex!("83010000"));
/// ```
#[must_use]
pub fn encode_length(length: usize) -> Vec<u8> {
    let bytes = length.to_be_bytes();
    if length < 0x80 {
        return vec![bytes[bytes.len() - 1]];
    }

    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    // At most size_of::<usize>() bytes follow.
    let count = (bytes.len() - skip) as u8;
    let mut encoded = Vec::with_capacity(1 + bytes.len() - skip);
    encoded.push(0x80 | count);
    encoded.extend_from_slice(&bytes[skip..]);
    encoded
}

/// One TLV object borrowed from a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvRef<'a> {
    pub tag: Tag,
    /// Tag, length and value exactly as encoded.
    pub raw: &'a [u8],
    pub value: &'a [u8],
}

/// Splits the first TLV object off `data`.
///
/// # Returns
///
/// The object and the bytes following it.
///
/// # Errors
///
/// * `BacError` if the tag or length is malformed or the value is truncated.
///
/// # Example
///
/// ```
/// # use mrtd_bac::BacError;
/// #
/// # fn main() -> Result<(), BacError> {
/// use hex_literal::hex;
/// use mrtd_bac::tlv::{split_object, Tag};
///
/// let (object, rest) = split_object(&hex!("99029000 8E08FA855A5D4C50A8ED"))?;
/// assert_eq!(object.tag, Tag::SM_STATUS);
/// assert_eq!(object.value, hex!("9000"));
/// assert_eq!(rest.len(), 10);
/// #
/// #     Ok(())
/// # }
/// ```
pub fn split_object(data: &[u8]) -> Result<(TlvRef<'_>, &[u8]), BacError> {
    let (tag, tag_len) = read_tag(data)?;
    let (length_len, value_len) = read_length(&data[tag_len..])?;
    let header_len = tag_len + length_len;

    let Some(total) = header_len.checked_add(value_len) else {
        error!("TLV value length {value_len} overflows");
        return Err(BacError::ParseTlvDataError(usize::MAX, data.len()));
    };
    if data.len() < total {
        error!(
            "TLV object {tag} is truncated, expected {total} bytes, found {}",
            data.len()
        );
        return Err(BacError::ParseTlvDataError(total, data.len()));
    }

    Ok((
        TlvRef {
            tag,
            raw: &data[..total],
            value: &data[header_len..total],
        },
        &data[total..],
    ))
}

/// Value of a [`Tlv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvValue {
    Primitive(Vec<u8>),
    Constructed(Vec<Tlv>),
}

/// An owned BER-TLV object. Constructed objects own their children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    tag: Tag,
    value: TlvValue,
}

impl Tlv {
    /// Creates a primitive object.
    ///
    /// # Errors
    ///
    /// * `BacError` if `tag` has the constructed bit set.
    pub fn primitive(tag: Tag, value: impl Into<Vec<u8>>) -> Result<Self, BacError> {
        if tag.is_constructed() {
            error!("Tag {tag} is constructed, can not hold a primitive value");
            return Err(BacError::InvalidArgument(
                "Primitive TLV object needs a primitive tag",
            ));
        }
        Ok(Self {
            tag,
            value: TlvValue::Primitive(value.into()),
        })
    }

    /// Creates a constructed object.
    ///
    /// # Errors
    ///
    /// * `BacError` if `tag` does not have the constructed bit set.
    pub fn constructed(tag: Tag, children: Vec<Tlv>) -> Result<Self, BacError> {
        if !tag.is_constructed() {
            error!("Tag {tag} is primitive, can not hold children");
            return Err(BacError::InvalidArgument(
                "Constructed TLV object needs a constructed tag",
            ));
        }
        Ok(Self {
            tag,
            value: TlvValue::Constructed(children),
        })
    }

    #[must_use]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    #[must_use]
    pub fn value(&self) -> &TlvValue {
        &self.value
    }

    /// Children of a constructed object, empty for a primitive one.
    #[must_use]
    pub fn children(&self) -> &[Tlv] {
        match self.value {
            TlvValue::Primitive(_) => &[],
            TlvValue::Constructed(ref children) => children,
        }
    }

    /// First direct child with the given tag.
    #[must_use]
    pub fn find(&self, tag: Tag) -> Option<&Tlv> {
        self.children().iter().find(|child| child.tag == tag)
    }

    /// Parses exactly one object spanning all of `data`.
    ///
    /// # Errors
    ///
    /// * `BacError` if `data` is malformed or has trailing bytes.
    ///
    /// # Example
    ///
    /// ```
    /// # use mrtd_bac::BacError;
    /// #
    /// # fn main() -> Result<(), BacError> {
    /// use hex_literal::hex;
    /// use mrtd_bac::tlv::{Tag, Tlv};
    ///
    /// let ef_com = hex!("60145F0104303130365F36063034303030305C026175");
    /// let tlv = Tlv::parse(&ef_com)?;
    /// assert_eq!(tlv.tag(), Tag::new(0x60));
    /// assert_eq!(tlv.children().len(), 3);
    /// assert_eq!(tlv.find(Tag::new(0x5C)).map(Tlv::value_bytes), Some(b"au".to_vec()));
    /// assert_eq!(tlv.encode(), ef_com);
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn parse(data: &[u8]) -> Result<Self, BacError> {
        let (tlv, rest) = Self::parse_one(data, 0)?;
        if !rest.is_empty() {
            error!("{} trailing bytes after TLV object {}", rest.len(), tlv.tag);
            return Err(BacError::ParseDataError(format!(
                "{} trailing bytes after TLV object {}",
                rest.len(),
                tlv.tag
            )));
        }
        Ok(tlv)
    }

    /// Parses a sequence of sibling objects spanning all of `data`.
    ///
    /// # Errors
    ///
    /// * `BacError` if any object is malformed.
    pub fn parse_all(data: &[u8]) -> Result<Vec<Self>, BacError> {
        Self::parse_siblings(data, 0)
    }

    fn parse_siblings(mut data: &[u8], depth: usize) -> Result<Vec<Self>, BacError> {
        let mut siblings = Vec::new();
        while !data.is_empty() {
            let (tlv, rest) = Self::parse_one(data, depth)?;
            siblings.push(tlv);
            data = rest;
        }
        Ok(siblings)
    }

    fn parse_one(data: &[u8], depth: usize) -> Result<(Self, &[u8]), BacError> {
        if depth >= MAX_DEPTH {
            error!("TLV nesting exceeds {MAX_DEPTH} levels");
            return Err(BacError::TlvNestingError(MAX_DEPTH));
        }

        let (object, rest) = split_object(data)?;
        let value = if object.tag.is_constructed() {
            TlvValue::Constructed(Self::parse_siblings(object.value, depth + 1)?)
        } else {
            TlvValue::Primitive(object.value.to_vec())
        };
        Ok((
            Self {
                tag: object.tag,
                value,
            },
            rest,
        ))
    }

    /// Encoded value, i.e. the concatenated encodings of all children for a
    /// constructed object.
    #[must_use]
    pub fn value_bytes(&self) -> Vec<u8> {
        match self.value {
            TlvValue::Primitive(ref value) => value.clone(),
            TlvValue::Constructed(ref children) => {
                children.iter().flat_map(Tlv::encode).collect()
            }
        }
    }

    /// Encodes the object with minimal length fields.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let value = self.value_bytes();
        let mut encoded = self.tag.to_bytes();
        encoded.extend(encode_length(value.len()));
        encoded.extend(value);
        encoded
    }
}
