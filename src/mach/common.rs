use super::memory::Memory;
use super::ty::Ty;
use super::val::Val;
use super::var::Variable;
use crate::error;
use crate::lang::Error;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::rc::Rc;

type Result<T> = std::result::Result<T, Error>;

/// ## COMMON transfer
///
/// CHAIN hands a successor program the values of every COMMON
/// variable as serialized byte buffers, matched by declaration order
/// rather than by name. The whole set travels in a CRC-protected
/// envelope so a corrupted hand-off fails instead of loading garbage.

#[derive(Clone, Copy, Debug, PartialEq)]
enum Tag {
    Integer = 0,
    Long = 1,
    Single = 2,
    Double = 3,
    Str = 4,
}

impl Tag {
    fn of(ty: &Ty) -> Result<Tag> {
        match ty {
            Ty::Integer => Ok(Tag::Integer),
            Ty::Long => Ok(Tag::Long),
            Ty::Single => Ok(Tag::Single),
            Ty::Double => Ok(Tag::Double),
            Ty::String | Ty::FixedString(_) => Ok(Tag::Str),
            _ => Err(error!(TypeMismatch; "COMMON carries scalars and arrays only")),
        }
    }

    fn from_byte(byte: u8) -> Result<Tag> {
        match byte {
            0 => Ok(Tag::Integer),
            1 => Ok(Tag::Long),
            2 => Ok(Tag::Single),
            3 => Ok(Tag::Double),
            4 => Ok(Tag::Str),
            _ => Err(error!(TypeMismatch; "Unknown COMMON value tag")),
        }
    }
}

/// One transferred variable: its element type, array bounds when the
/// variable is an array, and the raw element bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct CommonValue {
    tag: u8,
    bounds: Option<Vec<(i32, i32)>>,
    bytes: Vec<u8>,
}

#[derive(Default)]
pub struct CommonBlock {
    declared: Vec<Rc<Variable>>,
    incoming: VecDeque<CommonValue>,
}

impl CommonBlock {
    pub fn new() -> CommonBlock {
        CommonBlock::default()
    }

    /// Start a successor program from a predecessor's envelope.
    pub fn from_envelope(bytes: &[u8]) -> Result<CommonBlock> {
        Ok(CommonBlock {
            declared: vec![],
            incoming: decode_envelope(bytes)?,
        })
    }

    /// A COMMON statement declares its variables in order; each one
    /// consumes the next incoming buffer, which must agree in type
    /// and shape.
    pub fn declare(&mut self, variable: Rc<Variable>) -> Result<Option<CommonValue>> {
        let tag = Tag::of(&variable.ty)?;
        self.declared.push(variable.clone());
        let value = match self.incoming.pop_front() {
            Some(value) => value,
            None => return Ok(None),
        };
        if value.tag != tag as u8 || value.bounds.is_some() != variable.is_array() {
            return Err(error!(TypeMismatch; "COMMON variable order does not match"));
        }
        Ok(Some(value))
    }

    /// CHAIN: capture every declared variable's current value into
    /// the envelope for the successor.
    pub fn serialize(&self, memory: &Memory) -> Result<Vec<u8>> {
        let mut values = Vec::new();
        for variable in &self.declared {
            values.push(capture(memory, variable)?);
        }
        Ok(encode_envelope(&values))
    }

    pub fn element_values(value: &CommonValue, ty: &Ty) -> Result<Vec<Val>> {
        let mut cursor = 0usize;
        let mut values = Vec::new();
        while cursor < value.bytes.len() {
            values.push(decode_value(ty, &value.bytes, &mut cursor)?);
        }
        Ok(values)
    }

    pub fn bounds(value: &CommonValue) -> Option<&Vec<(i32, i32)>> {
        value.bounds.as_ref()
    }
}

fn capture(memory: &Memory, variable: &Rc<Variable>) -> Result<CommonValue> {
    let tag = Tag::of(&variable.ty)?;
    let mut bytes = Vec::new();
    let mut bounds = None;
    if let Some(dims) = &variable.dims {
        let (_, stored) = memory.dereference(variable)?;
        match stored {
            Some(Val::Array(descriptor)) => {
                bounds = Some(descriptor.bounds.clone());
                let count = descriptor.element_count();
                for slot in 0..count {
                    let val = memory
                        .read_address(descriptor.base.offset(slot))?
                        .unwrap_or_else(|| Val::default_of(&variable.ty));
                    encode_value(&mut bytes, &val)?;
                }
            }
            _ => {
                // Never dimensioned: transfer the declared bounds with
                // default elements.
                let declared: Vec<(i32, i32)> = dims
                    .iter()
                    .map(|b| (b.lower.unwrap_or(1), b.upper.unwrap_or(0)))
                    .collect();
                let count: usize = declared
                    .iter()
                    .map(|(lower, upper)| (upper - lower + 1).max(0) as usize)
                    .product();
                for _ in 0..count {
                    encode_value(&mut bytes, &Val::default_of(&variable.ty))?;
                }
                bounds = Some(declared);
            }
        }
    } else {
        let val = memory
            .read(variable)?
            .unwrap_or_else(|| Val::default_of(&variable.ty));
        encode_value(&mut bytes, &val)?;
    }
    Ok(CommonValue {
        tag: tag as u8,
        bounds,
        bytes,
    })
}

pub(crate) fn encode_value(bytes: &mut Vec<u8>, val: &Val) -> Result<()> {
    match val {
        Val::Integer(n) => bytes.extend_from_slice(&n.to_le_bytes()),
        Val::Long(n) => bytes.extend_from_slice(&n.to_le_bytes()),
        Val::Single(n) => bytes.extend_from_slice(&n.to_le_bytes()),
        Val::Double(n) => bytes.extend_from_slice(&n.to_le_bytes()),
        Val::String(s) => {
            let len = u16::try_from(s.len())
                .map_err(|_| error!(OutOfStringSpace; "COMMON string too long"))?;
            bytes.extend_from_slice(&len.to_le_bytes());
            bytes.extend_from_slice(s.as_bytes());
        }
        _ => return Err(error!(TypeMismatch; "COMMON carries scalars and arrays only")),
    }
    Ok(())
}

pub(crate) fn decode_value(ty: &Ty, bytes: &[u8], cursor: &mut usize) -> Result<Val> {
    let take = |cursor: &mut usize, count: usize| -> Result<&[u8]> {
        let start = *cursor;
        let end = start + count;
        if end > bytes.len() {
            return Err(error!(InternalError; "COMMON buffer truncated"));
        }
        *cursor = end;
        Ok(&bytes[start..end])
    };
    match ty {
        Ty::Integer => {
            let b = take(cursor, 2)?;
            Ok(Val::Integer(i16::from_le_bytes([b[0], b[1]])))
        }
        Ty::Long => {
            let b = take(cursor, 4)?;
            Ok(Val::Long(i32::from_le_bytes([b[0], b[1], b[2], b[3]])))
        }
        Ty::Single => {
            let b = take(cursor, 4)?;
            Ok(Val::Single(f32::from_le_bytes([b[0], b[1], b[2], b[3]])))
        }
        Ty::Double => {
            let b = take(cursor, 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            Ok(Val::Double(f64::from_le_bytes(raw)))
        }
        Ty::String | Ty::FixedString(_) => {
            let b = take(cursor, 2)?;
            let len = u16::from_le_bytes([b[0], b[1]]) as usize;
            let b = take(cursor, len)?;
            Ok(Val::String(String::from_utf8_lossy(b).into_owned().into()))
        }
        _ => Err(error!(TypeMismatch; "COMMON carries scalars and arrays only")),
    }
}

fn encode_envelope(values: &[CommonValue]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for value in values {
        payload.push(value.tag);
        match &value.bounds {
            None => payload.push(0),
            Some(bounds) => {
                payload.push(bounds.len() as u8);
                for (lower, upper) in bounds {
                    payload.extend_from_slice(&lower.to_le_bytes());
                    payload.extend_from_slice(&upper.to_le_bytes());
                }
            }
        }
        payload.extend_from_slice(&(value.bytes.len() as u32).to_le_bytes());
        payload.extend_from_slice(&value.bytes);
    }
    let checksum = crc::crc32::checksum_ieee(&payload);
    payload.extend_from_slice(&checksum.to_le_bytes());
    payload
}

fn decode_envelope(bytes: &[u8]) -> Result<VecDeque<CommonValue>> {
    if bytes.len() < 8 {
        return Err(error!(InternalError; "COMMON envelope truncated"));
    }
    let (payload, trailer) = bytes.split_at(bytes.len() - 4);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(trailer);
    if crc::crc32::checksum_ieee(payload) != u32::from_le_bytes(checksum) {
        return Err(error!(InternalError; "COMMON envelope checksum mismatch"));
    }
    let mut cursor = 4usize;
    let mut count = [0u8; 4];
    count.copy_from_slice(&payload[0..4]);
    let count = u32::from_le_bytes(count) as usize;
    let mut values = VecDeque::new();
    let take = |cursor: &mut usize, n: usize| -> Result<&[u8]> {
        let start = *cursor;
        let end = start + n;
        if end > payload.len() {
            return Err(error!(InternalError; "COMMON envelope truncated"));
        }
        *cursor = end;
        Ok(&payload[start..end])
    };
    for _ in 0..count {
        let tag = take(&mut cursor, 1)?[0];
        Tag::from_byte(tag)?;
        let dims = take(&mut cursor, 1)?[0] as usize;
        let bounds = if dims == 0 {
            None
        } else {
            let mut bounds = Vec::with_capacity(dims);
            for _ in 0..dims {
                let b = take(&mut cursor, 8)?;
                let lower = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                let upper = i32::from_le_bytes([b[4], b[5], b[6], b[7]]);
                bounds.push((lower, upper));
            }
            Some(bounds)
        };
        let b = take(&mut cursor, 4)?;
        let len = u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize;
        let bytes = take(&mut cursor, len)?.to_vec();
        values.push_back(CommonValue { tag, bounds, bytes });
    }
    Ok(values)
}
