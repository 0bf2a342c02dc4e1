//! GGUF parsing: a `no_alloc` metadata-only path and a full, mmap-backed
//! tensor load that copies bytes into a [`Context`] arena.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::context::Context;
use crate::dtype::Type;
use crate::tensor::TensorIndex;

use super::error::GgufError;
use super::kv::GgufValue;

const MAGIC: [u8; 4] = *b"GGUF";
const DEFAULT_ALIGNMENT: u32 = 32;

fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) / align * align
}

/// A decoded tensor-info table entry.
#[derive(Debug, Clone, PartialEq)]
pub struct GgufTensorInfo {
    pub name: String,
    pub n_dims: u32,
    pub ne: [i64; 4],
    pub dtype: Type,
    /// Byte offset from the start of the data section.
    pub offset: u64,
}

/// Everything the header, KV table and tensor-info table describe, without
/// touching the data section.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub version: u32,
    pub kv: HashMap<String, GgufValue>,
    pub tensors: Vec<GgufTensorInfo>,
    pub alignment: u32,
    /// Absolute byte offset in the file where the data section begins.
    pub data_section_offset: usize,
}

impl Metadata {
    /// A map from tensor name to `(type, shape, offset)`, for callers that
    /// only need to resolve names without walking the `tensors` list.
    pub fn tensor_map(&self) -> HashMap<String, (Type, [i64; 4], u64)> {
        self.tensors
            .iter()
            .map(|t| (t.name.clone(), (t.dtype, t.ne, t.offset)))
            .collect()
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], GgufError> {
        if self.pos + n > self.bytes.len() {
            return Err(GgufError::Truncated {
                offset: self.pos,
                needed: self.pos + n - self.bytes.len(),
            });
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, GgufError> {
        Ok(self.take(1)?[0])
    }

    fn read_i8(&mut self) -> Result<i8, GgufError> {
        Ok(self.take(1)?[0] as i8)
    }

    fn read_u16(&mut self) -> Result<u16, GgufError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_i16(&mut self) -> Result<i16, GgufError> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32, GgufError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32, GgufError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_f32(&mut self) -> Result<f32, GgufError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, GgufError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64, GgufError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_f64(&mut self) -> Result<f64, GgufError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_gguf_string(&mut self) -> Result<String, GgufError> {
        let len = self.read_u64()?;
        if len == u64::MAX {
            return Err(GgufError::HostileStringLength);
        }
        let bytes = self.take(len as usize)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

fn read_kv_value(cur: &mut Cursor, type_tag: u32, in_array: bool) -> Result<GgufValue, GgufError> {
    match type_tag {
        0 => Ok(GgufValue::U8(cur.read_u8()?)),
        1 => Ok(GgufValue::I8(cur.read_i8()?)),
        2 => Ok(GgufValue::U16(cur.read_u16()?)),
        3 => Ok(GgufValue::I16(cur.read_i16()?)),
        4 => Ok(GgufValue::U32(cur.read_u32()?)),
        5 => Ok(GgufValue::I32(cur.read_i32()?)),
        6 => Ok(GgufValue::F32(cur.read_f32()?)),
        7 => Ok(GgufValue::Bool(cur.read_u8()? != 0)),
        8 => Ok(GgufValue::String(cur.read_gguf_string()?)),
        9 => {
            if in_array {
                return Err(GgufError::NestedArray);
            }
            let elem_type = cur.read_u32()?;
            if elem_type == 9 {
                return Err(GgufError::NestedArray);
            }
            let n = cur.read_u64()?;
            let mut out = Vec::new();
            for _ in 0..n {
                out.push(read_kv_value(cur, elem_type, true)?);
            }
            Ok(GgufValue::Array(out))
        }
        10 => Ok(GgufValue::U64(cur.read_u64()?)),
        11 => Ok(GgufValue::I64(cur.read_i64()?)),
        12 => Ok(GgufValue::F64(cur.read_f64()?)),
        other => Err(GgufError::UnknownTypeTag(other)),
    }
}

/// Dimension-0-aware byte size of a tensor, without trusting the caller:
/// [`Type::row_size`] asserts on a block-size mismatch, which is fine for
/// programmer error but not for untrusted file input, so this checks first.
fn tensor_byte_size(name: &str, dtype: Type, ne: [i64; 4]) -> Result<usize, GgufError> {
    let block_size = dtype.block_size() as i64;
    if ne[0] % block_size != 0 {
        return Err(GgufError::BlockSizeViolation {
            name: name.to_string(),
            ne0: ne[0],
            block_size: block_size as usize,
        });
    }
    let nelements = ne[0] as i128 * ne[1] as i128 * ne[2] as i128 * ne[3] as i128;
    let blocks = nelements / block_size as i128;
    Ok((blocks * dtype.type_size() as i128) as usize)
}

/// Parses the header, KV table and tensor-info table, rejecting any
/// structurally malformed input along the way. Never touches the data
/// section.
pub fn parse_metadata(bytes: &[u8]) -> Result<Metadata, GgufError> {
    let mut cur = Cursor::new(bytes);

    let magic: [u8; 4] = cur.take(4)?.try_into().unwrap();
    if magic != MAGIC {
        return Err(GgufError::BadMagic(magic));
    }

    let version = cur.read_u32()?;
    if version == 1 || version > 3 {
        return Err(GgufError::UnsupportedVersion(version));
    }

    let n_tensors = cur.read_u64()?;
    let n_kv = cur.read_u64()?;

    let mut kv = HashMap::with_capacity(n_kv as usize);
    for _ in 0..n_kv {
        let key = cur.read_gguf_string()?;
        let type_tag = cur.read_u32()?;
        let value = read_kv_value(&mut cur, type_tag, false)?;
        kv.insert(key, value);
    }

    let alignment = kv
        .get("general.alignment")
        .and_then(GgufValue::as_u32)
        .unwrap_or(DEFAULT_ALIGNMENT);
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(GgufError::InvalidAlignment(alignment));
    }

    let mut tensors = Vec::with_capacity(n_tensors as usize);
    let mut seen = HashSet::with_capacity(n_tensors as usize);
    for _ in 0..n_tensors {
        let name = cur.read_gguf_string()?;
        if !seen.insert(name.clone()) {
            return Err(GgufError::DuplicateTensorName(name));
        }

        let n_dims = cur.read_u32()?;
        if n_dims == 0 || n_dims > 4 {
            return Err(GgufError::InvalidDims { name, n_dims });
        }

        let mut ne = [1i64; 4];
        let mut nelements: i64 = 1;
        for (d, slot) in ne.iter_mut().enumerate().take(n_dims as usize) {
            let v = cur.read_u64()?;
            if v == 0 {
                return Err(GgufError::ZeroExtent { name, dim: d });
            }
            *slot = v as i64;
            nelements = nelements
                .checked_mul(*slot)
                .ok_or_else(|| GgufError::ElementCountOverflow(name.clone()))?;
        }

        let type_tag = cur.read_u32()?;
        let dtype = Type::from_gguf_tag(type_tag)
            .ok_or_else(|| GgufError::UnknownTensorType { name: name.clone(), tag: type_tag })?;
        let offset = cur.read_u64()?;

        tensors.push(GgufTensorInfo { name, n_dims, ne, dtype, offset });
    }

    let data_section_offset = align_up(cur.pos, alignment as usize);

    Ok(Metadata { version, kv, tensors, alignment, data_section_offset })
}

/// `no_alloc` read: metadata and a tensor-name map, without reading the
/// data section.
pub fn read_metadata<P: AsRef<Path>>(path: P) -> Result<Metadata, GgufError> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    parse_metadata(&mmap)
}

/// Full read: mmaps the file, parses the metadata, then allocates each
/// tensor in `ctx` and copies its bytes out of the data section, patching
/// each returned tensor's storage the way a non-`no_alloc` reader would.
pub fn read<P: AsRef<Path>>(
    path: P,
    ctx: &mut Context,
) -> Result<(Metadata, HashMap<String, TensorIndex>), GgufError> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let meta = parse_metadata(&mmap)?;

    let data_size = (mmap.len() - meta.data_section_offset) as u64;
    let mut out = HashMap::with_capacity(meta.tensors.len());

    for info in &meta.tensors {
        let size = tensor_byte_size(&info.name, info.dtype, info.ne)? as u64;
        let end = info.offset.checked_add(size).ok_or_else(|| GgufError::DataOutOfBounds {
            name: info.name.clone(),
            offset: info.offset,
            end: u64::MAX,
            data_size,
        })?;
        if end > data_size {
            return Err(GgufError::DataOutOfBounds {
                name: info.name.clone(),
                offset: info.offset,
                end,
                data_size,
            });
        }

        let idx = ctx.new_tensor(info.dtype, info.ne);
        let start = meta.data_section_offset + info.offset as usize;
        let src = &mmap[start..start + size as usize];
        ctx.data_mut(idx).copy_from_slice(src);
        out.insert(info.name.clone(), idx);
    }

    log::debug!("gguf: loaded {} tensors ({} bytes of metadata)", out.len(), meta.data_section_offset);
    Ok((meta, out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header(version: u32, n_tensors: u64, n_kv: u64) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(b"GGUF");
        b.extend_from_slice(&version.to_le_bytes());
        b.extend_from_slice(&n_tensors.to_le_bytes());
        b.extend_from_slice(&n_kv.to_le_bytes());
        b
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = b"XXXX\x03\x00\x00\x00".to_vec();
        assert!(matches!(parse_metadata(&bytes), Err(GgufError::BadMagic(_))));
    }

    #[test]
    fn rejects_version_one() {
        let bytes = minimal_header(1, 0, 0);
        assert!(matches!(parse_metadata(&bytes), Err(GgufError::UnsupportedVersion(1))));
    }

    #[test]
    fn accepts_version_three_with_no_tensors_or_kv() {
        let bytes = minimal_header(3, 0, 0);
        let meta = parse_metadata(&bytes).unwrap();
        assert_eq!(meta.version, 3);
        assert_eq!(meta.alignment, DEFAULT_ALIGNMENT);
        assert!(meta.tensors.is_empty());
    }

    #[test]
    fn rejects_hostile_string_length() {
        let mut bytes = minimal_header(3, 0, 1);
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(parse_metadata(&bytes), Err(GgufError::HostileStringLength)));
    }

    #[test]
    fn rejects_truncated_file() {
        let mut bytes = minimal_header(3, 1, 0);
        bytes.extend_from_slice(&3u64.to_le_bytes());
        bytes.extend_from_slice(b"abc");
        // n_dims and the rest of the tensor-info entry are missing.
        assert!(matches!(parse_metadata(&bytes), Err(GgufError::Truncated { .. })));
    }

    #[test]
    fn rejects_zero_extent() {
        let mut bytes = minimal_header(3, 1, 0);
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(b"t");
        bytes.extend_from_slice(&1u32.to_le_bytes()); // n_dims
        bytes.extend_from_slice(&0u64.to_le_bytes()); // ne[0] == 0
        bytes.extend_from_slice(&0u32.to_le_bytes()); // type = F32
        bytes.extend_from_slice(&0u64.to_le_bytes()); // offset
        assert!(matches!(parse_metadata(&bytes), Err(GgufError::ZeroExtent { .. })));
    }

    #[test]
    fn rejects_too_many_dims() {
        let mut bytes = minimal_header(3, 1, 0);
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(b"t");
        bytes.extend_from_slice(&5u32.to_le_bytes());
        assert!(matches!(parse_metadata(&bytes), Err(GgufError::InvalidDims { .. })));
    }

    #[test]
    fn rejects_duplicate_tensor_names() {
        let mut bytes = minimal_header(3, 2, 0);
        for _ in 0..2 {
            bytes.extend_from_slice(&1u64.to_le_bytes());
            bytes.extend_from_slice(b"t");
            bytes.extend_from_slice(&1u32.to_le_bytes());
            bytes.extend_from_slice(&4u64.to_le_bytes());
            bytes.extend_from_slice(&0u32.to_le_bytes());
            bytes.extend_from_slice(&0u64.to_le_bytes());
        }
        assert!(matches!(parse_metadata(&bytes), Err(GgufError::DuplicateTensorName(_))));
    }

    #[test]
    fn parses_a_scalar_kv_and_one_tensor_info() {
        let mut bytes = minimal_header(3, 1, 1);
        // KV: "answer" -> u32(42)
        bytes.extend_from_slice(&6u64.to_le_bytes());
        bytes.extend_from_slice(b"answer");
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&42u32.to_le_bytes());
        // tensor info: "weight", 1 dim, ne0=4, F32, offset=0
        bytes.extend_from_slice(&6u64.to_le_bytes());
        bytes.extend_from_slice(b"weight");
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&4u64.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());

        let meta = parse_metadata(&bytes).unwrap();
        assert_eq!(meta.kv.get("answer"), Some(&GgufValue::U32(42)));
        assert_eq!(meta.tensors.len(), 1);
        assert_eq!(meta.tensors[0].name, "weight");
        assert_eq!(meta.tensors[0].ne, [4, 1, 1, 1]);
        assert_eq!(meta.tensors[0].dtype, Type::F32);
    }
}
