//! GGUF emission: buffers the meta section in memory, pads to `alignment`,
//! then streams tensor data in info order.

use std::io::Write;

use crate::dtype::Type;

use super::error::GgufError;
use super::kv::GgufValue;

const DEFAULT_ALIGNMENT: u32 = 32;

fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) / align * align
}

struct PendingTensor {
    name: String,
    dtype: Type,
    ne: [i64; 4],
    bytes: Vec<u8>,
}

/// Builds a GGUF file incrementally, then emits it with [`GgufWriter::write`].
pub struct GgufWriter {
    alignment: u32,
    kv: Vec<(String, GgufValue)>,
    tensors: Vec<PendingTensor>,
    names: std::collections::HashSet<String>,
}

impl Default for GgufWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl GgufWriter {
    pub fn new() -> Self {
        GgufWriter {
            alignment: DEFAULT_ALIGNMENT,
            kv: Vec::new(),
            tensors: Vec::new(),
            names: std::collections::HashSet::new(),
        }
    }

    /// Overrides the default 32-byte alignment; also recorded as the
    /// `"general.alignment"` KV entry so a reader picks it up.
    pub fn set_alignment(&mut self, alignment: u32) {
        assert!(alignment > 0 && alignment.is_power_of_two(), "alignment must be a nonzero power of two");
        self.alignment = alignment;
        self.push_kv("general.alignment", GgufValue::U32(alignment));
    }

    pub fn push_kv(&mut self, key: impl Into<String>, value: GgufValue) {
        let key = key.into();
        if let Some(existing) = self.kv.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            self.kv.push((key, value));
        }
    }

    /// Registers a tensor for emission. `bytes` must already be encoded in
    /// `dtype`'s on-disk representation (e.g. already quantized).
    pub fn push_tensor(
        &mut self,
        name: impl Into<String>,
        dtype: Type,
        ne: [i64; 4],
        bytes: Vec<u8>,
    ) -> Result<(), GgufError> {
        let name = name.into();
        if !self.names.insert(name.clone()) {
            return Err(GgufError::DuplicateTensorName(name));
        }
        let block_size = dtype.block_size() as i64;
        if ne[0] % block_size != 0 {
            return Err(GgufError::BlockSizeViolation { name, ne0: ne[0], block_size: block_size as usize });
        }
        self.tensors.push(PendingTensor { name, dtype, ne, bytes });
        Ok(())
    }

    fn write_string(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    fn write_value(buf: &mut Vec<u8>, value: &GgufValue) {
        match value {
            GgufValue::U8(v) => buf.push(*v),
            GgufValue::I8(v) => buf.push(*v as u8),
            GgufValue::U16(v) => buf.extend_from_slice(&v.to_le_bytes()),
            GgufValue::I16(v) => buf.extend_from_slice(&v.to_le_bytes()),
            GgufValue::U32(v) => buf.extend_from_slice(&v.to_le_bytes()),
            GgufValue::I32(v) => buf.extend_from_slice(&v.to_le_bytes()),
            GgufValue::F32(v) => buf.extend_from_slice(&v.to_le_bytes()),
            GgufValue::Bool(v) => buf.push(*v as u8),
            GgufValue::String(s) => Self::write_string(buf, s),
            GgufValue::Array(items) => {
                let elem_type = items.first().map(GgufValue::type_tag).unwrap_or(0);
                buf.extend_from_slice(&elem_type.to_le_bytes());
                buf.extend_from_slice(&(items.len() as u64).to_le_bytes());
                for item in items {
                    Self::write_value(buf, item);
                }
            }
            GgufValue::U64(v) => buf.extend_from_slice(&v.to_le_bytes()),
            GgufValue::I64(v) => buf.extend_from_slice(&v.to_le_bytes()),
            GgufValue::F64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        }
    }

    fn n_dims_for(ne: [i64; 4]) -> u32 {
        ne.iter().rposition(|&x| x != 1).map(|p| p + 1).unwrap_or(1) as u32
    }

    /// Emits the file: header, KV table, tensor-info table, alignment
    /// padding, then tensor data in the order tensors were pushed.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), GgufError> {
        let mut meta = Vec::new();
        meta.extend_from_slice(b"GGUF");
        meta.extend_from_slice(&3u32.to_le_bytes());
        meta.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        meta.extend_from_slice(&(self.kv.len() as u64).to_le_bytes());

        for (key, value) in &self.kv {
            Self::write_string(&mut meta, key);
            meta.extend_from_slice(&value.type_tag().to_le_bytes());
            Self::write_value(&mut meta, value);
        }

        let mut offset = 0u64;
        for t in &self.tensors {
            Self::write_string(&mut meta, &t.name);
            let n_dims = Self::n_dims_for(t.ne);
            meta.extend_from_slice(&n_dims.to_le_bytes());
            for d in t.ne.iter().take(n_dims as usize) {
                meta.extend_from_slice(&(*d as u64).to_le_bytes());
            }
            meta.extend_from_slice(&t.dtype.gguf_tag().to_le_bytes());
            meta.extend_from_slice(&offset.to_le_bytes());
            offset += align_up(t.bytes.len(), self.alignment as usize) as u64;
        }

        let padded_len = align_up(meta.len(), self.alignment as usize);
        meta.resize(padded_len, 0);
        w.write_all(&meta)?;

        for t in &self.tensors {
            w.write_all(&t.bytes)?;
            let pad = align_up(t.bytes.len(), self.alignment as usize) - t.bytes.len();
            if pad > 0 {
                w.write_all(&vec![0u8; pad])?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::reader::parse_metadata;

    #[test]
    fn round_trips_metadata_and_tensor_bytes() {
        let mut wtr = GgufWriter::new();
        wtr.push_kv("general.name", GgufValue::String("demo".into()));
        wtr.push_tensor("weight", Type::F32, [4, 1, 1, 1], vec![0u8; 16]).unwrap();

        let mut out = Vec::new();
        wtr.write(&mut out).unwrap();

        let meta = parse_metadata(&out).unwrap();
        assert_eq!(meta.version, 3);
        assert_eq!(meta.kv.get("general.name"), Some(&GgufValue::String("demo".into())));
        assert_eq!(meta.tensors.len(), 1);
        assert_eq!(meta.tensors[0].name, "weight");
        assert_eq!(meta.tensors[0].ne, [4, 1, 1, 1]);
        assert_eq!(out.len() - meta.data_section_offset, 16);
    }

    #[test]
    fn rejects_duplicate_tensor_name() {
        let mut wtr = GgufWriter::new();
        wtr.push_tensor("w", Type::F32, [4, 1, 1, 1], vec![0u8; 16]).unwrap();
        let err = wtr.push_tensor("w", Type::F32, [4, 1, 1, 1], vec![0u8; 16]);
        assert!(matches!(err, Err(GgufError::DuplicateTensorName(_))));
    }

    #[test]
    fn pads_tensor_data_to_alignment() {
        let mut wtr = GgufWriter::new();
        wtr.set_alignment(32);
        wtr.push_tensor("a", Type::F32, [1, 1, 1, 1], vec![1u8; 4]).unwrap();
        wtr.push_tensor("b", Type::F32, [1, 1, 1, 1], vec![2u8; 4]).unwrap();
        let mut out = Vec::new();
        wtr.write(&mut out).unwrap();
        let meta = parse_metadata(&out).unwrap();
        assert_eq!(meta.tensors[0].offset, 0);
        assert_eq!(meta.tensors[1].offset, 32);
    }
}
