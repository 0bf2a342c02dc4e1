//! The element-type registry: a plain enum of every storage format a
//! tensor's elements can take, backed by a descriptor table of block size,
//! byte size, and conversion/dot-product function pointers rather than a
//! match arm per operation.

use crate::quant::{dense, kquant, q8k};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
/// The type of a value held by a [`crate::tensor::Tensor`].
pub enum Type {
    /// 32-bit float.
    #[default]
    F32,
    /// IEEE-754 half precision float.
    F16,
    /// bfloat16.
    BF16,
    /// Signed 8-bit integer.
    I8,
    /// Signed 16-bit integer.
    I16,
    /// Signed 32-bit integer.
    I32,
    /// Signed 64-bit integer.
    I64,
    /// Quantized 4-bit (type 0).
    Q4_0,
    /// Quantized 4-bit (type 1).
    Q4_1,
    /// Quantized 5-bit (type 0).
    Q5_0,
    /// Quantized 5-bit (type 1).
    Q5_1,
    /// Quantized 8-bit (type 0).
    Q8_0,
    /// Quantized 8-bit (type 1).
    Q8_1,
    /// K-quantized 2-bit.
    #[allow(non_camel_case_types)]
    Q2_K,
    /// K-quantized 3-bit.
    #[allow(non_camel_case_types)]
    Q3_K,
    /// K-quantized 4-bit.
    #[allow(non_camel_case_types)]
    Q4_K,
    /// K-quantized 5-bit.
    #[allow(non_camel_case_types)]
    Q5_K,
    /// K-quantized 6-bit.
    #[allow(non_camel_case_types)]
    Q6_K,
    /// K-quantized 8-bit; the `vec_dot_type` every K-quant converts its
    /// second matmul operand to.
    #[allow(non_camel_case_types)]
    Q8_K,
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.descriptor().name)
    }
}

impl Type {
    /// All types the registry knows about, in GGUF tag order.
    pub const ALL: [Type; 19] = [
        Type::F32,
        Type::F16,
        Type::I8,
        Type::I16,
        Type::I32,
        Type::I64,
        Type::Q4_0,
        Type::Q4_1,
        Type::Q5_0,
        Type::Q5_1,
        Type::Q8_0,
        Type::Q8_1,
        Type::Q2_K,
        Type::Q3_K,
        Type::Q4_K,
        Type::Q5_K,
        Type::Q6_K,
        Type::Q8_K,
        Type::BF16,
    ];

    /// Is this a block-quantized type?
    pub fn is_quantized(&self) -> bool {
        self.descriptor().is_quantized
    }

    /// Number of logical scalars per stored block (1 for dense types).
    pub fn block_size(&self) -> usize {
        self.descriptor().block_size
    }

    /// Bytes of storage per block.
    pub fn type_size(&self) -> usize {
        self.descriptor().type_size
    }

    /// The type the second operand of a dot product must be converted to
    /// before `vec_dot` is called.
    pub fn vec_dot_type(&self) -> Type {
        self.descriptor().vec_dot_type
    }

    /// Bytes needed to store one row of `ne0` elements of this type.
    pub fn row_size(&self, ne0: usize) -> usize {
        let d = self.descriptor();
        assert_eq!(
            ne0 % d.block_size,
            0,
            "{self}: dimension-0 length {ne0} is not a multiple of block_size {}",
            d.block_size
        );
        (ne0 / d.block_size) * d.type_size
    }

    /// Look up this type's descriptor.
    pub fn descriptor(&self) -> TypeDescriptor {
        TYPE_TABLE[*self as usize]
    }

    /// GGUF numeric tag for this type, as recorded in a GGUF file's tensor
    /// info table.
    pub fn gguf_tag(&self) -> u32 {
        match self {
            Type::F32 => 0,
            Type::F16 => 1,
            Type::Q4_0 => 2,
            Type::Q4_1 => 3,
            Type::Q5_0 => 4,
            Type::Q5_1 => 5,
            Type::Q8_0 => 6,
            Type::Q8_1 => 7,
            Type::Q2_K => 8,
            Type::Q3_K => 9,
            Type::Q4_K => 10,
            Type::Q5_K => 11,
            Type::Q6_K => 12,
            Type::Q8_K => 13,
            Type::I8 => 14,
            Type::I16 => 15,
            Type::I32 => 16,
            Type::I64 => 17,
            Type::BF16 => 18,
        }
    }

    /// Inverse of [`Type::gguf_tag`].
    pub fn from_gguf_tag(tag: u32) -> Option<Type> {
        Type::ALL.into_iter().find(|t| t.gguf_tag() == tag)
    }
}

/// A type's block layout and conversion/dot-product contract.
#[derive(Clone, Copy)]
pub struct TypeDescriptor {
    pub name: &'static str,
    pub block_size: usize,
    pub type_size: usize,
    pub is_quantized: bool,
    pub vec_dot_type: Type,
    pub to_float: fn(&[u8], &mut [f32]),
    pub from_float: Option<fn(&[f32], &mut [u8])>,
    pub from_float_ref: Option<fn(&[f32], &mut [u8])>,
}

macro_rules! dense_conv {
    ($to:ident, $from:ident, $t:ty) => {
        fn $to(src: &[u8], dst: &mut [f32]) {
            let width = std::mem::size_of::<$t>();
            for (i, chunk) in src.chunks_exact(width).enumerate() {
                dst[i] = <$t>::from_le_bytes(chunk.try_into().unwrap()) as f32;
            }
        }
        fn $from(src: &[f32], dst: &mut [u8]) {
            let width = std::mem::size_of::<$t>();
            for (i, &x) in src.iter().enumerate() {
                dst[i * width..(i + 1) * width]
                    .copy_from_slice(&(x as $t).to_le_bytes());
            }
        }
    };
}

dense_conv!(to_float_i8, from_float_i8, i8);
dense_conv!(to_float_i16, from_float_i16, i16);
dense_conv!(to_float_i32, from_float_i32, i32);
dense_conv!(to_float_i64, from_float_i64, i64);

fn to_float_f32(src: &[u8], dst: &mut [f32]) {
    for (i, chunk) in src.chunks_exact(4).enumerate() {
        dst[i] = f32::from_le_bytes(chunk.try_into().unwrap());
    }
}
fn from_float_f32(src: &[f32], dst: &mut [u8]) {
    for (i, &x) in src.iter().enumerate() {
        dst[i * 4..i * 4 + 4].copy_from_slice(&x.to_le_bytes());
    }
}

fn to_float_f16(src: &[u8], dst: &mut [f32]) {
    for (i, chunk) in src.chunks_exact(2).enumerate() {
        dst[i] = crate::numeric::fp16_to_fp32(u16::from_le_bytes(chunk.try_into().unwrap()));
    }
}
fn from_float_f16(src: &[f32], dst: &mut [u8]) {
    for (i, &x) in src.iter().enumerate() {
        dst[i * 2..i * 2 + 2].copy_from_slice(&crate::numeric::fp32_to_fp16(x).to_le_bytes());
    }
}

fn to_float_bf16(src: &[u8], dst: &mut [f32]) {
    for (i, chunk) in src.chunks_exact(2).enumerate() {
        dst[i] = crate::numeric::bf16_to_fp32(u16::from_le_bytes(chunk.try_into().unwrap()));
    }
}
fn from_float_bf16(src: &[f32], dst: &mut [u8]) {
    for (i, &x) in src.iter().enumerate() {
        dst[i * 2..i * 2 + 2].copy_from_slice(&crate::numeric::fp32_to_bf16(x).to_le_bytes());
    }
}

macro_rules! blocked_conv {
    ($to:ident, $from:ident, $block:expr, $type_size:expr, $dequant:path, $quant:path) => {
        fn $to(src: &[u8], dst: &mut [f32]) {
            let n = dst.len() / $block;
            for b in 0..n {
                $dequant(
                    &src[b * $type_size..(b + 1) * $type_size],
                    &mut dst[b * $block..(b + 1) * $block],
                );
            }
        }
        fn $from(src: &[f32], dst: &mut [u8]) {
            let n = src.len() / $block;
            for b in 0..n {
                $quant(
                    &src[b * $block..(b + 1) * $block],
                    &mut dst[b * $type_size..(b + 1) * $type_size],
                );
            }
        }
    };
}

blocked_conv!(
    to_float_q4_0,
    from_float_q4_0,
    dense::BLOCK,
    dense::q4_0::TYPE_SIZE,
    dense::q4_0::dequantize_block,
    dense::q4_0::quantize_block
);
blocked_conv!(
    to_float_q4_1,
    from_float_q4_1,
    dense::BLOCK,
    dense::q4_1::TYPE_SIZE,
    dense::q4_1::dequantize_block,
    dense::q4_1::quantize_block
);
blocked_conv!(
    to_float_q5_0,
    from_float_q5_0,
    dense::BLOCK,
    dense::q5_0::TYPE_SIZE,
    dense::q5_0::dequantize_block,
    dense::q5_0::quantize_block
);
blocked_conv!(
    to_float_q5_1,
    from_float_q5_1,
    dense::BLOCK,
    dense::q5_1::TYPE_SIZE,
    dense::q5_1::dequantize_block,
    dense::q5_1::quantize_block
);
blocked_conv!(
    to_float_q8_0,
    from_float_q8_0,
    dense::BLOCK,
    dense::q8_0::TYPE_SIZE,
    dense::q8_0::dequantize_block,
    dense::q8_0::quantize_block
);
blocked_conv!(
    to_float_q8_1,
    from_float_q8_1,
    dense::BLOCK,
    dense::q8_1::TYPE_SIZE,
    dense::q8_1::dequantize_block,
    dense::q8_1::quantize_block
);
blocked_conv!(
    to_float_q2_k,
    from_float_q2_k,
    kquant::SUPERBLOCK,
    kquant::q2_k::TYPE_SIZE,
    kquant::q2_k::dequantize_block,
    kquant::q2_k::quantize_block
);
blocked_conv!(
    to_float_q3_k,
    from_float_q3_k,
    kquant::SUPERBLOCK,
    kquant::q3_k::TYPE_SIZE,
    kquant::q3_k::dequantize_block,
    kquant::q3_k::quantize_block
);
blocked_conv!(
    to_float_q4_k,
    from_float_q4_k,
    kquant::SUPERBLOCK,
    kquant::q4_k::TYPE_SIZE,
    kquant::q4_k::dequantize_block,
    kquant::q4_k::quantize_block
);
blocked_conv!(
    to_float_q5_k,
    from_float_q5_k,
    kquant::SUPERBLOCK,
    kquant::q5_k::TYPE_SIZE,
    kquant::q5_k::dequantize_block,
    kquant::q5_k::quantize_block
);
blocked_conv!(
    to_float_q6_k,
    from_float_q6_k,
    kquant::SUPERBLOCK,
    kquant::q6_k::TYPE_SIZE,
    kquant::q6_k::dequantize_block,
    kquant::q6_k::quantize_block
);
blocked_conv!(
    to_float_q8_k,
    from_float_q8_k,
    q8k::BLOCK,
    q8k::TYPE_SIZE,
    q8k::dequantize_block,
    q8k::quantize_block
);

static TYPE_TABLE: [TypeDescriptor; 19] = {
    use Type::*;
    let mut table = [TypeDescriptor {
        name: "",
        block_size: 1,
        type_size: 4,
        is_quantized: false,
        vec_dot_type: F32,
        to_float: to_float_f32,
        from_float: Some(from_float_f32),
        from_float_ref: Some(from_float_f32),
    }; 19];

    table[F32 as usize] = TypeDescriptor {
        name: "f32",
        block_size: 1,
        type_size: 4,
        is_quantized: false,
        vec_dot_type: F32,
        to_float: to_float_f32,
        from_float: Some(from_float_f32),
        from_float_ref: Some(from_float_f32),
    };
    table[F16 as usize] = TypeDescriptor {
        name: "f16",
        block_size: 1,
        type_size: 2,
        is_quantized: false,
        vec_dot_type: F16,
        to_float: to_float_f16,
        from_float: Some(from_float_f16),
        from_float_ref: Some(from_float_f16),
    };
    table[BF16 as usize] = TypeDescriptor {
        name: "bf16",
        block_size: 1,
        type_size: 2,
        is_quantized: false,
        vec_dot_type: BF16,
        to_float: to_float_bf16,
        from_float: Some(from_float_bf16),
        from_float_ref: Some(from_float_bf16),
    };
    table[I8 as usize] = TypeDescriptor {
        name: "i8",
        block_size: 1,
        type_size: 1,
        is_quantized: false,
        vec_dot_type: I8,
        to_float: to_float_i8,
        from_float: Some(from_float_i8),
        from_float_ref: Some(from_float_i8),
    };
    table[I16 as usize] = TypeDescriptor {
        name: "i16",
        block_size: 1,
        type_size: 2,
        is_quantized: false,
        vec_dot_type: I16,
        to_float: to_float_i16,
        from_float: Some(from_float_i16),
        from_float_ref: Some(from_float_i16),
    };
    table[I32 as usize] = TypeDescriptor {
        name: "i32",
        block_size: 1,
        type_size: 4,
        is_quantized: false,
        vec_dot_type: I32,
        to_float: to_float_i32,
        from_float: Some(from_float_i32),
        from_float_ref: Some(from_float_i32),
    };
    table[I64 as usize] = TypeDescriptor {
        name: "i64",
        block_size: 1,
        type_size: 8,
        is_quantized: false,
        vec_dot_type: I64,
        to_float: to_float_i64,
        from_float: Some(from_float_i64),
        from_float_ref: Some(from_float_i64),
    };
    table[Q4_0 as usize] = TypeDescriptor {
        name: "q4_0",
        block_size: dense::BLOCK,
        type_size: dense::q4_0::TYPE_SIZE,
        is_quantized: true,
        vec_dot_type: Q8_0,
        to_float: to_float_q4_0,
        from_float: Some(from_float_q4_0),
        from_float_ref: Some(from_float_q4_0),
    };
    table[Q4_1 as usize] = TypeDescriptor {
        name: "q4_1",
        block_size: dense::BLOCK,
        type_size: dense::q4_1::TYPE_SIZE,
        is_quantized: true,
        vec_dot_type: Q8_1,
        to_float: to_float_q4_1,
        from_float: Some(from_float_q4_1),
        from_float_ref: Some(from_float_q4_1),
    };
    table[Q5_0 as usize] = TypeDescriptor {
        name: "q5_0",
        block_size: dense::BLOCK,
        type_size: dense::q5_0::TYPE_SIZE,
        is_quantized: true,
        vec_dot_type: Q8_0,
        to_float: to_float_q5_0,
        from_float: Some(from_float_q5_0),
        from_float_ref: Some(from_float_q5_0),
    };
    table[Q5_1 as usize] = TypeDescriptor {
        name: "q5_1",
        block_size: dense::BLOCK,
        type_size: dense::q5_1::TYPE_SIZE,
        is_quantized: true,
        vec_dot_type: Q8_1,
        to_float: to_float_q5_1,
        from_float: Some(from_float_q5_1),
        from_float_ref: Some(from_float_q5_1),
    };
    table[Q8_0 as usize] = TypeDescriptor {
        name: "q8_0",
        block_size: dense::BLOCK,
        type_size: dense::q8_0::TYPE_SIZE,
        is_quantized: true,
        vec_dot_type: Q8_0,
        to_float: to_float_q8_0,
        from_float: Some(from_float_q8_0),
        from_float_ref: Some(from_float_q8_0),
    };
    table[Q8_1 as usize] = TypeDescriptor {
        name: "q8_1",
        block_size: dense::BLOCK,
        type_size: dense::q8_1::TYPE_SIZE,
        is_quantized: true,
        vec_dot_type: Q8_1,
        to_float: to_float_q8_1,
        from_float: Some(from_float_q8_1),
        from_float_ref: Some(from_float_q8_1),
    };
    table[Q2_K as usize] = TypeDescriptor {
        name: "q2_k",
        block_size: kquant::SUPERBLOCK,
        type_size: kquant::q2_k::TYPE_SIZE,
        is_quantized: true,
        vec_dot_type: Q8_K,
        to_float: to_float_q2_k,
        from_float: Some(from_float_q2_k),
        from_float_ref: Some(from_float_q2_k),
    };
    table[Q3_K as usize] = TypeDescriptor {
        name: "q3_k",
        block_size: kquant::SUPERBLOCK,
        type_size: kquant::q3_k::TYPE_SIZE,
        is_quantized: true,
        vec_dot_type: Q8_K,
        to_float: to_float_q3_k,
        from_float: Some(from_float_q3_k),
        from_float_ref: Some(from_float_q3_k),
    };
    table[Q4_K as usize] = TypeDescriptor {
        name: "q4_k",
        block_size: kquant::SUPERBLOCK,
        type_size: kquant::q4_k::TYPE_SIZE,
        is_quantized: true,
        vec_dot_type: Q8_K,
        to_float: to_float_q4_k,
        from_float: Some(from_float_q4_k),
        from_float_ref: Some(from_float_q4_k),
    };
    table[Q5_K as usize] = TypeDescriptor {
        name: "q5_k",
        block_size: kquant::SUPERBLOCK,
        type_size: kquant::q5_k::TYPE_SIZE,
        is_quantized: true,
        vec_dot_type: Q8_K,
        to_float: to_float_q5_k,
        from_float: Some(from_float_q5_k),
        from_float_ref: Some(from_float_q5_k),
    };
    table[Q6_K as usize] = TypeDescriptor {
        name: "q6_k",
        block_size: kquant::SUPERBLOCK,
        type_size: kquant::q6_k::TYPE_SIZE,
        is_quantized: true,
        vec_dot_type: Q8_K,
        to_float: to_float_q6_k,
        from_float: Some(from_float_q6_k),
        from_float_ref: Some(from_float_q6_k),
    };
    table[Q8_K as usize] = TypeDescriptor {
        name: "q8_k",
        block_size: q8k::BLOCK,
        type_size: q8k::TYPE_SIZE,
        is_quantized: true,
        vec_dot_type: Q8_K,
        to_float: to_float_q8_k,
        from_float: Some(from_float_q8_k),
        from_float_ref: Some(from_float_q8_k),
    };

    table
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantized_block_sizes_divide_nothing_smaller_than_a_block() {
        for t in Type::ALL {
            let d = t.descriptor();
            if d.is_quantized {
                assert!(d.block_size >= 16);
                assert!(d.type_size < d.block_size * 4);
            } else {
                assert_eq!(d.block_size, 1);
            }
        }
    }

    #[test]
    fn gguf_tag_round_trips() {
        for t in Type::ALL {
            assert_eq!(Type::from_gguf_tag(t.gguf_tag()), Some(t));
        }
    }

    #[test]
    fn dense_round_trip_exact_for_f32() {
        let xs = [1.0f32, -2.5, 0.0, 1e10, -1e-10];
        let mut bytes = vec![0u8; xs.len() * 4];
        (Type::F32.descriptor().from_float.unwrap())(&xs, &mut bytes);
        let mut back = vec![0f32; xs.len()];
        (Type::F32.descriptor().to_float)(&bytes, &mut back);
        assert_eq!(xs.to_vec(), back);
    }

    #[test]
    fn row_size_respects_block_size() {
        assert_eq!(Type::F32.row_size(8), 32);
        assert_eq!(Type::Q4_0.row_size(64), 2 * dense::q4_0::TYPE_SIZE);
    }

    #[test]
    #[should_panic]
    fn row_size_rejects_non_multiple_of_block_size() {
        Type::Q4_0.row_size(10);
    }
}
