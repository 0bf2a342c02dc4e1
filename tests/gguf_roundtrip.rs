//! A full write/read round trip through the GGUF container format, plus a
//! few of the reader's explicit malformed-input rejection cases.

use cgml::dtype::Type;
use cgml::gguf::{read, read_metadata, GgufValue, GgufWriter};
use cgml::{Context, ContextParams};

fn ctx() -> Context {
    Context::new(ContextParams { mem_size: 1 << 16, no_alloc: false })
}

#[test]
fn gguf_round_trip_preserves_tensor_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tmp.gguf");

    let w_data: Vec<f32> = (0..12).map(|i| i as f32).collect();
    let b_data: Vec<u16> = (0..4).map(|i| cgml::numeric::fp32_to_fp16(i as f32)).collect();

    let mut wtr = GgufWriter::new();
    wtr.set_alignment(32);
    let mut w_bytes = Vec::with_capacity(12 * 4);
    for v in &w_data {
        w_bytes.extend_from_slice(&v.to_le_bytes());
    }
    let mut b_bytes = Vec::with_capacity(4 * 2);
    for v in &b_data {
        b_bytes.extend_from_slice(&v.to_le_bytes());
    }
    wtr.push_tensor("w", Type::F32, [3, 4, 1, 1], w_bytes).unwrap();
    wtr.push_tensor("b", Type::F16, [4, 1, 1, 1], b_bytes).unwrap();

    let mut file = std::fs::File::create(&path).unwrap();
    wtr.write(&mut file).unwrap();
    drop(file);

    let file_len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(file_len % 32, 0, "writer must pad the whole file to alignment");

    let mut read_ctx = ctx();
    let (meta, tensors) = read(&path, &mut read_ctx).unwrap();
    assert_eq!(meta.version, 3);
    assert_eq!(meta.alignment, 32);
    assert_eq!(tensors.len(), 2);

    let w_idx = tensors["w"];
    assert_eq!(read_ctx.tensor(w_idx).ne, [3, 4, 1, 1]);
    assert_eq!(read_ctx.tensor(w_idx).dtype, Type::F32);
    assert_eq!(read_ctx.get_f32_1d(w_idx), w_data);

    let b_idx = tensors["b"];
    assert_eq!(read_ctx.tensor(b_idx).ne, [4, 1, 1, 1]);
    assert_eq!(read_ctx.tensor(b_idx).dtype, Type::F16);
    assert_eq!(read_ctx.get_f32_1d(b_idx), vec![0.0, 1.0, 2.0, 3.0]);

    // no_alloc path: metadata only, same shapes/types/offsets, no Context needed.
    let meta_only = read_metadata(&path).unwrap();
    let map = meta_only.tensor_map();
    assert_eq!(map["w"].0, Type::F32);
    assert_eq!(map["w"].1, [3, 4, 1, 1]);
    assert_eq!(map["b"].0, Type::F16);
}

#[test]
fn rejects_bad_magic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.gguf");
    std::fs::write(&path, b"NOPE\x03\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00").unwrap();
    assert!(read_metadata(&path).is_err());
}

#[test]
fn rejects_version_one() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("v1.gguf");
    let mut bytes = b"GGUF".to_vec();
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&0u64.to_le_bytes());
    bytes.extend_from_slice(&0u64.to_le_bytes());
    std::fs::write(&path, bytes).unwrap();
    assert!(read_metadata(&path).is_err());
}

#[test]
fn round_trips_string_and_array_kv_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv.gguf");

    let mut wtr = GgufWriter::new();
    wtr.push_kv("general.name", GgufValue::String("demo-model".into()));
    wtr.push_kv(
        "tokenizer.scores",
        GgufValue::Array(vec![GgufValue::F32(1.0), GgufValue::F32(2.0), GgufValue::F32(3.0)]),
    );
    let mut file = std::fs::File::create(&path).unwrap();
    wtr.write(&mut file).unwrap();
    drop(file);

    let meta = read_metadata(&path).unwrap();
    assert_eq!(meta.kv.get("general.name"), Some(&GgufValue::String("demo-model".into())));
    assert_eq!(
        meta.kv.get("tokenizer.scores"),
        Some(&GgufValue::Array(vec![GgufValue::F32(1.0), GgufValue::F32(2.0), GgufValue::F32(3.0)]))
    );
}
