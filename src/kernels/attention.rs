//! FLASH_ATTN_EXT: online-softmax attention, folding the running
//! max/sum/accumulator update into one pass over the KV sequence instead of
//! materializing the full score matrix.

use super::softmax::alibi_slope;
use super::{gather_f32, partition, write_f32_one};
use crate::context::Context;
use crate::tensor::TensorIndex;

pub fn flash_attn_ext(ctx: &Context, node: TensorIndex, ith: usize, nth: usize, scale: f32, max_bias: f32) {
    let t = ctx.tensor(node);
    let (q_idx, k_idx, v_idx) = (t.src[0], t.src[1], t.src[2]);
    let mask_idx = t.src.get(3).copied();

    let tq = ctx.tensor(q_idx).clone();
    let tk = ctx.tensor(k_idx).clone();
    let tv = ctx.tensor(v_idx).clone();

    let d = tq.ne[0] as usize;
    let n_q = tq.ne[1] as usize;
    let h = tq.ne[2] as usize;
    let b = tq.ne[3] as usize;
    let m_kv = tk.ne[1] as usize;
    let h_kv = tk.ne[2] as usize;

    let q_row_bytes = tq.dtype.row_size(d);
    let k_row_bytes = tk.dtype.row_size(d);
    let v_row_bytes = tv.dtype.row_size(d);

    let mask = mask_idx.map(|mi| (gather_f32(ctx, mi), ctx.tensor(mi).ne));

    let total = n_q * h * b;
    let (r0, r1) = partition(total, ith, nth);

    let mut qf = vec![0f32; d];
    let mut kf = vec![0f32; d];
    let mut vf = vec![0f32; d];
    let mut acc = vec![0f32; d];

    for idx in r0..r1 {
        let n = idx % n_q;
        let rest = idx / n_q;
        let hi = rest % h;
        let bi = rest / h;
        let hkv = hi % h_kv.max(1);
        let slope = alibi_slope(hi, h, max_bias);

        let q_off = n * tq.nb[1] + hi * tq.nb[2] + bi * tq.nb[3];
        let q_bytes = ctx.raw_bytes_at(q_idx, q_off, q_row_bytes);
        (tq.dtype.descriptor().to_float)(q_bytes, &mut qf);

        let mut m_run = f32::NEG_INFINITY;
        let mut s_run = 0f32;
        acc.iter_mut().for_each(|x| *x = 0.0);

        for mi in 0..m_kv {
            let k_off = mi * tk.nb[1] + hkv * tk.nb[2] + bi * tk.nb[3];
            let k_bytes = ctx.raw_bytes_at(k_idx, k_off, k_row_bytes);
            (tk.dtype.descriptor().to_float)(k_bytes, &mut kf);

            let mut dot = 0f32;
            for i in 0..d {
                dot += qf[i] * kf[i];
            }
            let mut sc = dot * scale;
            if let Some((mvals, mne)) = &mask {
                let mflat = mi + mne[0] as usize * (n % mne[1] as usize);
                sc += slope * mvals[mflat];
            }

            let m_new = m_run.max(sc);
            let alpha = (m_run - m_new).exp();
            let p = (sc - m_new).exp();
            s_run = s_run * alpha + p;

            let v_off = mi * tv.nb[1] + hkv * tv.nb[2] + bi * tv.nb[3];
            let v_bytes = ctx.raw_bytes_at(v_idx, v_off, v_row_bytes);
            (tv.dtype.descriptor().to_float)(v_bytes, &mut vf);
            for i in 0..d {
                acc[i] = acc[i] * alpha + p * vf[i];
            }
            m_run = m_new;
        }

        let out_base = d * (hi + h * (n + n_q * bi));
        for i in 0..d {
            write_f32_one(ctx, node, out_base + i, acc[i] / s_run);
        }
    }
}
