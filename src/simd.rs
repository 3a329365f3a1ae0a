//! Vectorized kernels for the mix hot path.
//!
//! Two operations matter per cycle: adding a source's samples into the mix
//! buffer and scaling a buffer by a constant (volume). Both dispatch at
//! runtime to AVX where available, fall back to SSE2 (always present on
//! x86_64), and compile to the scalar reference on other architectures.
//! The scalar and vector paths are semantically identical.

use log::info;

/// Log which instruction sets the mix path will use.
pub fn log_capabilities() {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx") {
            info!("Mix kernels: AVX (8-wide)");
        } else {
            info!("Mix kernels: SSE2 (4-wide)");
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    info!("Mix kernels: scalar");
}

/// `dst[i] += src[i]` over the common prefix of the two slices.
pub fn mix_add(dst: &mut [f32], src: &[f32]) {
    let n = dst.len().min(src.len());
    let dst = &mut dst[..n];
    let src = &src[..n];

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx") {
            unsafe { mix_add_avx(dst, src) };
        } else {
            unsafe { mix_add_sse2(dst, src) };
        }
        return;
    }

    #[cfg(not(target_arch = "x86_64"))]
    mix_add_scalar(dst, src);
}

/// `buf[i] *= gain` in place.
pub fn scale(buf: &mut [f32], gain: f32) {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx") {
            unsafe { scale_avx(buf, gain) };
        } else {
            unsafe { scale_sse2(buf, gain) };
        }
        return;
    }

    #[cfg(not(target_arch = "x86_64"))]
    scale_scalar(buf, gain);
}

fn mix_add_scalar(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d += *s;
    }
}

fn scale_scalar(buf: &mut [f32], gain: f32) {
    for sample in buf.iter_mut() {
        *sample *= gain;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx")]
unsafe fn mix_add_avx(dst: &mut [f32], src: &[f32]) {
    use std::arch::x86_64::*;

    let chunks = dst.len() / 8;
    let dst_ptr = dst.as_mut_ptr();
    let src_ptr = src.as_ptr();
    for i in 0..chunks {
        let off = i * 8;
        let a = _mm256_loadu_ps(dst_ptr.add(off));
        let b = _mm256_loadu_ps(src_ptr.add(off));
        _mm256_storeu_ps(dst_ptr.add(off), _mm256_add_ps(a, b));
    }
    let tail = chunks * 8;
    mix_add_scalar(&mut dst[tail..], &src[tail..]);
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn mix_add_sse2(dst: &mut [f32], src: &[f32]) {
    use std::arch::x86_64::*;

    let chunks = dst.len() / 4;
    let dst_ptr = dst.as_mut_ptr();
    let src_ptr = src.as_ptr();
    for i in 0..chunks {
        let off = i * 4;
        let a = _mm_loadu_ps(dst_ptr.add(off));
        let b = _mm_loadu_ps(src_ptr.add(off));
        _mm_storeu_ps(dst_ptr.add(off), _mm_add_ps(a, b));
    }
    let tail = chunks * 4;
    mix_add_scalar(&mut dst[tail..], &src[tail..]);
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx")]
unsafe fn scale_avx(buf: &mut [f32], gain: f32) {
    use std::arch::x86_64::*;

    let chunks = buf.len() / 8;
    let ptr = buf.as_mut_ptr();
    let g = _mm256_set1_ps(gain);
    for i in 0..chunks {
        let off = i * 8;
        let v = _mm256_loadu_ps(ptr.add(off));
        _mm256_storeu_ps(ptr.add(off), _mm256_mul_ps(v, g));
    }
    let tail = chunks * 8;
    scale_scalar(&mut buf[tail..], gain);
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn scale_sse2(buf: &mut [f32], gain: f32) {
    use std::arch::x86_64::*;

    let chunks = buf.len() / 4;
    let ptr = buf.as_mut_ptr();
    let g = _mm_set1_ps(gain);
    for i in 0..chunks {
        let off = i * 4;
        let v = _mm_loadu_ps(ptr.add(off));
        _mm_storeu_ps(ptr.add(off), _mm_mul_ps(v, g));
    }
    let tail = chunks * 4;
    scale_scalar(&mut buf[tail..], gain);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_add_matches_scalar_reference() {
        // Odd length exercises the tail path.
        let src: Vec<f32> = (0..133).map(|i| (i as f32 * 0.37).sin()).collect();
        let mut dst: Vec<f32> = (0..133).map(|i| (i as f32 * 0.11).cos()).collect();
        let mut reference = dst.clone();

        mix_add(&mut dst, &src);
        mix_add_scalar(&mut reference, &src);

        for (a, b) in dst.iter().zip(reference.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_scale_matches_scalar_reference() {
        let mut buf: Vec<f32> = (0..71).map(|i| i as f32 - 35.0).collect();
        let mut reference = buf.clone();

        scale(&mut buf, 0.75);
        scale_scalar(&mut reference, 0.75);

        for (a, b) in buf.iter().zip(reference.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_mix_add_short_src_only_touches_prefix() {
        let mut dst = vec![1.0f32; 10];
        let src = vec![2.0f32; 4];
        mix_add(&mut dst, &src);
        assert_eq!(&dst[..4], &[3.0, 3.0, 3.0, 3.0]);
        assert_eq!(&dst[4..], &[1.0; 6]);
    }
}
