#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

/// Runtime check for the AVX2 integer path.
pub fn has_avx2() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        is_x86_feature_detected!("avx2")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

// Lanes wrap on overflow exactly like `dot_i32_scalar`.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
pub unsafe fn dot_i32_x86(a: &[i32], b: &[i32]) -> i32 {
    let len = a.len().min(b.len());
    unsafe {
        let mut acc = _mm256_setzero_si256();
        let mut j = 0;
        while j + 8 <= len {
            let va = _mm256_loadu_si256(a.as_ptr().add(j) as *const __m256i);
            let vb = _mm256_loadu_si256(b.as_ptr().add(j) as *const __m256i);
            acc = _mm256_add_epi32(acc, _mm256_mullo_epi32(va, vb));
            j += 8;
        }

        // Horizontal sum of acc
        let lo = _mm256_castsi256_si128(acc);
        let hi = _mm256_extracti128_si256(acc, 1);
        let s = _mm_add_epi32(lo, hi);
        let s = _mm_add_epi32(s, _mm_shuffle_epi32(s, 0b01_00_11_10));
        let s = _mm_add_epi32(s, _mm_shuffle_epi32(s, 0b10_11_00_01));
        let mut sum = _mm_cvtsi128_si32(s);

        // Tail
        while j < len {
            sum = sum.wrapping_add(a.get_unchecked(j).wrapping_mul(*b.get_unchecked(j)));
            j += 1;
        }
        sum
    }
}

pub fn dot_i32_scalar(a: &[i32], b: &[i32]) -> i32 {
    a.iter()
        .zip(b)
        .fold(0i32, |acc, (&x, &y)| acc.wrapping_add(x.wrapping_mul(y)))
}

#[inline]
pub fn dot_i32(a: &[i32], b: &[i32], avx2: bool) -> i32 {
    #[cfg(target_arch = "x86_64")]
    {
        if avx2 {
            return unsafe { dot_i32_x86(a, b) };
        }
    }
    let _ = avx2;
    dot_i32_scalar(a, b)
}
