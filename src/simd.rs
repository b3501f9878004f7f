// Flat f64 kernels shared by parameter-vector arithmetic and the distance
// matrix. AVX2 paths are selected at runtime; everything else takes the
// scalar loop.

/// output[i] += scale * row[i]
#[inline(always)]
pub fn add_scaled_row(output: &mut [f64], row: &[f64], scale: f64) {
    let len = output.len();
    assert_eq!(len, row.len(), "Dimension mismatch in add_scaled_row");

    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("avx2") {
            unsafe {
                add_scaled_row_avx2(output, row, scale);
            }
            return;
        }
    }

    for i in 0..len {
        output[i] += scale * row[i];
    }
}

#[inline(always)]
pub fn dot_product(a: &[f64], b: &[f64]) -> f64 {
    let len = a.len();
    assert_eq!(len, b.len(), "Dimension mismatch in dot_product");

    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("avx2") {
            unsafe {
                return dot_product_avx2(a, b);
            }
        }
    }

    let mut sum = 0.0;
    for i in 0..len {
        sum += a[i] * b[i];
    }
    sum
}

#[inline(always)]
pub fn vector_scale(row: &mut [f64], scale: f64) {
    for v in row.iter_mut() {
        *v *= scale;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn add_scaled_row_avx2(output: &mut [f64], row: &[f64], scale: f64) {
    use core::arch::x86_64::*;
    let len = output.len();
    let mut i = 0;
    let scale_vec = _mm256_set1_pd(scale);

    while i + 4 <= len {
        let out_ptr = output.as_mut_ptr().add(i);
        let out = _mm256_loadu_pd(out_ptr);
        let rowv = _mm256_loadu_pd(row.as_ptr().add(i));
        _mm256_storeu_pd(out_ptr, _mm256_add_pd(out, _mm256_mul_pd(rowv, scale_vec)));
        i += 4;
    }

    while i < len {
        *output.get_unchecked_mut(i) += scale * *row.get_unchecked(i);
        i += 1;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn dot_product_avx2(a: &[f64], b: &[f64]) -> f64 {
    use core::arch::x86_64::*;
    let len = a.len();
    let mut i = 0;
    let mut acc0 = _mm256_setzero_pd();
    let mut acc1 = _mm256_setzero_pd();

    while i + 8 <= len {
        let a0 = _mm256_loadu_pd(a.as_ptr().add(i));
        let b0 = _mm256_loadu_pd(b.as_ptr().add(i));
        acc0 = _mm256_add_pd(acc0, _mm256_mul_pd(a0, b0));

        let a1 = _mm256_loadu_pd(a.as_ptr().add(i + 4));
        let b1 = _mm256_loadu_pd(b.as_ptr().add(i + 4));
        acc1 = _mm256_add_pd(acc1, _mm256_mul_pd(a1, b1));

        i += 8;
    }

    while i + 4 <= len {
        let av = _mm256_loadu_pd(a.as_ptr().add(i));
        let bv = _mm256_loadu_pd(b.as_ptr().add(i));
        acc0 = _mm256_add_pd(acc0, _mm256_mul_pd(av, bv));
        i += 4;
    }

    acc0 = _mm256_add_pd(acc0, acc1);

    let mut tmp = [0.0; 4];
    _mm256_storeu_pd(tmp.as_mut_ptr(), acc0);
    let mut sum = tmp[0] + tmp[1] + tmp[2] + tmp[3];

    while i < len {
        sum += *a.get_unchecked(i) * *b.get_unchecked(i);
        i += 1;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_product_matches_scalar() {
        let a: Vec<f64> = (0..13).map(|i| i as f64 * 0.5 - 2.0).collect();
        let b: Vec<f64> = (0..13).map(|i| 1.0 - i as f64 * 0.25).collect();
        let expected: f64 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        assert!((dot_product(&a, &b) - expected).abs() < 1e-9);
    }

    #[test]
    fn add_scaled_row_accumulates() {
        let mut out = vec![1.0; 7];
        let row: Vec<f64> = (0..7).map(|i| i as f64).collect();
        add_scaled_row(&mut out, &row, 2.0);
        for (i, v) in out.iter().enumerate() {
            assert!((v - (1.0 + 2.0 * i as f64)).abs() < 1e-12);
        }
    }
}
