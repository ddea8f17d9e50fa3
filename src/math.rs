use itertools::izip;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

#[inline]
pub(crate) fn dot(x: &[f64], y: &[f64]) -> f64 {
    assert!(x.len() == y.len());
    x.iter().zip(y).map(|(x, y)| x * y).sum()
}

/// Compute `(x . a, x . b)` in a single pass.
#[inline]
pub(crate) fn scalar_prods2(x: &[f64], a: &[f64], b: &[f64]) -> (f64, f64) {
    let n = x.len();
    assert!(a.len() == n);
    assert!(b.len() == n);

    izip!(x, a, b).fold((0f64, 0f64), |(s1, s2), (x, a, b)| (s1 + x * a, s2 + x * b))
}

/// `out = x + alpha * y`
#[inline]
pub(crate) fn axpy_out(x: &[f64], y: &[f64], alpha: f64, out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| *out = x + alpha * y);
}

/// `y += alpha * x`
#[inline]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], alpha: f64) {
    assert!(x.len() == y.len());
    x.iter().zip(y.iter_mut()).for_each(|(x, y)| *y += alpha * x);
}

pub(crate) fn all_finite(x: &[f64]) -> bool {
    x.iter().all(|val| val.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn check_logaddexp() {
        let a = 2f64.ln();
        let b = 3f64.ln();
        assert_relative_eq!(logaddexp(a, b), 5f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(logaddexp(a, a), 4f64.ln(), epsilon = 1e-12);
        assert_eq!(logaddexp(0., f64::NEG_INFINITY), 0.);
        assert!(logaddexp(f64::NAN, 1.).is_nan());
    }

    #[test]
    fn check_scalar_prods() {
        let x = [1., 2., 3.];
        let a = [1., 0., -1.];
        let b = [0.5, 0.5, 0.5];
        let (ab, bb) = scalar_prods2(&x, &a, &b);
        assert_relative_eq!(ab, -2.);
        assert_relative_eq!(bb, 3.);
        assert_relative_eq!(dot(&x, &b), 3.);
    }

    #[test]
    fn check_axpy() {
        let x = [1., 2.];
        let mut y = [1., 1.];
        axpy(&x, &mut y, 2.);
        assert_eq!(y, [3., 5.]);
        let mut out = [0., 0.];
        axpy_out(&x, &y, -1., &mut out);
        assert_eq!(out, [-2., -3.]);
    }
}
