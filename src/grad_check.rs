#[cfg(test)]
mod tests {
    use crate::autograd::Tensor;

    fn numerical_grad<F: Fn(&[f64]) -> f64>(f: F, x: &[f64], eps: f64) -> Vec<f64> {
        (0..x.len())
            .map(|i| {
                let mut plus = x.to_vec();
                let mut minus = x.to_vec();
                plus[i] += eps;
                minus[i] -= eps;
                (f(&plus) - f(&minus)) / (2.0 * eps)
            })
            .collect()
    }

    #[test]
    fn test_detach_cuts_graph() {
        let a = Tensor::new(vec![2.0], vec![1]);
        let mut b = a.clone();
        for _ in 0..10 {
            b = b * Tensor::new(vec![1.1], vec![1]);
        }
        assert!(b._ctx.is_some());

        let c = b.detach();
        assert!(c._ctx.is_none());
        assert!((c.item() - b.item()).abs() < 1e-12);

        // Backward through the detached value never reaches `a`.
        let loss = (&c * &c).sum();
        loss.backward();
        assert_eq!(a.grad_values(), vec![0.0]);
    }

    #[test]
    fn test_deep_clone_is_independent() {
        let a = Tensor::new(vec![1.0, 2.0], vec![2]);
        let b = a.deep_clone();
        a.data.write().unwrap()[0] = 5.0;
        assert_eq!(b.values(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_grad_check_matmul() {
        // y = A x, L = sum(y); dL/dx = A^T 1, dL/dA = 1 x^T
        let a = Tensor::new(vec![2.0, 3.0, 4.0, 5.0], vec![2, 2]);
        let x = Tensor::new(vec![1.0, 2.0], vec![2, 1]);

        let loss = a.matmul(&x).sum();
        loss.backward();

        let a_grad = a.grad_values();
        let x_grad = x.grad_values();

        assert!((x_grad[0] - 6.0).abs() < 1e-6);
        assert!((x_grad[1] - 8.0).abs() < 1e-6);
        assert!((a_grad[0] - 1.0).abs() < 1e-6);
        assert!((a_grad[1] - 2.0).abs() < 1e-6);
        assert!((a_grad[2] - 1.0).abs() < 1e-6);
        assert!((a_grad[3] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_grad_check_broadcast_rows() {
        // z = X + b (per row); dL/db = number of rows
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![3, 2]);
        let b = Tensor::new(vec![10.0, 20.0], vec![2]);
        let loss = (x + b.broadcast_rows(3)).sum();
        loss.backward();
        assert_eq!(b.grad_values(), vec![3.0, 3.0]);
    }

    #[test]
    fn test_log_softmax_select_matches_finite_difference() {
        let logits = vec![0.3, -1.2, 0.7, 2.0, 0.1, -0.4];
        let actions = vec![2usize, 0];
        let weights = vec![1.5, -0.5];

        let f = |v: &[f64]| -> f64 {
            let mut total = 0.0;
            for r in 0..2 {
                let row = &v[r * 3..(r + 1) * 3];
                let max = row.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
                let lse = max + row.iter().map(|x| (x - max).exp()).sum::<f64>().ln();
                total += (row[actions[r]] - lse) * weights[r];
            }
            total
        };

        let x = Tensor::new(logits.clone(), vec![2, 3]);
        let logp = x.log_softmax().select_rows(&actions);
        let loss = (logp * Tensor::new(weights.clone(), vec![2])).sum();
        loss.backward();

        let auto = x.grad_values();
        let num = numerical_grad(f, &logits, 1e-6);
        for (a, n) in auto.iter().zip(num.iter()) {
            assert!((a - n).abs() < 1e-5, "auto {} num {}", a, n);
        }
    }

    #[test]
    fn test_tanh_mean_matches_finite_difference() {
        let xs = vec![-0.8, 0.1, 1.3];
        let x = Tensor::new(xs.clone(), vec![3]);
        let loss = x.tanh().mean();
        loss.backward();

        let f = |v: &[f64]| v.iter().map(|x| x.tanh()).sum::<f64>() / v.len() as f64;
        let num = numerical_grad(f, &xs, 1e-6);
        for (a, n) in x.grad_values().iter().zip(num.iter()) {
            assert!((a - n).abs() < 1e-6);
        }
    }

    #[test]
    fn test_exp_of_difference() {
        // d/dx exp(x - y) = exp(x - y), d/dy = -exp(x - y)
        let x = Tensor::new(vec![0.5], vec![1]);
        let y = Tensor::new(vec![0.2], vec![1]);
        let z = (&x - &y).exp();
        z.backward();
        let e = (0.3f64).exp();
        assert!((x.grad_values()[0] - e).abs() < 1e-9);
        assert!((y.grad_values()[0] + e).abs() < 1e-9);
    }
}
