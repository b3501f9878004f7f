use crate::rng::Rng;
use std::collections::HashSet;
use std::ops::{Add, Mul, Neg, Sub};
use std::sync::{Arc, RwLock};

// --- Autograd Engine ---
//
// Reverse-mode autodiff over flat row-major f64 buffers. Cloning a Tensor
// shares its buffers (a handle, like a parameter reference); use
// `deep_clone` for an independent copy.

#[derive(Clone)]
pub struct Tensor {
    pub data: Arc<RwLock<Vec<f64>>>,
    pub grad: Arc<RwLock<Vec<f64>>>,
    pub shape: Vec<usize>,
    pub _ctx: Option<Arc<Context>>, // Keeps the graph alive
}

pub struct Context {
    pub parents: Vec<Tensor>,
    pub backward_op: Box<dyn Fn(&Vec<f64>, &Vec<Tensor>) + Send + Sync>, // receives grad_output, parents
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("requires_graph", &self._ctx.is_some())
            .finish()
    }
}

impl Tensor {
    pub fn new(data: Vec<f64>, shape: Vec<usize>) -> Self {
        let len = data.len();
        assert_eq!(len, shape.iter().product::<usize>(), "Data length must match shape");
        Tensor {
            data: Arc::new(RwLock::new(data)),
            grad: Arc::new(RwLock::new(vec![0.0; len])),
            shape,
            _ctx: None,
        }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Tensor::new(vec![0.0; len], shape)
    }

    pub fn rand(shape: Vec<usize>, min: f64, max: f64, seed: u64) -> Self {
        let len = shape.iter().product();
        let mut rng = Rng::from_seed(seed);
        let data = (0..len).map(|_| min + rng.next_f64() * (max - min)).collect();
        Tensor::new(data, shape)
    }

    fn from_op(data: Vec<f64>, shape: Vec<usize>, parents: Vec<Tensor>, backward_op: Box<dyn Fn(&Vec<f64>, &Vec<Tensor>) + Send + Sync>) -> Tensor {
        let len = data.len();
        Tensor {
            data: Arc::new(RwLock::new(data)),
            grad: Arc::new(RwLock::new(vec![0.0; len])),
            shape,
            _ctx: Some(Arc::new(Context { parents, backward_op })),
        }
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the values.
    pub fn values(&self) -> Vec<f64> {
        self.data.read().unwrap().clone()
    }

    pub fn item(&self) -> f64 {
        self.data.read().unwrap()[0]
    }

    pub fn grad_values(&self) -> Vec<f64> {
        self.grad.read().unwrap().clone()
    }

    /// Same values, cut from the graph. Gradients do not flow back.
    pub fn detach(&self) -> Tensor {
        Tensor::new(self.values(), self.shape.clone())
    }

    /// Independent copy of values and gradient buffers.
    pub fn deep_clone(&self) -> Tensor {
        Tensor {
            data: Arc::new(RwLock::new(self.values())),
            grad: Arc::new(RwLock::new(self.grad_values())),
            shape: self.shape.clone(),
            _ctx: None,
        }
    }

    pub fn backward(&self) {
        let mut visited = HashSet::new();
        let mut topo = Vec::new();
        fn build_topo(t: &Tensor, visited: &mut HashSet<usize>, topo: &mut Vec<Tensor>) {
            // Pointer address of the grad buffer is the node id
            let id = Arc::as_ptr(&t.grad) as usize;
            if visited.insert(id) {
                if let Some(ctx) = &t._ctx {
                    for parent in &ctx.parents {
                        build_topo(parent, visited, topo);
                    }
                }
                topo.push(t.clone());
            }
        }

        build_topo(self, &mut visited, &mut topo);

        {
            let mut g = self.grad.write().unwrap();
            for v in g.iter_mut() {
                *v = 1.0;
            }
        }

        for t in topo.iter().rev() {
            if let Some(ctx) = &t._ctx {
                let grad = t.grad.read().unwrap();
                (ctx.backward_op)(&grad, &ctx.parents);
            }
        }
    }

    pub fn zero_grad(&self) {
        let mut g = self.grad.write().unwrap();
        for v in g.iter_mut() {
            *v = 0.0;
        }
    }

    // Operations

    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert!(self.shape.len() <= 2 && other.shape.len() == 2);

        let (m, k) = if self.shape.len() == 1 { (1, self.shape[0]) } else { (self.shape[0], self.shape[1]) };
        let (k2, n) = (other.shape[0], other.shape[1]);
        assert_eq!(k, k2, "MatMul dimension mismatch");

        let mut out_data = vec![0.0; m * n];
        {
            let lhs_data = self.data.read().unwrap();
            let rhs_data = other.data.read().unwrap();
            for r in 0..m {
                for i in 0..k {
                    let a = lhs_data[r * k + i];
                    if a == 0.0 {
                        continue;
                    }
                    let row = &rhs_data[i * n..(i + 1) * n];
                    let out = &mut out_data[r * n..(r + 1) * n];
                    crate::simd::add_scaled_row(out, row, a);
                }
            }
        }

        let out_shape = if self.shape.len() == 1 { vec![n] } else { vec![m, n] };

        Tensor::from_op(
            out_data,
            out_shape,
            vec![self.clone(), other.clone()],
            Box::new(move |grad_out, parents| {
                let lhs = &parents[0];
                let rhs = &parents[1];
                let lhs_data = lhs.data.read().unwrap();
                let rhs_data = rhs.data.read().unwrap();

                // dL/dLHS = grad_out * RHS^T
                {
                    let mut lhs_grad = lhs.grad.write().unwrap();
                    for r in 0..m {
                        for i in 0..k {
                            let row = &rhs_data[i * n..(i + 1) * n];
                            let g = &grad_out[r * n..(r + 1) * n];
                            lhs_grad[r * k + i] += crate::simd::dot_product(g, row);
                        }
                    }
                }

                // dL/dRHS = LHS^T * grad_out
                {
                    let mut rhs_grad = rhs.grad.write().unwrap();
                    for r in 0..m {
                        let g = &grad_out[r * n..(r + 1) * n];
                        for i in 0..k {
                            let a = lhs_data[r * k + i];
                            crate::simd::add_scaled_row(&mut rhs_grad[i * n..(i + 1) * n], g, a);
                        }
                    }
                }
            }),
        )
    }

    pub fn relu(&self) -> Tensor {
        let data: Vec<f64> = self.data.read().unwrap().iter().map(|&x| if x > 0.0 { x } else { 0.0 }).collect();
        Tensor::from_op(
            data,
            self.shape.clone(),
            vec![self.clone()],
            Box::new(move |grad_out, parents| {
                let input = &parents[0];
                let input_data = input.data.read().unwrap();
                let mut inp_grad = input.grad.write().unwrap();
                for (i, &g) in grad_out.iter().enumerate() {
                    if input_data[i] > 0.0 {
                        inp_grad[i] += g;
                    }
                }
            }),
        )
    }

    pub fn tanh(&self) -> Tensor {
        let out: Vec<f64> = self.data.read().unwrap().iter().map(|&x| x.tanh()).collect();
        let cached = out.clone();
        Tensor::from_op(
            out,
            self.shape.clone(),
            vec![self.clone()],
            Box::new(move |grad_out, parents| {
                let mut inp_grad = parents[0].grad.write().unwrap();
                for (i, &g) in grad_out.iter().enumerate() {
                    inp_grad[i] += g * (1.0 - cached[i] * cached[i]);
                }
            }),
        )
    }

    pub fn exp(&self) -> Tensor {
        let out: Vec<f64> = self.data.read().unwrap().iter().map(|&x| x.exp()).collect();
        let cached = out.clone();
        Tensor::from_op(
            out,
            self.shape.clone(),
            vec![self.clone()],
            Box::new(move |grad_out, parents| {
                let mut inp_grad = parents[0].grad.write().unwrap();
                for (i, &g) in grad_out.iter().enumerate() {
                    inp_grad[i] += g * cached[i];
                }
            }),
        )
    }

    pub fn sum(&self) -> Tensor {
        let sum_val: f64 = self.data.read().unwrap().iter().sum();
        Tensor::from_op(
            vec![sum_val],
            vec![1],
            vec![self.clone()],
            Box::new(move |grad_out, parents| {
                let mut inp_grad = parents[0].grad.write().unwrap();
                let g = grad_out[0];
                for v in inp_grad.iter_mut() {
                    *v += g;
                }
            }),
        )
    }

    pub fn mean(&self) -> Tensor {
        let len = self.len();
        let sum_val: f64 = self.data.read().unwrap().iter().sum();
        Tensor::from_op(
            vec![sum_val / len as f64],
            vec![1],
            vec![self.clone()],
            Box::new(move |grad_out, parents| {
                let mut inp_grad = parents[0].grad.write().unwrap();
                let g = grad_out[0] / len as f64;
                for v in inp_grad.iter_mut() {
                    *v += g;
                }
            }),
        )
    }

    /// Row vector `[n]` repeated into `[rows, n]` (bias add over a batch).
    pub fn broadcast_rows(&self, rows: usize) -> Tensor {
        assert_eq!(self.shape.len(), 1, "broadcast_rows expects a 1-D tensor");
        let n = self.shape[0];
        let src = self.values();
        let mut data = Vec::with_capacity(rows * n);
        for _ in 0..rows {
            data.extend_from_slice(&src);
        }
        Tensor::from_op(
            data,
            vec![rows, n],
            vec![self.clone()],
            Box::new(move |grad_out, parents| {
                let mut inp_grad = parents[0].grad.write().unwrap();
                for r in 0..rows {
                    for c in 0..n {
                        inp_grad[c] += grad_out[r * n + c];
                    }
                }
            }),
        )
    }

    pub fn reshape(&self, new_shape: Vec<usize>) -> Tensor {
        let len: usize = new_shape.iter().product();
        assert_eq!(len, self.len(), "Reshape dimension mismatch");
        Tensor::from_op(
            self.values(),
            new_shape,
            vec![self.clone()],
            Box::new(move |grad_out, parents| {
                let mut inp_grad = parents[0].grad.write().unwrap();
                for (i, &g) in grad_out.iter().enumerate() {
                    inp_grad[i] += g;
                }
            }),
        )
    }

    /// Row-wise log-softmax of a `[rows, cols]` tensor, max-shifted.
    pub fn log_softmax(&self) -> Tensor {
        assert_eq!(self.shape.len(), 2, "log_softmax expects [rows, cols]");
        let (rows, cols) = (self.shape[0], self.shape[1]);
        let x = self.data.read().unwrap();
        let mut out = vec![0.0; rows * cols];
        for r in 0..rows {
            let row = &x[r * cols..(r + 1) * cols];
            let max = row.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            let lse = max + row.iter().map(|&v| (v - max).exp()).sum::<f64>().ln();
            for c in 0..cols {
                out[r * cols + c] = row[c] - lse;
            }
        }
        let cached = out.clone();
        drop(x);
        Tensor::from_op(
            out,
            vec![rows, cols],
            vec![self.clone()],
            Box::new(move |grad_out, parents| {
                let mut inp_grad = parents[0].grad.write().unwrap();
                for r in 0..rows {
                    let g = &grad_out[r * cols..(r + 1) * cols];
                    let g_sum: f64 = g.iter().sum();
                    for c in 0..cols {
                        let p = cached[r * cols + c].exp();
                        inp_grad[r * cols + c] += g[c] - p * g_sum;
                    }
                }
            }),
        )
    }

    /// Picks column `index[r]` from every row of a `[rows, cols]` tensor.
    pub fn select_rows(&self, index: &[usize]) -> Tensor {
        assert_eq!(self.shape.len(), 2, "select_rows expects [rows, cols]");
        let (rows, cols) = (self.shape[0], self.shape[1]);
        assert_eq!(rows, index.len(), "select_rows index length mismatch");
        let x = self.data.read().unwrap();
        let data: Vec<f64> = index
            .iter()
            .enumerate()
            .map(|(r, &c)| {
                assert!(c < cols, "select_rows column out of range");
                x[r * cols + c]
            })
            .collect();
        drop(x);
        let index = index.to_vec();
        Tensor::from_op(
            data,
            vec![rows],
            vec![self.clone()],
            Box::new(move |grad_out, parents| {
                let mut inp_grad = parents[0].grad.write().unwrap();
                for (r, &c) in index.iter().enumerate() {
                    inp_grad[r * cols + c] += grad_out[r];
                }
            }),
        )
    }
}

// Operator overloads

impl Add for Tensor {
    type Output = Tensor;
    fn add(self, rhs: Tensor) -> Tensor {
        assert_eq!(self.shape, rhs.shape, "Add shape mismatch");
        let data: Vec<f64> = {
            let a = self.data.read().unwrap();
            let b = rhs.data.read().unwrap();
            a.iter().zip(b.iter()).map(|(x, y)| x + y).collect()
        };
        let shape = self.shape.clone();
        Tensor::from_op(
            data,
            shape,
            vec![self, rhs],
            Box::new(|grad_out, parents| {
                for parent in parents.iter() {
                    let mut grad = parent.grad.write().unwrap();
                    for (i, &g) in grad_out.iter().enumerate() {
                        grad[i] += g;
                    }
                }
            }),
        )
    }
}

impl<'a, 'b> Add<&'b Tensor> for &'a Tensor {
    type Output = Tensor;
    fn add(self, rhs: &'b Tensor) -> Tensor {
        self.clone() + rhs.clone()
    }
}

impl Sub for Tensor {
    type Output = Tensor;
    fn sub(self, rhs: Tensor) -> Tensor {
        assert_eq!(self.shape, rhs.shape, "Sub shape mismatch");
        let data: Vec<f64> = {
            let a = self.data.read().unwrap();
            let b = rhs.data.read().unwrap();
            a.iter().zip(b.iter()).map(|(x, y)| x - y).collect()
        };
        let shape = self.shape.clone();
        Tensor::from_op(
            data,
            shape,
            vec![self, rhs],
            Box::new(|grad_out, parents| {
                {
                    let mut lhs_grad = parents[0].grad.write().unwrap();
                    for (i, &g) in grad_out.iter().enumerate() {
                        lhs_grad[i] += g;
                    }
                }
                {
                    let mut rhs_grad = parents[1].grad.write().unwrap();
                    for (i, &g) in grad_out.iter().enumerate() {
                        rhs_grad[i] -= g;
                    }
                }
            }),
        )
    }
}

impl<'a, 'b> Sub<&'b Tensor> for &'a Tensor {
    type Output = Tensor;
    fn sub(self, rhs: &'b Tensor) -> Tensor {
        self.clone() - rhs.clone()
    }
}

impl Mul for Tensor {
    type Output = Tensor;
    fn mul(self, rhs: Tensor) -> Tensor {
        assert_eq!(self.shape, rhs.shape, "Mul shape mismatch");
        let data: Vec<f64> = {
            let a = self.data.read().unwrap();
            let b = rhs.data.read().unwrap();
            a.iter().zip(b.iter()).map(|(x, y)| x * y).collect()
        };
        let shape = self.shape.clone();
        Tensor::from_op(
            data,
            shape,
            vec![self, rhs],
            Box::new(|grad_out, parents| {
                let lhs = &parents[0];
                let rhs = &parents[1];
                let lhs_data = lhs.values();
                let rhs_data = rhs.values();
                if Arc::ptr_eq(&lhs.grad, &rhs.grad) {
                    let mut grad = lhs.grad.write().unwrap();
                    for (i, &g) in grad_out.iter().enumerate() {
                        grad[i] += g * (lhs_data[i] + rhs_data[i]);
                    }
                } else {
                    {
                        let mut lhs_grad = lhs.grad.write().unwrap();
                        for (i, &g) in grad_out.iter().enumerate() {
                            lhs_grad[i] += g * rhs_data[i];
                        }
                    }
                    {
                        let mut rhs_grad = rhs.grad.write().unwrap();
                        for (i, &g) in grad_out.iter().enumerate() {
                            rhs_grad[i] += g * lhs_data[i];
                        }
                    }
                }
            }),
        )
    }
}

impl<'a, 'b> Mul<&'b Tensor> for &'a Tensor {
    type Output = Tensor;
    fn mul(self, rhs: &'b Tensor) -> Tensor {
        self.clone() * rhs.clone()
    }
}

impl Neg for Tensor {
    type Output = Tensor;
    fn neg(self) -> Tensor {
        let data: Vec<f64> = self.data.read().unwrap().iter().map(|&x| -x).collect();
        let shape = self.shape.clone();
        Tensor::from_op(
            data,
            shape,
            vec![self],
            Box::new(|grad_out, parents| {
                let mut inp_grad = parents[0].grad.write().unwrap();
                for (i, &g) in grad_out.iter().enumerate() {
                    inp_grad[i] -= g;
                }
            }),
        )
    }
}

impl<'a> Neg for &'a Tensor {
    type Output = Tensor;
    fn neg(self) -> Tensor {
        -self.clone()
    }
}
