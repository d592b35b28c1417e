//! Base layers an adapter can wrap

use crate::autograd::{broadcast_rows, gather, matmul, mul, transpose_tensor, Context, Tensor};
use crate::error::{PeftError, Result};
use crate::nn::{channel_broadcast, dropout, Conv1D, Conv2d, Embedding, Layer, Linear, ShapedTensor};

/// The closed set of layer kinds with an adapter implementation
///
/// Adapter deltas are described in the logical `[fan_out, fan_in]` layout;
/// each kind maps that onto its own weight storage.
#[derive(Clone, Debug)]
pub enum TunableBase {
    Linear(Linear),
    Embedding(Embedding),
    Conv1D(Conv1D),
    Conv2d(Conv2d),
}

impl TunableBase {
    /// Take ownership of a base layer, rejecting kinds with no wrapper
    pub fn from_layer(layer: Layer, path: &str, method: &'static str) -> Result<Self> {
        match layer {
            Layer::Linear(l) => Ok(TunableBase::Linear(l)),
            Layer::Embedding(e) => Ok(TunableBase::Embedding(e)),
            Layer::Conv1D(c) => Ok(TunableBase::Conv1D(c)),
            Layer::Conv2d(c) => Ok(TunableBase::Conv2d(c)),
            other => Err(PeftError::UnsupportedLayer { path: path.to_string(), kind: other.kind(), method }),
        }
    }

    pub fn into_layer(self) -> Layer {
        match self {
            TunableBase::Linear(l) => Layer::Linear(l),
            TunableBase::Embedding(e) => Layer::Embedding(e),
            TunableBase::Conv1D(c) => Layer::Conv1D(c),
            TunableBase::Conv2d(c) => Layer::Conv2d(c),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TunableBase::Linear(_) => "Linear",
            TunableBase::Embedding(_) => "Embedding",
            TunableBase::Conv1D(_) => "Conv1D",
            TunableBase::Conv2d(_) => "Conv2d",
        }
    }

    /// Width of the low-rank `A` factor
    pub fn fan_in(&self) -> usize {
        match self {
            TunableBase::Linear(l) => l.in_features,
            TunableBase::Embedding(e) => e.num_embeddings,
            TunableBase::Conv1D(c) => c.nx,
            TunableBase::Conv2d(c) => c.geometry.patch_len(),
        }
    }

    /// Height of the low-rank `B` factor
    pub fn fan_out(&self) -> usize {
        match self {
            TunableBase::Linear(l) => l.out_features,
            TunableBase::Embedding(e) => e.embedding_dim,
            TunableBase::Conv1D(c) => c.nf,
            TunableBase::Conv2d(c) => c.geometry.out_channels,
        }
    }

    /// Channels of the input, as rescaled by feedforward IA³
    pub fn in_channels(&self) -> usize {
        match self {
            TunableBase::Linear(l) => l.in_features,
            TunableBase::Embedding(e) => e.num_embeddings,
            TunableBase::Conv1D(c) => c.nx,
            TunableBase::Conv2d(c) => c.geometry.in_channels,
        }
    }

    pub fn forward(&self, x: &ShapedTensor) -> ShapedTensor {
        match self {
            TunableBase::Linear(l) => l.forward(x),
            TunableBase::Embedding(e) => e.forward(x),
            TunableBase::Conv1D(c) => c.forward(x),
            TunableBase::Conv2d(c) => c.forward(x),
        }
    }

    pub fn weight(&self) -> &Tensor {
        match self {
            TunableBase::Linear(l) => &l.weight,
            TunableBase::Embedding(e) => &e.weight,
            TunableBase::Conv1D(c) => &c.weight,
            TunableBase::Conv2d(c) => &c.weight,
        }
    }

    fn weight_mut(&mut self) -> &mut Tensor {
        match self {
            TunableBase::Linear(l) => &mut l.weight,
            TunableBase::Embedding(e) => &mut e.weight,
            TunableBase::Conv1D(c) => &mut c.weight,
            TunableBase::Conv2d(c) => &mut c.weight,
        }
    }

    pub fn bias(&self) -> Option<&Tensor> {
        match self {
            TunableBase::Linear(l) => l.bias.as_ref(),
            TunableBase::Embedding(_) => None,
            TunableBase::Conv1D(c) => Some(&c.bias),
            TunableBase::Conv2d(c) => c.bias.as_ref(),
        }
    }

    fn bias_mut(&mut self) -> Option<&mut Tensor> {
        match self {
            TunableBase::Linear(l) => l.bias.as_mut(),
            TunableBase::Embedding(_) => None,
            TunableBase::Conv1D(c) => Some(&mut c.bias),
            TunableBase::Conv2d(c) => c.bias.as_mut(),
        }
    }

    pub fn parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = vec![("weight".to_string(), self.weight())];
        if let Some(bias) = self.bias() {
            params.push(("bias".to_string(), bias));
        }
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        match self {
            TunableBase::Linear(l) => {
                let mut params = vec![("weight".to_string(), &mut l.weight)];
                if let Some(bias) = l.bias.as_mut() {
                    params.push(("bias".to_string(), bias));
                }
                params
            }
            TunableBase::Embedding(e) => vec![("weight".to_string(), &mut e.weight)],
            TunableBase::Conv1D(c) => {
                vec![("weight".to_string(), &mut c.weight), ("bias".to_string(), &mut c.bias)]
            }
            TunableBase::Conv2d(c) => {
                let mut params = vec![("weight".to_string(), &mut c.weight)];
                if let Some(bias) = c.bias.as_mut() {
                    params.push(("bias".to_string(), bias));
                }
                params
            }
        }
    }

    pub fn bias_requires_grad(&mut self, requires_grad: bool) {
        if let Some(bias) = self.bias_mut() {
            bias.set_requires_grad(requires_grad);
        }
    }

    /// `W += sign · Δ` for a logical `[fan_out, fan_in]` delta
    pub fn add_delta(&mut self, delta: &[f32], sign: f32) {
        let (fan_out, fan_in) = (self.fan_out(), self.fan_in());
        assert_eq!(delta.len(), fan_out * fan_in, "delta size mismatch");
        let transposed = matches!(self, TunableBase::Conv1D(_) | TunableBase::Embedding(_));
        let weight = self.weight_mut().as_slice_mut();
        for o in 0..fan_out {
            for i in 0..fan_in {
                let slot = if transposed { i * fan_out + o } else { o * fan_in + i };
                weight[slot] += sign * delta[o * fan_in + i];
            }
        }
    }

    /// Multiply weight (and bias) by a per-output-channel factor
    pub fn scale_output_channels(&mut self, factors: &[f32]) {
        let (fan_out, fan_in) = (self.fan_out(), self.fan_in());
        assert_eq!(factors.len(), fan_out, "output factor size mismatch");
        let transposed = matches!(self, TunableBase::Conv1D(_));
        let weight = self.weight_mut().as_slice_mut();
        for o in 0..fan_out {
            for i in 0..fan_in {
                let slot = if transposed { i * fan_out + o } else { o * fan_in + i };
                weight[slot] *= factors[o];
            }
        }
        if let Some(bias) = self.bias_mut() {
            for (b, f) in bias.as_slice_mut().iter_mut().zip(factors) {
                *b *= f;
            }
        }
    }

    /// Multiply weight by a per-input-channel factor
    pub fn scale_input_channels(&mut self, factors: &[f32]) {
        let (fan_out, fan_in) = (self.fan_out(), self.fan_in());
        let channels = self.in_channels();
        assert_eq!(factors.len(), channels, "input factor size mismatch");
        // kernel positions per input channel (1 for dense layers)
        let span = fan_in / channels.max(1);
        let transposed = matches!(self, TunableBase::Conv1D(_));
        let weight = self.weight_mut().as_slice_mut();
        for o in 0..fan_out {
            for i in 0..fan_in {
                let slot = if transposed { i * fan_out + o } else { o * fan_in + i };
                weight[slot] *= factors[i / span];
            }
        }
    }

    /// `scale · (x @ Aᵀ) @ Bᵀ` in the output layout of the base layer
    ///
    /// `a` is `[r, fan_in]`, `b` is `[fan_out, r]`; dropout applies to the
    /// branch input only (never to embedding lookups).
    pub fn low_rank_branch(
        &self,
        x: &ShapedTensor,
        a: &Tensor,
        b: &Tensor,
        r: usize,
        scale: f32,
        dropout_p: f32,
        ctx: &Context,
    ) -> ShapedTensor {
        let (fan_out, fan_in) = (self.fan_out(), self.fan_in());
        let a_t = transpose_tensor(a, r, fan_in);
        let b_t = transpose_tensor(b, fan_out, r);
        match self {
            TunableBase::Linear(_) | TunableBase::Conv1D(_) => {
                let rows = x.rows(fan_in);
                let h = matmul(&dropout(&x.tensor, dropout_p, ctx), &a_t, rows, fan_in, r);
                let out = matmul(&h, &b_t, rows, r, fan_out);
                x.with_last_dim(crate::autograd::scale(&out, scale), fan_out)
            }
            TunableBase::Embedding(e) => {
                let ids = e.token_ids(x);
                let h = Embedding::lookup(&a_t, &ids, r);
                let out = matmul(&h, &b_t, ids.len(), r, fan_out);
                let mut shape = x.shape.clone();
                shape.push(fan_out);
                ShapedTensor::new(crate::autograd::scale(&out, scale), shape)
            }
            TunableBase::Conv2d(c) => {
                let g = &c.geometry;
                let patches = g.unfold(&x.map(|t| dropout(t, dropout_p, ctx)));
                let h = matmul(&patches.columns, &a_t, patches.rows(), fan_in, r);
                let out = matmul(&h, &b_t, patches.rows(), r, fan_out);
                g.fold_rows(&crate::autograd::scale(&out, scale), &patches, fan_out)
            }
        }
    }

    /// Multiply `x` (input layout of this layer) by a per-input-channel vector
    pub fn rescale_input(&self, x: &ShapedTensor, factors: &Tensor) -> ShapedTensor {
        match self {
            TunableBase::Conv2d(_) => x.map(|t| mul(t, &gather(factors, &channel_broadcast(&x.shape)))),
            _ => {
                let rows = x.rows(factors.len());
                x.map(|t| mul(t, &broadcast_rows(factors, rows)))
            }
        }
    }

    /// Multiply `y` (output layout of this layer) by a per-output-channel vector
    pub fn rescale_output(&self, y: &ShapedTensor, factors: &Tensor) -> ShapedTensor {
        match self {
            TunableBase::Conv2d(_) => y.map(|t| mul(t, &gather(factors, &channel_broadcast(&y.shape)))),
            _ => {
                let rows = y.rows(factors.len());
                y.map(|t| mul(t, &broadcast_rows(factors, rows)))
            }
        }
    }
}
