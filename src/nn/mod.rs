//! Host model: base layers and the named layer tree adapters are injected into

mod functional;
pub mod init;
mod layers;
mod sequential;

pub use functional::{channel_broadcast, dropout, Conv2dGeometry, Patches};
pub use layers::{Conv1D, Conv2d, Embedding, Linear};
pub use sequential::Sequential;

use crate::autograd::{log_softmax, relu, Context, Tensor};
use crate::tuners::{ShadowLayer, TunerLayer};

/// Flat tensor plus its logical shape
#[derive(Clone, Debug)]
pub struct ShapedTensor {
    pub tensor: Tensor,
    pub shape: Vec<usize>,
}

impl ShapedTensor {
    pub fn new(tensor: Tensor, shape: Vec<usize>) -> Self {
        assert_eq!(
            tensor.len(),
            shape.iter().product::<usize>(),
            "shape {shape:?} does not match tensor length {}",
            tensor.len()
        );
        Self { tensor, shape }
    }

    /// Constant input (no gradient tracking)
    pub fn from_vec(data: Vec<f32>, shape: Vec<usize>) -> Self {
        Self::new(Tensor::constant(data), shape)
    }

    /// Number of rows when the trailing dimension is `width`
    pub fn rows(&self, width: usize) -> usize {
        assert_eq!(self.shape.last().copied(), Some(width), "trailing dimension mismatch");
        self.tensor.len() / width
    }

    /// Same leading dimensions, new trailing dimension
    pub fn with_last_dim(&self, tensor: Tensor, width: usize) -> Self {
        let mut shape = self.shape.clone();
        if let Some(last) = shape.last_mut() {
            *last = width;
        }
        Self::new(tensor, shape)
    }

    /// Apply a shape-preserving op
    pub fn map(&self, f: impl FnOnce(&Tensor) -> Tensor) -> Self {
        Self::new(f(&self.tensor), self.shape.clone())
    }

    pub fn reshape(&self, shape: Vec<usize>) -> Self {
        Self::new(self.tensor.clone(), shape)
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.tensor.to_vec()
    }

    pub fn allclose(&self, other: &ShapedTensor, tol: f32) -> bool {
        self.shape == other.shape && self.tensor.allclose(&other.tensor, tol)
    }
}

/// A node of the host model
///
/// Closed over the layer kinds the injection engine knows about; adapter
/// wrappers replace base layers in place.
#[derive(Clone, Debug)]
pub enum Layer {
    Linear(Linear),
    Embedding(Embedding),
    Conv1D(Conv1D),
    Conv2d(Conv2d),
    Relu,
    Dropout(f32),
    /// Keep the batch dimension, flatten the rest
    Flatten,
    /// Reshape the non-batch dimensions
    Reshape(Vec<usize>),
    /// Log-softmax over the trailing dimension
    LogSoftmax,
    Identity,
    Sequential(Sequential),
    Tuner(Box<TunerLayer>),
    Shadow(Box<ShadowLayer>),
}

impl Layer {
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Linear(_) => "Linear",
            Layer::Embedding(_) => "Embedding",
            Layer::Conv1D(_) => "Conv1D",
            Layer::Conv2d(_) => "Conv2d",
            Layer::Relu => "ReLU",
            Layer::Dropout(_) => "Dropout",
            Layer::Flatten => "Flatten",
            Layer::Reshape(_) => "Reshape",
            Layer::LogSoftmax => "LogSoftmax",
            Layer::Identity => "Identity",
            Layer::Sequential(_) => "Sequential",
            Layer::Tuner(_) => "TunerLayer",
            Layer::Shadow(_) => "ModulesToSaveWrapper",
        }
    }

    pub fn forward(&self, x: &ShapedTensor, ctx: &Context) -> ShapedTensor {
        match self {
            Layer::Linear(layer) => layer.forward(x),
            Layer::Embedding(layer) => layer.forward(x),
            Layer::Conv1D(layer) => layer.forward(x),
            Layer::Conv2d(layer) => layer.forward(x),
            Layer::Relu => x.map(relu),
            Layer::Dropout(p) => x.map(|t| dropout(t, *p, ctx)),
            Layer::Flatten => {
                let batch = x.shape.first().copied().unwrap_or(1);
                x.reshape(vec![batch, x.tensor.len() / batch.max(1)])
            }
            Layer::Reshape(dims) => {
                let inner: usize = dims.iter().product();
                let mut shape = vec![x.tensor.len() / inner.max(1)];
                shape.extend_from_slice(dims);
                x.reshape(shape)
            }
            Layer::LogSoftmax => {
                let cols = x.shape.last().copied().unwrap_or(1);
                x.map(|t| log_softmax(t, t.len() / cols, cols))
            }
            Layer::Identity => x.clone(),
            Layer::Sequential(seq) => seq.forward(x, ctx),
            Layer::Tuner(tuner) => tuner.forward(x, ctx),
            Layer::Shadow(shadow) => shadow.forward(x, ctx),
        }
    }

    /// Parameters with names relative to this layer
    pub fn parameters(&self) -> Vec<(String, &Tensor)> {
        match self {
            Layer::Linear(l) => weight_and_bias(&l.weight, l.bias.as_ref()),
            Layer::Embedding(e) => vec![("weight".to_string(), &e.weight)],
            Layer::Conv1D(c) => weight_and_bias(&c.weight, Some(&c.bias)),
            Layer::Conv2d(c) => weight_and_bias(&c.weight, c.bias.as_ref()),
            Layer::Sequential(seq) => seq.parameters(),
            Layer::Tuner(tuner) => tuner.parameters(),
            Layer::Shadow(shadow) => shadow.parameters(),
            _ => Vec::new(),
        }
    }

    pub fn parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        match self {
            Layer::Linear(l) => weight_and_bias_mut(&mut l.weight, l.bias.as_mut()),
            Layer::Embedding(e) => vec![("weight".to_string(), &mut e.weight)],
            Layer::Conv1D(c) => weight_and_bias_mut(&mut c.weight, Some(&mut c.bias)),
            Layer::Conv2d(c) => weight_and_bias_mut(&mut c.weight, c.bias.as_mut()),
            Layer::Sequential(seq) => seq.parameters_mut(),
            Layer::Tuner(tuner) => tuner.parameters_mut(),
            Layer::Shadow(shadow) => shadow.parameters_mut(),
            _ => Vec::new(),
        }
    }

    /// Logical shapes, in the order of [`Layer::parameters`]
    ///
    /// Containers and wrappers report flat shapes.
    pub fn parameter_shapes(&self) -> Vec<Vec<usize>> {
        let with_bias = |weight: Vec<usize>, bias: Option<&Tensor>| {
            let mut shapes = vec![weight];
            shapes.extend(bias.map(|b| vec![b.len()]));
            shapes
        };
        match self {
            Layer::Linear(l) => with_bias(l.weight_shape(), l.bias.as_ref()),
            Layer::Embedding(e) => vec![e.weight_shape()],
            Layer::Conv1D(c) => with_bias(c.weight_shape(), Some(&c.bias)),
            Layer::Conv2d(c) => with_bias(c.weight_shape(), c.bias.as_ref()),
            other => other.parameters().iter().map(|(_, t)| vec![t.len()]).collect(),
        }
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        for (_, param) in self.parameters_mut() {
            param.set_requires_grad(requires_grad);
        }
    }

    /// Bias of a base layer, if it has one
    pub fn bias_mut(&mut self) -> Option<&mut Tensor> {
        match self {
            Layer::Linear(l) => l.bias.as_mut(),
            Layer::Conv1D(c) => Some(&mut c.bias),
            Layer::Conv2d(c) => c.bias.as_mut(),
            _ => None,
        }
    }

    /// Structural copy with fresh parameter storage and gradient cells
    pub fn deep_copy(&self) -> Layer {
        let mut copy = self.clone();
        for (_, param) in copy.parameters_mut() {
            *param = param.deep_copy();
        }
        copy
    }
}

fn weight_and_bias<'a>(weight: &'a Tensor, bias: Option<&'a Tensor>) -> Vec<(String, &'a Tensor)> {
    let mut params = vec![("weight".to_string(), weight)];
    if let Some(bias) = bias {
        params.push(("bias".to_string(), bias));
    }
    params
}

fn weight_and_bias_mut<'a>(
    weight: &'a mut Tensor,
    bias: Option<&'a mut Tensor>,
) -> Vec<(String, &'a mut Tensor)> {
    let mut params = vec![("weight".to_string(), weight)];
    if let Some(bias) = bias {
        params.push(("bias".to_string(), bias));
    }
    params
}

impl From<Linear> for Layer {
    fn from(layer: Linear) -> Self {
        Layer::Linear(layer)
    }
}

impl From<Embedding> for Layer {
    fn from(layer: Embedding) -> Self {
        Layer::Embedding(layer)
    }
}

impl From<Conv1D> for Layer {
    fn from(layer: Conv1D) -> Self {
        Layer::Conv1D(layer)
    }
}

impl From<Conv2d> for Layer {
    fn from(layer: Conv2d) -> Self {
        Layer::Conv2d(layer)
    }
}

impl From<Sequential> for Layer {
    fn from(seq: Sequential) -> Self {
        Layer::Sequential(seq)
    }
}
