//! Stateless building blocks shared by layers and adapter branches

use super::ShapedTensor;
use crate::autograd::{gather, mul, Context, Tensor};
use rand::Rng;

/// Inverted dropout: zero with probability `p`, scale survivors by `1/(1-p)`
///
/// Identity in eval mode or when `p == 0`.
pub fn dropout(x: &Tensor, p: f32, ctx: &Context) -> Tensor {
    if !ctx.is_training() || p <= 0.0 {
        return x.clone();
    }
    let keep = 1.0 - p;
    let mask: Vec<f32> = {
        let mut rng = ctx.rng();
        (0..x.len()).map(|_| if rng.random::<f32>() < keep { 1.0 / keep } else { 0.0 }).collect()
    };
    mul(x, &Tensor::constant(mask))
}

/// Geometry of a 2D convolution over NCHW input
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Conv2dGeometry {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: (usize, usize),
    pub stride: usize,
    pub padding: usize,
}

/// Unfolded convolution input: one row per output position
pub struct Patches {
    /// `[batch * out_h * out_w, in_channels * kh * kw]`
    pub columns: Tensor,
    pub batch: usize,
    pub out_h: usize,
    pub out_w: usize,
}

impl Patches {
    pub fn rows(&self) -> usize {
        self.batch * self.out_h * self.out_w
    }
}

impl Conv2dGeometry {
    /// Length of one unfolded patch
    pub fn patch_len(&self) -> usize {
        self.in_channels * self.kernel.0 * self.kernel.1
    }

    pub fn output_hw(&self, h: usize, w: usize) -> (usize, usize) {
        let (kh, kw) = self.kernel;
        (
            (h + 2 * self.padding - kh) / self.stride + 1,
            (w + 2 * self.padding - kw) / self.stride + 1,
        )
    }

    /// im2col: gather every receptive field into a row (zero padding outside the image)
    pub fn unfold(&self, x: &ShapedTensor) -> Patches {
        assert_eq!(x.shape.len(), 4, "conv2d expects NCHW input, got {:?}", x.shape);
        let (n, c, h, w) = (x.shape[0], x.shape[1], x.shape[2], x.shape[3]);
        assert_eq!(c, self.in_channels, "conv2d channel mismatch");
        let (kh, kw) = self.kernel;
        let (out_h, out_w) = self.output_hw(h, w);
        let pad = self.padding as isize;

        let mut indices = Vec::with_capacity(n * out_h * out_w * self.patch_len());
        for b in 0..n {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    for ch in 0..c {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (oy * self.stride + ky) as isize - pad;
                                let ix = (ox * self.stride + kx) as isize - pad;
                                let inside =
                                    iy >= 0 && ix >= 0 && (iy as usize) < h && (ix as usize) < w;
                                indices.push(inside.then(|| {
                                    ((b * c + ch) * h + iy as usize) * w + ix as usize
                                }));
                            }
                        }
                    }
                }
            }
        }

        Patches { columns: gather(&x.tensor, &indices), batch: n, out_h, out_w }
    }

    /// Reorder `[batch * out_h * out_w, channels]` rows into NCHW
    pub fn fold_rows(&self, rows: &Tensor, patches: &Patches, channels: usize) -> ShapedTensor {
        let (n, oh, ow) = (patches.batch, patches.out_h, patches.out_w);
        let mut indices = Vec::with_capacity(n * channels * oh * ow);
        for b in 0..n {
            for ch in 0..channels {
                for y in 0..oh {
                    for x in 0..ow {
                        indices.push(Some(((b * oh + y) * ow + x) * channels + ch));
                    }
                }
            }
        }
        ShapedTensor::new(gather(rows, &indices), vec![n, channels, oh, ow])
    }
}

/// Indices repeating a per-channel vector over an NCHW tensor
pub fn channel_broadcast(shape: &[usize]) -> Vec<Option<usize>> {
    let (n, c) = (shape[0], shape[1]);
    let spatial: usize = shape[2..].iter().product();
    (0..n * c * spatial).map(|i| Some((i / spatial) % c)).collect()
}
