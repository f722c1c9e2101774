//! Patch-extraction ops underlying the im2col convolution and the pooling
//! layers: `im2col` mixes channels into the column axis (feeds a matmul
//! against a flattened kernel); `unfold` keeps channels separate (feeds a
//! per-channel axis reduction for max/avg pooling). Both save only the input
//! shape and the window geometry for backward — the inverse is a scatter-add
//! (col2im) over the overlapping windows.

use crate::autograd::{apply1, Op, Variable};
use crate::error::{CoreError, CoreResult};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// `(out_h, out_w)` for a convolution/pooling window over `(h, w)`.
pub fn output_hw(h: usize, w: usize, kh: usize, kw: usize, stride: usize, padding: usize) -> CoreResult<(usize, usize)> {
    if h + 2 * padding < kh || w + 2 * padding < kw {
        return Err(CoreError::ShapeMismatch(format!(
            "conv window {}x{} (stride {}, pad {}) does not fit input {}x{}",
            kh, kw, stride, padding, h, w
        )));
    }
    let out_h = (h + 2 * padding - kh) / stride + 1;
    let out_w = (w + 2 * padding - kw) / stride + 1;
    Ok((out_h, out_w))
}

#[derive(Clone, Copy)]
pub struct Window {
    pub kh: usize,
    pub kw: usize,
    pub stride: usize,
    pub padding: usize,
}

struct Im2Col {
    win: Window,
    input_shape: Option<(usize, usize, usize, usize)>,
}

impl Op for Im2Col {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        let x = &inputs[0];
        let dims = x.shape().dims();
        if dims.len() != 4 {
            return Err(CoreError::Unsupported("im2col: input must be rank 4 [batch, channels, h, w]".into()));
        }
        let (batch, channels, h, w) = (dims[0], dims[1], dims[2], dims[3]);
        self.input_shape = Some((batch, channels, h, w));
        let Window { kh, kw, stride, padding } = self.win;
        let (out_h, out_w) = output_hw(h, w, kh, kw, stride, padding)?;
        let patch = channels * kh * kw;
        let mut out = vec![0.0f32; batch * out_h * out_w * patch];
        let data = x.data();
        for b in 0..batch {
            for oh in 0..out_h {
                for ow in 0..out_w {
                    let out_row = (b * out_h * out_w) + oh * out_w + ow;
                    for c in 0..channels {
                        for ki in 0..kh {
                            let in_row = oh * stride + ki;
                            if in_row < padding || in_row - padding >= h {
                                continue;
                            }
                            let ir = in_row - padding;
                            for kj in 0..kw {
                                let in_col = ow * stride + kj;
                                if in_col < padding || in_col - padding >= w {
                                    continue;
                                }
                                let ic = in_col - padding;
                                let src = ((b * channels + c) * h + ir) * w + ic;
                                let dst = out_row * patch + (c * kh * kw + ki * kw + kj);
                                out[dst] = data[src];
                            }
                        }
                    }
                }
            }
        }
        Tensor::from_vec(out, Shape::new(vec![batch, out_h * out_w, patch])).map(|t| vec![t])
    }

    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        let (batch, channels, h, w) = self.input_shape.expect("forward ran first");
        let Window { kh, kw, stride, padding } = self.win;
        let (out_h, out_w) = output_hw(h, w, kh, kw, stride, padding)?;
        let patch = channels * kh * kw;
        let grad = &grad_outputs[0];
        let gdata = grad.data();
        let mut dx = vec![0.0f32; batch * channels * h * w];
        for b in 0..batch {
            for oh in 0..out_h {
                for ow in 0..out_w {
                    let out_row = (b * out_h * out_w) + oh * out_w + ow;
                    for c in 0..channels {
                        for ki in 0..kh {
                            let in_row = oh * stride + ki;
                            if in_row < padding || in_row - padding >= h {
                                continue;
                            }
                            let ir = in_row - padding;
                            for kj in 0..kw {
                                let in_col = ow * stride + kj;
                                if in_col < padding || in_col - padding >= w {
                                    continue;
                                }
                                let ic = in_col - padding;
                                let dst = ((b * channels + c) * h + ir) * w + ic;
                                let src = out_row * patch + (c * kh * kw + ki * kw + kj);
                                dx[dst] += gdata[src];
                            }
                        }
                    }
                }
            }
        }
        let grad_x = Tensor::from_vec(dx, Shape::new(vec![batch, channels, h, w]))?;
        Ok(vec![Some(grad_x)])
    }

    fn name(&self) -> &'static str {
        "Im2Col"
    }
}

/// `[batch, channels, h, w] -> [batch, out_h*out_w, channels*kh*kw]`.
pub fn im2col(x: &Variable, win: Window, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(Im2Col { win, input_shape: None }), vec![x.clone()], training)
}

struct Unfold {
    win: Window,
    input_shape: Option<(usize, usize, usize, usize)>,
}

impl Op for Unfold {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        let x = &inputs[0];
        let dims = x.shape().dims();
        if dims.len() != 4 {
            return Err(CoreError::Unsupported("unfold: input must be rank 4 [batch, channels, h, w]".into()));
        }
        let (batch, channels, h, w) = (dims[0], dims[1], dims[2], dims[3]);
        self.input_shape = Some((batch, channels, h, w));
        let Window { kh, kw, stride, padding } = self.win;
        let (out_h, out_w) = output_hw(h, w, kh, kw, stride, padding)?;
        let window = kh * kw;
        // padded cells read as 0, matching zero-padding on the input.
        let mut out = vec![0.0f32; batch * channels * out_h * out_w * window];
        let data = x.data();
        for b in 0..batch {
            for c in 0..channels {
                for oh in 0..out_h {
                    for ow in 0..out_w {
                        let out_base = (((b * channels + c) * out_h + oh) * out_w + ow) * window;
                        for ki in 0..kh {
                            let in_row = oh * stride + ki;
                            if in_row < padding || in_row - padding >= h {
                                continue;
                            }
                            let ir = in_row - padding;
                            for kj in 0..kw {
                                let in_col = ow * stride + kj;
                                if in_col < padding || in_col - padding >= w {
                                    continue;
                                }
                                let ic = in_col - padding;
                                let src = ((b * channels + c) * h + ir) * w + ic;
                                out[out_base + ki * kw + kj] = data[src];
                            }
                        }
                    }
                }
            }
        }
        Tensor::from_vec(out, Shape::new(vec![batch, channels, out_h, out_w, window])).map(|t| vec![t])
    }

    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        let (batch, channels, h, w) = self.input_shape.expect("forward ran first");
        let Window { kh, kw, stride, padding } = self.win;
        let (out_h, out_w) = output_hw(h, w, kh, kw, stride, padding)?;
        let window = kh * kw;
        let grad = &grad_outputs[0];
        let gdata = grad.data();
        let mut dx = vec![0.0f32; batch * channels * h * w];
        for b in 0..batch {
            for c in 0..channels {
                for oh in 0..out_h {
                    for ow in 0..out_w {
                        let out_base = (((b * channels + c) * out_h + oh) * out_w + ow) * window;
                        for ki in 0..kh {
                            let in_row = oh * stride + ki;
                            if in_row < padding || in_row - padding >= h {
                                continue;
                            }
                            let ir = in_row - padding;
                            for kj in 0..kw {
                                let in_col = ow * stride + kj;
                                if in_col < padding || in_col - padding >= w {
                                    continue;
                                }
                                let ic = in_col - padding;
                                let dst = ((b * channels + c) * h + ir) * w + ic;
                                dx[dst] += gdata[out_base + ki * kw + kj];
                            }
                        }
                    }
                }
            }
        }
        let grad_x = Tensor::from_vec(dx, Shape::new(vec![batch, channels, h, w]))?;
        Ok(vec![Some(grad_x)])
    }

    fn name(&self) -> &'static str {
        "Unfold"
    }
}

/// `[batch, channels, h, w] -> [batch, channels, out_h, out_w, kh*kw]`, one
/// window per output position, channels kept separate (fed into a per-window
/// `max_axis`/`mean_axis` by the pooling layers).
pub fn unfold(x: &Variable, win: Window, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(Unfold { win, input_shape: None }), vec![x.clone()], training)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::ops::reductions;

    #[test]
    fn output_hw_matches_formula() {
        assert_eq!(output_hw(5, 5, 3, 3, 1, 0).unwrap(), (3, 3));
        assert_eq!(output_hw(5, 5, 3, 3, 2, 1).unwrap(), (3, 3));
    }

    #[test]
    fn im2col_round_trip_backward_shape() {
        let x = Variable::leaf(Tensor::ones(Shape::new(vec![1, 1, 4, 4])), true);
        let win = Window { kh: 2, kw: 2, stride: 2, padding: 0 };
        let cols = im2col(&x, win, true).unwrap();
        assert_eq!(cols.shape().dims(), &[1, 4, 4]);
        let loss = reductions::sum(&cols, true).unwrap();
        loss.backward().unwrap();
        assert_eq!(x.grad().unwrap().shape().dims(), &[1, 1, 4, 4]);
        // every input cell is used exactly once at stride == kernel size.
        for v in x.grad().unwrap().data() {
            assert_eq!(*v, 1.0);
        }
    }

    #[test]
    fn unfold_then_max_picks_largest_per_window() {
        let x = Variable::leaf(
            Tensor::from_vec((0..16).map(|i| i as f32).collect(), Shape::new(vec![1, 1, 4, 4])).unwrap(),
            true,
        );
        let win = Window { kh: 2, kw: 2, stride: 2, padding: 0 };
        let windows = unfold(&x, win, true).unwrap();
        let pooled = reductions::max_axis(&windows, -1, true).unwrap();
        assert_eq!(pooled.value().data(), &[5.0, 7.0, 13.0, 15.0]);
    }
}
