use ndarray::{Array, Array1, Array2, Array4, ArrayView3, Axis, Dimension};
use rand::Rng;

use crate::error::{ensure_dim, LayerError, Result};
use crate::params::{join, NamedView, NamedViewMut, Parameters};

/// Default uniform bound for a layer with `fan_in` inputs per output.
fn init_bound(fan_in: usize) -> f32 {
    1.0 / (fan_in.max(1) as f32).sqrt()
}

fn check_bias(layer: &'static str, bias: Option<&Array1<f32>>, out: usize) -> Result<()> {
    match bias {
        Some(b) => ensure_dim(layer, "bias length", out, b.len()),
        None => Ok(()),
    }
}

/// Fully connected layer.
#[derive(Clone, Debug)]
pub struct Linear {
    weight: Array2<f32>, // out x in
    bias: Option<Array1<f32>>,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, bias: bool) -> Self {
        Self::with_rng(in_features, out_features, bias, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng>(in_features: usize, out_features: usize, bias: bool, rng: &mut R) -> Self {
        let bound = init_bound(in_features);
        let weight = Array2::from_shape_fn((out_features, in_features), |_| rng.gen_range(-bound..bound));
        let bias = if bias {
            Some(Array1::from_shape_fn(out_features, |_| rng.gen_range(-bound..bound)))
        } else {
            None
        };
        Self { weight, bias }
    }

    pub fn from_parts(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Result<Self> {
        check_bias("Linear", bias.as_ref(), weight.nrows())?;
        Ok(Self { weight, bias })
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Array1<f32>> {
        self.bias.as_ref()
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// `[batch, in] -> [batch, out]`
    pub fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        ensure_dim("Linear", "input features", self.in_features(), x.ncols())?;
        let mut y = x.dot(&self.weight.t());
        if let Some(b) = &self.bias {
            y += &b.view().insert_axis(Axis(0));
        }
        Ok(y)
    }
}

impl Parameters for Linear {
    fn collect_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<NamedView<'a>>) {
        out.push((join(prefix, "weight"), self.weight.view().into_dyn()));
        if let Some(b) = &self.bias {
            out.push((join(prefix, "bias"), b.view().into_dyn()));
        }
    }

    fn collect_parameters_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedViewMut<'a>>) {
        out.push((join(prefix, "weight"), self.weight.view_mut().into_dyn()));
        if let Some(b) = &mut self.bias {
            out.push((join(prefix, "bias"), b.view_mut().into_dyn()));
        }
    }
}

/// Stride-1 2D convolution with "same" zero padding over NCHW input.
#[derive(Clone, Debug)]
pub struct Conv2d {
    weight: Array4<f32>, // out x in x k x k
    bias: Option<Array1<f32>>,
}

impl Conv2d {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize, bias: bool) -> Result<Self> {
        Self::with_rng(in_channels, out_channels, kernel_size, bias, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        bias: bool,
        rng: &mut R,
    ) -> Result<Self> {
        check_kernel(kernel_size)?;
        let bound = init_bound(in_channels * kernel_size * kernel_size);
        let weight = Array4::from_shape_fn(
            (out_channels, in_channels, kernel_size, kernel_size),
            |_| rng.gen_range(-bound..bound),
        );
        let bias = if bias {
            Some(Array1::from_shape_fn(out_channels, |_| rng.gen_range(-bound..bound)))
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    /// Build from an explicit `[out, in, k, k]` kernel.
    pub fn from_parts(weight: Array4<f32>, bias: Option<Array1<f32>>) -> Result<Self> {
        let (out_channels, _, kh, kw) = weight.dim();
        ensure_dim("Conv2d", "kernel width", kh, kw)?;
        check_kernel(kh)?;
        check_bias("Conv2d", bias.as_ref(), out_channels)?;
        // forward() reshapes the kernel in place, which needs row-major storage
        let weight = weight.as_standard_layout().into_owned();
        Ok(Self { weight, bias })
    }

    pub fn weight(&self) -> &Array4<f32> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Array1<f32>> {
        self.bias.as_ref()
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    pub fn kernel_size(&self) -> usize {
        self.weight.dim().2
    }

    /// `[batch, in, h, w] -> [batch, out, h, w]`
    pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let (out_channels, in_channels, k, _) = self.weight.dim();
        let (batch, channels, height, width) = x.dim();
        ensure_dim("Conv2d", "input channels", in_channels, channels)?;

        let kernel = self.weight.view().into_shape((out_channels, in_channels * k * k))?;
        let mut out = Array4::<f32>::zeros((batch, out_channels, height, width));
        for (sample, mut dest) in x.outer_iter().zip(out.outer_iter_mut()) {
            let cols = im2col(sample, k);
            let mut y = kernel.dot(&cols);
            if let Some(b) = &self.bias {
                y += &b.view().insert_axis(Axis(1));
            }
            dest.assign(&y.into_shape((out_channels, height, width))?);
        }
        Ok(out)
    }
}

impl Parameters for Conv2d {
    fn collect_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<NamedView<'a>>) {
        out.push((join(prefix, "weight"), self.weight.view().into_dyn()));
        if let Some(b) = &self.bias {
            out.push((join(prefix, "bias"), b.view().into_dyn()));
        }
    }

    fn collect_parameters_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedViewMut<'a>>) {
        out.push((join(prefix, "weight"), self.weight.view_mut().into_dyn()));
        if let Some(b) = &mut self.bias {
            out.push((join(prefix, "bias"), b.view_mut().into_dyn()));
        }
    }
}

fn check_kernel(kernel_size: usize) -> Result<()> {
    if kernel_size % 2 == 1 {
        Ok(())
    } else {
        Err(LayerError::InvalidConfig(format!(
            "kernel size must be odd for same padding, got {kernel_size}"
        )))
    }
}

/// Unfold `[c, h, w]` into `[c * k * k, h * w]` patch columns, zero padded by `k / 2`.
fn im2col(x: ArrayView3<f32>, k: usize) -> Array2<f32> {
    let (channels, height, width) = x.dim();
    let pad = k / 2;
    let mut cols = Array2::<f32>::zeros((channels * k * k, height * width));
    for c in 0..channels {
        for ky in 0..k {
            for kx in 0..k {
                let row = (c * k + ky) * k + kx;
                for y in 0..height {
                    let iy = match (y + ky).checked_sub(pad) {
                        Some(iy) if iy < height => iy,
                        _ => continue,
                    };
                    for xx in 0..width {
                        if let Some(ix) = (xx + kx).checked_sub(pad).filter(|&ix| ix < width) {
                            cols[[row, y * width + xx]] = x[[c, iy, ix]];
                        }
                    }
                }
            }
        }
    }
    cols
}

/// Instance normalization without affine parameters.
#[derive(Clone, Debug)]
pub struct InstanceNorm2d {
    num_features: usize,
    eps: f32,
}

impl InstanceNorm2d {
    pub fn new(num_features: usize) -> Self {
        Self { num_features, eps: 1e-5 }
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// Normalizes every `[h, w]` plane to zero mean and unit (biased) variance.
    pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>> {
        ensure_dim("InstanceNorm2d", "channels", self.num_features, x.dim().1)?;
        let mut out = x.to_owned();
        for mut sample in out.outer_iter_mut() {
            for mut plane in sample.outer_iter_mut() {
                let n = plane.len();
                if n == 0 {
                    continue;
                }
                let mean = plane.sum() / n as f32;
                let var = plane.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
                let inv_std = 1.0 / (var + self.eps).sqrt();
                plane.mapv_inplace(|v| (v - mean) * inv_std);
            }
        }
        Ok(out)
    }
}

impl Parameters for InstanceNorm2d {
    fn collect_parameters<'a>(&'a self, _prefix: &str, _out: &mut Vec<NamedView<'a>>) {}

    fn collect_parameters_mut<'a>(&'a mut self, _prefix: &str, _out: &mut Vec<NamedViewMut<'a>>) {}
}

pub fn relu<D: Dimension>(x: &Array<f32, D>) -> Array<f32, D> {
    x.mapv(|v| v.max(0.0))
}

pub fn sigmoid<D: Dimension>(x: &Array<f32, D>) -> Array<f32, D> {
    x.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

/// ReLU followed by a bias-free 3x3 convolution.
#[derive(Clone, Debug)]
pub struct ReluConv {
    conv: Conv2d,
}

impl ReluConv {
    pub fn new(in_channels: usize, out_channels: usize) -> Result<Self> {
        Self::with_rng(in_channels, out_channels, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng>(in_channels: usize, out_channels: usize, rng: &mut R) -> Result<Self> {
        Ok(Self { conv: Conv2d::with_rng(in_channels, out_channels, 3, false, rng)? })
    }

    pub fn conv(&self) -> &Conv2d {
        &self.conv
    }

    pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>> {
        self.conv.forward(&relu(x))
    }
}

impl Parameters for ReluConv {
    // slot 0 is the parameterless activation
    fn collect_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<NamedView<'a>>) {
        self.conv.collect_parameters(&join(prefix, "1"), out);
    }

    fn collect_parameters_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedViewMut<'a>>) {
        self.conv.collect_parameters_mut(&join(prefix, "1"), out);
    }
}
