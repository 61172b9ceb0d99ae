//! Attribute/identity blend layer and the residual block built from it.
//!
//! Both operate on NCHW feature maps. The attribute tensor `z_att` is
//! `[batch, c_att, h, w]` (spatial dims may also be 1 and broadcast), the
//! identity vector `z_id` is `[batch, c_id]`.

use ndarray::{Array2, Array4, ArrayView4, Axis};
use rand::Rng;
use tracing::debug;

use crate::config::{BlendSharing, BlockConfig};
use crate::error::{ensure_dim, LayerError, Result};
use crate::layers::{sigmoid, Conv2d, InstanceNorm2d, Linear, ReluConv};
use crate::params::{join, NamedView, NamedViewMut, Parameters};

type Shape4 = (usize, usize, usize, usize);

fn broadcast_to<'a>(layer: &'static str, x: &'a Array4<f32>, shape: Shape4) -> Result<ArrayView4<'a, f32>> {
    x.broadcast(shape).ok_or_else(|| LayerError::Broadcast {
        layer,
        from: x.shape().to_vec(),
        to: vec![shape.0, shape.1, shape.2, shape.3],
    })
}

/// Intermediate tensors of one blend evaluation, all `[batch, c_x, h, w]`
/// except `mask` which is `[batch, 1, h, w]`.
#[derive(Clone, Debug)]
pub struct BlendTrace {
    pub h_norm: Array4<f32>,
    /// `att_gamma * h_norm + att_beta`
    pub attribute: Array4<f32>,
    /// `id_gamma * h_norm + id_beta`
    pub identity: Array4<f32>,
    pub mask: Array4<f32>,
    pub output: Array4<f32>,
}

/// Blends an attribute-conditioned and an identity-conditioned
/// modulation of the normalized input through a learned per-pixel mask.
#[derive(Clone, Debug)]
pub struct AddLayer {
    c_x: usize,
    h_conv: Conv2d,
    att_conv1: Conv2d,
    att_conv2: Conv2d,
    id_fc1: Linear,
    id_fc2: Linear,
    norm: InstanceNorm2d,
    span: tracing::Span,
}

impl AddLayer {
    pub fn new(c_x: usize, c_att: usize, c_id: usize) -> Result<Self> {
        Self::with_rng(c_x, c_att, c_id, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng>(c_x: usize, c_att: usize, c_id: usize, rng: &mut R) -> Result<Self> {
        if [c_x, c_att, c_id].contains(&0) {
            return Err(LayerError::InvalidConfig(format!(
                "channel counts must be non-zero: c_x={c_x} c_att={c_att} c_id={c_id}"
            )));
        }
        Ok(Self {
            c_x,
            h_conv: Conv2d::with_rng(c_x, 1, 1, true, rng)?,
            att_conv1: Conv2d::with_rng(c_att, c_x, 1, true, rng)?,
            att_conv2: Conv2d::with_rng(c_att, c_x, 1, true, rng)?,
            id_fc1: Linear::with_rng(c_id, c_x, true, rng),
            id_fc2: Linear::with_rng(c_id, c_x, true, rng),
            norm: InstanceNorm2d::new(c_x),
            span: tracing::trace_span!("add_layer", c_x),
        })
    }

    pub fn channels(&self) -> usize {
        self.c_x
    }

    pub fn attribute_channels(&self) -> usize {
        self.att_conv1.in_channels()
    }

    pub fn identity_channels(&self) -> usize {
        self.id_fc1.in_features()
    }

    pub fn forward(&self, h: &Array4<f32>, z_att: &Array4<f32>, z_id: &Array2<f32>) -> Result<Array4<f32>> {
        self.forward_trace(h, z_att, z_id).map(|t| t.output)
    }

    /// Like [`AddLayer::forward`] but also returns the intermediate maps.
    pub fn forward_trace(&self, h: &Array4<f32>, z_att: &Array4<f32>, z_id: &Array2<f32>) -> Result<BlendTrace> {
        let _enter = self.span.enter();
        let shape = h.dim();
        ensure_dim("AddLayer", "attribute batch", shape.0, z_att.dim().0)?;
        ensure_dim("AddLayer", "identity batch", shape.0, z_id.nrows())?;

        let h_norm = self.norm.forward(h)?;

        let att_beta = self.att_conv1.forward(z_att)?;
        let att_gamma = self.att_conv2.forward(z_att)?;
        let att_beta = broadcast_to("AddLayer", &att_beta, shape)?;
        let att_gamma = broadcast_to("AddLayer", &att_gamma, shape)?;

        let id_beta = self.id_fc1.forward(z_id)?.insert_axis(Axis(2)).insert_axis(Axis(3));
        let id_gamma = self.id_fc2.forward(z_id)?.insert_axis(Axis(2)).insert_axis(Axis(3));
        let id_beta = broadcast_to("AddLayer", &id_beta, shape)?;
        let id_gamma = broadcast_to("AddLayer", &id_gamma, shape)?;

        let mask = sigmoid(&self.h_conv.forward(&h_norm)?);
        let m = broadcast_to("AddLayer", &mask, shape)?;

        let attribute = &att_gamma * &h_norm + &att_beta;
        let identity = &id_gamma * &h_norm + &id_beta;
        let output = &m.mapv(|v| 1.0 - v) * &attribute + &(&m * &identity);

        Ok(BlendTrace { h_norm, attribute, identity, mask, output })
    }
}

impl Parameters for AddLayer {
    fn collect_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<NamedView<'a>>) {
        self.h_conv.collect_parameters(&join(prefix, "h_conv"), out);
        self.att_conv1.collect_parameters(&join(prefix, "att_conv1"), out);
        self.att_conv2.collect_parameters(&join(prefix, "att_conv2"), out);
        self.id_fc1.collect_parameters(&join(prefix, "id_fc1"), out);
        self.id_fc2.collect_parameters(&join(prefix, "id_fc2"), out);
        self.norm.collect_parameters(&join(prefix, "norm"), out);
    }

    fn collect_parameters_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedViewMut<'a>>) {
        self.h_conv.collect_parameters_mut(&join(prefix, "h_conv"), out);
        self.att_conv1.collect_parameters_mut(&join(prefix, "att_conv1"), out);
        self.att_conv2.collect_parameters_mut(&join(prefix, "att_conv2"), out);
        self.id_fc1.collect_parameters_mut(&join(prefix, "id_fc1"), out);
        self.id_fc2.collect_parameters_mut(&join(prefix, "id_fc2"), out);
        self.norm.collect_parameters_mut(&join(prefix, "norm"), out);
    }
}

/// Projection applied to the skip path when `c_in != c_out`.
#[derive(Clone, Debug)]
struct Shortcut {
    add3: AddLayer,
    conv3: ReluConv,
}

/// Two blend + conv stages with a residual connection.
#[derive(Clone, Debug)]
pub struct AddResBlk {
    config: BlockConfig,
    add1: AddLayer,
    conv1: ReluConv,
    add2: AddLayer,
    conv2: ReluConv,
    shortcut: Option<Shortcut>,
    span: tracing::Span,
}

impl AddResBlk {
    pub fn new(config: BlockConfig) -> Result<Self> {
        Self::with_rng(config, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng>(config: BlockConfig, rng: &mut R) -> Result<Self> {
        let BlockConfig { c_in, c_out, c_att, c_id, .. } = config;
        if [c_in, c_out, c_att, c_id].contains(&0) {
            return Err(LayerError::InvalidConfig(format!("channel counts must be non-zero: {config:?}")));
        }

        let add1 = AddLayer::with_rng(c_in, c_att, c_id, rng)?;
        let conv1 = ReluConv::with_rng(c_in, c_in, rng)?;
        let add2 = AddLayer::with_rng(c_in, c_att, c_id, rng)?;
        let conv2 = ReluConv::with_rng(c_in, c_out, rng)?;
        let shortcut = if config.has_shortcut() {
            Some(Shortcut {
                add3: AddLayer::with_rng(c_in, c_att, c_id, rng)?,
                conv3: ReluConv::with_rng(c_in, c_out, rng)?,
            })
        } else {
            None
        };

        let block = Self {
            config,
            add1,
            conv1,
            add2,
            conv2,
            shortcut,
            span: tracing::trace_span!("add_resblk", c_in, c_out),
        };
        debug!(
            c_in,
            c_out,
            c_att,
            c_id,
            sharing = ?config.sharing,
            params = block.num_parameters(),
            "built residual block"
        );
        Ok(block)
    }

    pub fn config(&self) -> &BlockConfig {
        &self.config
    }

    pub fn has_shortcut(&self) -> bool {
        self.shortcut.is_some()
    }

    pub fn add1(&self) -> &AddLayer {
        &self.add1
    }

    pub fn add2(&self) -> &AddLayer {
        &self.add2
    }

    pub fn add3(&self) -> Option<&AddLayer> {
        self.shortcut.as_ref().map(|s| &s.add3)
    }

    /// Blend instance applied before `conv2`.
    pub fn second_blend(&self) -> &AddLayer {
        match self.config.sharing {
            BlendSharing::ReuseFirst => &self.add1,
            BlendSharing::Independent => &self.add2,
        }
    }

    /// `[batch, c_in, h, w] -> [batch, c_out, h, w]`
    pub fn forward(&self, h: &Array4<f32>, z_att: &Array4<f32>, z_id: &Array2<f32>) -> Result<Array4<f32>> {
        let _enter = self.span.enter();
        let x = self.add1.forward(h, z_att, z_id)?;
        let x = self.conv1.forward(&x)?;
        let x = self.second_blend().forward(&x, z_att, z_id)?;
        let x = self.conv2.forward(&x)?;

        match &self.shortcut {
            Some(Shortcut { add3, conv3 }) => {
                let skip = conv3.forward(&add3.forward(h, z_att, z_id)?)?;
                Ok(x + &skip)
            }
            None => Ok(x + h),
        }
    }
}

impl Parameters for AddResBlk {
    fn collect_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<NamedView<'a>>) {
        self.add1.collect_parameters(&join(prefix, "add1"), out);
        self.conv1.collect_parameters(&join(prefix, "conv1"), out);
        self.add2.collect_parameters(&join(prefix, "add2"), out);
        self.conv2.collect_parameters(&join(prefix, "conv2"), out);
        if let Some(Shortcut { add3, conv3 }) = &self.shortcut {
            add3.collect_parameters(&join(prefix, "add3"), out);
            conv3.collect_parameters(&join(prefix, "conv3"), out);
        }
    }

    fn collect_parameters_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedViewMut<'a>>) {
        self.add1.collect_parameters_mut(&join(prefix, "add1"), out);
        self.conv1.collect_parameters_mut(&join(prefix, "conv1"), out);
        self.add2.collect_parameters_mut(&join(prefix, "add2"), out);
        self.conv2.collect_parameters_mut(&join(prefix, "conv2"), out);
        if let Some(Shortcut { add3, conv3 }) = &mut self.shortcut {
            add3.collect_parameters_mut(&join(prefix, "add3"), out);
            conv3.collect_parameters_mut(&join(prefix, "conv3"), out);
        }
    }
}
