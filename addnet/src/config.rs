/// Identity embedding width used when none is given.
pub const DEFAULT_ID_CHANNELS: usize = 256;

/// Which blend instance the second stage of a residual block applies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlendSharing {
    /// Both stages run `add1`. `add2` is allocated and persisted but never
    /// applied.
    #[default]
    ReuseFirst,
    /// Stage one runs `add1`, stage two runs `add2`.
    Independent,
}

impl BlendSharing {
    pub fn as_u32(self) -> u32 {
        match self {
            BlendSharing::ReuseFirst => 0,
            BlendSharing::Independent => 1,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(BlendSharing::ReuseFirst),
            1 => Some(BlendSharing::Independent),
            _ => None,
        }
    }
}

/// Configuration for a residual block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockConfig {
    /// Input feature channels.
    pub c_in: usize,
    /// Output feature channels.
    pub c_out: usize,
    /// Attribute tensor channels.
    pub c_att: usize,
    /// Identity vector length.
    pub c_id: usize,
    /// Blend instance used by the second stage.
    pub sharing: BlendSharing,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            c_in: 64,
            c_out: 64,
            c_att: 64,
            c_id: DEFAULT_ID_CHANNELS,
            sharing: BlendSharing::ReuseFirst,
        }
    }
}

impl BlockConfig {
    pub fn new(c_in: usize, c_out: usize, c_att: usize, c_id: usize) -> Self {
        Self { c_in, c_out, c_att, c_id, sharing: BlendSharing::default() }
    }

    pub fn with_sharing(mut self, sharing: BlendSharing) -> Self {
        self.sharing = sharing;
        self
    }

    /// Whether the skip path needs its own blend + convolution.
    pub fn has_shortcut(&self) -> bool {
        self.c_in != self.c_out
    }

    /// Number of learned tensors a block with this config holds.
    pub fn tensor_count(&self) -> usize {
        // each blend carries 5 weight/bias pairs, each conv a single weight
        if self.has_shortcut() {
            3 * 10 + 3
        } else {
            2 * 10 + 2
        }
    }

    /// Total scalar count of a block with this config, `None` on overflow.
    pub fn parameter_count(&self) -> Option<usize> {
        let BlockConfig { c_in, c_out, c_att, c_id, .. } = *self;
        let projection = |fan_in: usize| fan_in.checked_mul(c_in)?.checked_add(c_in);
        let blend = projection(c_att)?
            .checked_mul(2)?
            .checked_add(projection(c_id)?.checked_mul(2)?)?
            .checked_add(c_in.checked_add(1)?)?;
        let conv = |out: usize| c_in.checked_mul(out)?.checked_mul(9);

        let mut total = blend.checked_mul(2)?.checked_add(conv(c_in)?)?.checked_add(conv(c_out)?)?;
        if self.has_shortcut() {
            total = total.checked_add(blend)?.checked_add(conv(c_out)?)?;
        }
        Some(total)
    }
}
