//! Named access to learned tensors.
//!
//! Names are dot-joined paths mirroring the struct nesting, e.g.
//! `add1.id_fc2.bias`. Order is construction order and stable across runs,
//! which the checkpoint format relies on.

use ndarray::{ArrayViewD, ArrayViewMutD};

pub type NamedView<'a> = (String, ArrayViewD<'a, f32>);
pub type NamedViewMut<'a> = (String, ArrayViewMutD<'a, f32>);

pub trait Parameters {
    /// Append every learned tensor under `prefix` to `out`.
    fn collect_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<NamedView<'a>>);

    /// Mutable counterpart of [`Parameters::collect_parameters`], same order.
    fn collect_parameters_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedViewMut<'a>>);

    fn named_parameters(&self) -> Vec<NamedView<'_>> {
        let mut out = Vec::new();
        self.collect_parameters("", &mut out);
        out
    }

    fn named_parameters_mut(&mut self) -> Vec<NamedViewMut<'_>> {
        let mut out = Vec::new();
        self.collect_parameters_mut("", &mut out);
        out
    }

    /// Total number of scalars across all tensors.
    fn num_parameters(&self) -> usize {
        self.named_parameters().iter().map(|(_, t)| t.len()).sum()
    }
}

/// `join("add1", "h_conv")` -> `add1.h_conv`; an empty prefix yields `name`.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}
