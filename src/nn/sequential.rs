//! Ordered container of named layers

use super::{Layer, ShapedTensor};
use crate::autograd::{Context, Tensor};
use crate::error::Result;

/// Named children run in insertion order
///
/// Children are addressed by dotted paths (`"encoder.lin0"`); adapter
/// wrappers and shadows are leaves of the path space.
#[derive(Clone, Debug, Default)]
pub struct Sequential {
    layers: Vec<(String, Layer)>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append
    pub fn with(mut self, name: impl Into<String>, layer: impl Into<Layer>) -> Self {
        self.push(name, layer);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, layer: impl Into<Layer>) {
        self.layers.push((name.into(), layer.into()));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn forward(&self, x: &ShapedTensor, ctx: &Context) -> ShapedTensor {
        self.layers.iter().fold(x.clone(), |h, (_, layer)| layer.forward(&h, ctx))
    }

    /// Every descendant with its dotted path, parents before children
    pub fn named_layers(&self) -> Vec<(String, &Layer)> {
        let mut out = Vec::new();
        for (name, layer) in &self.layers {
            out.push((name.clone(), layer));
            if let Layer::Sequential(child) = layer {
                for (sub, sub_layer) in child.named_layers() {
                    out.push((format!("{name}.{sub}"), sub_layer));
                }
            }
        }
        out
    }

    pub fn get(&self, path: &str) -> Option<&Layer> {
        let (head, rest) = split_path(path);
        let layer = self.layers.iter().find(|(name, _)| name == head).map(|(_, l)| l)?;
        match (rest, layer) {
            (None, _) => Some(layer),
            (Some(rest), Layer::Sequential(child)) => child.get(rest),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Layer> {
        let (head, rest) = split_path(path);
        let layer = self.layers.iter_mut().find(|(name, _)| name == head).map(|(_, l)| l)?;
        match (rest, layer) {
            (None, layer) => Some(layer),
            (Some(rest), Layer::Sequential(child)) => child.get_mut(rest),
            _ => None,
        }
    }

    /// Visit every descendant mutably, parents before children
    pub fn try_visit_mut<F>(&mut self, f: &mut F) -> Result<()>
    where
        F: FnMut(&str, &mut Layer) -> Result<()>,
    {
        self.visit_prefixed(None, f)
    }

    fn visit_prefixed<F>(&mut self, prefix: Option<&str>, f: &mut F) -> Result<()>
    where
        F: FnMut(&str, &mut Layer) -> Result<()>,
    {
        for (name, layer) in &mut self.layers {
            let path = join_path(prefix, name);
            f(&path, layer)?;
            if let Layer::Sequential(child) = layer {
                child.visit_prefixed(Some(&path), f)?;
            }
        }
        Ok(())
    }

    /// Visit every descendant mutably, without early exit
    pub fn visit_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&str, &mut Layer),
    {
        let _ = self.try_visit_mut(&mut |path, layer| {
            f(path, layer);
            Ok(())
        });
    }

    /// Parameters with dotted names (`"lin0.weight"`)
    pub fn parameters(&self) -> Vec<(String, &Tensor)> {
        self.layers
            .iter()
            .flat_map(|(name, layer)| {
                layer.parameters().into_iter().map(move |(p, t)| (format!("{name}.{p}"), t))
            })
            .collect()
    }

    pub fn parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        self.layers
            .iter_mut()
            .flat_map(|(name, layer)| {
                let name = name.clone();
                layer.parameters_mut().into_iter().map(move |(p, t)| (format!("{name}.{p}"), t))
            })
            .collect()
    }
}

fn split_path(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

fn join_path(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}.{name}"),
        None => name.to_string(),
    }
}
