//! Caller-supplied module graph.
//!
//! A [`ModuleNode`] tree is all the coordinator knows about the model: names,
//! module type tags and parameter metadata. Compute stays opaque and is driven
//! through the execution contexts in [`crate::fsdp`].

use numr::dtype::{DType, Element};
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::error::{Error, Result};

/// A named parameter and its initial values.
#[derive(Clone, Debug)]
pub struct Parameter<R: Runtime> {
    pub name: String,
    pub data: Tensor<R>,
}

impl<R: Runtime> Parameter<R> {
    pub fn new(name: impl Into<String>, data: Tensor<R>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Copy `values` onto `device` as a parameter of `shape`.
    pub fn from_slice<T: Element>(
        name: impl Into<String>,
        shape: &[usize],
        values: &[T],
        device: &R::Device,
    ) -> Result<Self> {
        let name = name.into();
        let numel: usize = shape.iter().product();
        if numel != values.len() {
            return Err(Error::InvalidArgument {
                arg: "shape",
                reason: format!(
                    "parameter '{name}' has shape {shape:?} ({numel} elements) but {} values",
                    values.len()
                ),
            });
        }
        let data = Tensor::try_from_slice(values, shape, device)?;
        Ok(Self { name, data })
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn numel(&self) -> usize {
        self.data.numel()
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }
}

/// One node of the module tree.
#[derive(Clone, Debug)]
pub struct ModuleNode<R: Runtime> {
    name: String,
    type_name: String,
    params: Vec<Parameter<R>>,
    children: Vec<ModuleNode<R>>,
}

impl<R: Runtime> ModuleNode<R> {
    /// `name` is the attribute name under the parent; `type_name` tags the
    /// kind of module (e.g. `"TransformerBlock"`) for type-based wrapping.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            params: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_param(mut self, param: Parameter<R>) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_child(mut self, child: ModuleNode<R>) -> Self {
        self.children.push(child);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn params(&self) -> &[Parameter<R>] {
        &self.params
    }

    pub fn children(&self) -> &[ModuleNode<R>] {
        &self.children
    }

    /// Total elements over this node and all descendants.
    pub fn subtree_numel(&self) -> usize {
        self.params.iter().map(Parameter::numel).sum::<usize>()
            + self.children.iter().map(ModuleNode::subtree_numel).sum::<usize>()
    }

    #[allow(clippy::type_complexity)]
    pub(crate) fn into_parts(self) -> (String, String, Vec<Parameter<R>>, Vec<ModuleNode<R>>) {
        (self.name, self.type_name, self.params, self.children)
    }
}

/// What a wrap policy sees when deciding on a module.
#[derive(Clone, Debug)]
pub struct ModuleMeta<'a> {
    /// Dotted path from the root (`""` for the root itself).
    pub path: &'a str,
    pub type_name: &'a str,
    pub depth: usize,
    /// Elements held directly by this module.
    pub own_numel: usize,
    /// Elements in the subtree not already claimed by a nested unit.
    pub unwrapped_numel: usize,
}

/// Join a module path and a local name with `.`.
pub(crate) fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

#[cfg(test)]
mod tests {
    use numr::runtime::cpu::CpuRuntime;

    use super::*;
    use crate::test_utils::cpu_setup;

    #[test]
    fn test_parameter_shape_check() {
        let (_, device) = cpu_setup();
        let p = Parameter::<CpuRuntime>::from_slice("w", &[2, 2], &[1.0f32; 4], &device).unwrap();
        assert_eq!(p.shape(), &[2, 2]);
        assert_eq!(p.dtype(), DType::F32);
        let err =
            Parameter::<CpuRuntime>::from_slice("w", &[2, 3], &[1.0f32; 4], &device).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { arg: "shape", .. }));
    }

    #[test]
    fn test_subtree_numel() {
        let (_, device) = cpu_setup();
        let tree = ModuleNode::<CpuRuntime>::new("", "Model")
            .with_param(Parameter::from_slice("bias", &[3], &[0.0f32; 3], &device).unwrap())
            .with_child(
                ModuleNode::new("fc", "Linear").with_param(
                    Parameter::from_slice("weight", &[2, 4], &[0.0f32; 8], &device).unwrap(),
                ),
            );
        assert_eq!(tree.subtree_numel(), 11);
        assert_eq!(tree.children()[0].type_name(), "Linear");
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "fc"), "fc");
        assert_eq!(join_path("layers.0", "fc"), "layers.0.fc");
    }
}
