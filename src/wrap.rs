//! Wrap policies: the static partition of a module tree into shard groups.
//!
//! The policy is evaluated exactly once, at construction. Traversal is
//! post-order so nested units claim their parameters before their parents see
//! them; the resulting groups are ordered by the pre-order position of their
//! unit roots, which is the order a forward pass enters them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use numr::runtime::Runtime;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::module::{ModuleMeta, ModuleNode, Parameter, join_path};

/// Predicate used by [`WrapPolicy::Custom`].
pub type WrapFn = Arc<dyn Fn(&ModuleMeta<'_>) -> bool + Send + Sync>;

/// Rule deciding which subtrees become independent shard groups.
#[derive(Clone)]
pub enum WrapPolicy {
    /// Every non-root module with parameters becomes its own unit.
    Always,
    /// Wrap a module once its not-yet-wrapped subtree holds at least
    /// `min_num_params` elements.
    SizeBased { min_num_params: usize },
    /// Wrap modules whose type tag is in the set.
    ModuleTypes(BTreeSet<String>),
    /// Arbitrary predicate over module metadata.
    Custom(WrapFn),
    /// Explicit groups of fully-qualified parameter names, in execution
    /// order. Parameters not listed form a trailing root group.
    ParamExecOrder(Vec<Vec<String>>),
}

impl fmt::Debug for WrapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WrapPolicy::Always => write!(f, "Always"),
            WrapPolicy::SizeBased { min_num_params } => {
                write!(f, "SizeBased {{ min_num_params: {min_num_params} }}")
            }
            WrapPolicy::ModuleTypes(types) => f.debug_tuple("ModuleTypes").field(types).finish(),
            WrapPolicy::Custom(_) => write!(f, "Custom(<fn>)"),
            WrapPolicy::ParamExecOrder(groups) => {
                f.debug_tuple("ParamExecOrder").field(groups).finish()
            }
        }
    }
}

impl Default for WrapPolicy {
    fn default() -> Self {
        WrapPolicy::SizeBased {
            min_num_params: 100_000_000,
        }
    }
}

impl WrapPolicy {
    fn should_wrap(&self, meta: &ModuleMeta<'_>) -> bool {
        match self {
            WrapPolicy::Always => true,
            WrapPolicy::SizeBased { min_num_params } => meta.unwrapped_numel >= *min_num_params,
            WrapPolicy::ModuleTypes(types) => types.contains(meta.type_name),
            WrapPolicy::Custom(f) => f(meta),
            WrapPolicy::ParamExecOrder(_) => false,
        }
    }
}

/// Serializable subset of [`WrapPolicy`] for config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WrapPolicyConfig {
    Always,
    SizeBased { min_num_params: usize },
    ModuleTypes { types: Vec<String> },
}

impl Default for WrapPolicyConfig {
    fn default() -> Self {
        WrapPolicyConfig::SizeBased {
            min_num_params: 100_000_000,
        }
    }
}

impl From<&WrapPolicyConfig> for WrapPolicy {
    fn from(cfg: &WrapPolicyConfig) -> Self {
        match cfg {
            WrapPolicyConfig::Always => WrapPolicy::Always,
            WrapPolicyConfig::SizeBased { min_num_params } => WrapPolicy::SizeBased {
                min_num_params: *min_num_params,
            },
            WrapPolicyConfig::ModuleTypes { types } => {
                WrapPolicy::ModuleTypes(types.iter().cloned().collect())
            }
        }
    }
}

/// One unit produced by the policy: the parameters it owns, named by their
/// fully-qualified paths.
#[derive(Clone, Debug)]
pub struct GroupSpec<R: Runtime> {
    /// Path of the module the unit is rooted at (`""` for the root).
    pub unit_path: String,
    pub params: Vec<Parameter<R>>,
}

impl<R: Runtime> GroupSpec<R> {
    pub fn numel(&self) -> usize {
        self.params.iter().map(Parameter::numel).sum()
    }
}

/// Ordered, immutable partition of all parameters into groups.
#[derive(Clone, Debug)]
pub struct Partition<R: Runtime> {
    groups: Vec<GroupSpec<R>>,
}

impl<R: Runtime> Partition<R> {
    pub fn groups(&self) -> &[GroupSpec<R>] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub(crate) fn into_groups(self) -> Vec<GroupSpec<R>> {
        self.groups
    }
}

/// Apply `policy` to `root`, moving every parameter into exactly one group.
///
/// Fails without producing a partial result on empty units, duplicate
/// parameter names, or explicit groups that overlap or name unknown
/// parameters.
pub fn partition<R: Runtime>(root: ModuleNode<R>, policy: &WrapPolicy) -> Result<Partition<R>> {
    let groups = match policy {
        WrapPolicy::ParamExecOrder(order) => partition_explicit(root, order)?,
        _ => {
            let mut units = Vec::new();
            let mut counter = 0usize;
            let rest = visit(root, "", 0, policy, &mut units, &mut counter)?;
            if !rest.is_empty() {
                units.push((
                    0,
                    GroupSpec {
                        unit_path: String::new(),
                        params: rest,
                    },
                ));
            }
            units.sort_by_key(|(pre, _)| *pre);
            units.into_iter().map(|(_, g)| g).collect()
        }
    };

    if groups.is_empty() {
        return Err(Error::Config {
            reason: "module tree has no parameters to shard".into(),
        });
    }

    let mut seen = HashSet::new();
    for group in &groups {
        for p in &group.params {
            if !seen.insert(p.name.as_str()) {
                return Err(Error::Config {
                    reason: format!("duplicate parameter name '{}'", p.name),
                });
            }
        }
    }

    Ok(Partition { groups })
}

/// Post-order visit returning the parameters of this subtree that no unit
/// claimed, renamed to their fully-qualified names.
fn visit<R: Runtime>(
    node: ModuleNode<R>,
    path: &str,
    depth: usize,
    policy: &WrapPolicy,
    units: &mut Vec<(usize, GroupSpec<R>)>,
    counter: &mut usize,
) -> Result<Vec<Parameter<R>>> {
    let preorder = *counter;
    *counter += 1;

    let (_, type_name, params, children) = node.into_parts();
    let own_numel = params.iter().map(Parameter::numel).sum();

    let mut unclaimed: Vec<Parameter<R>> = params
        .into_iter()
        .map(|mut p| {
            p.name = join_path(path, &p.name);
            p
        })
        .collect();

    for child in children {
        let child_path = join_path(path, child.name());
        let rest = visit(child, &child_path, depth + 1, policy, units, counter)?;
        unclaimed.extend(rest);
    }

    if depth == 0 {
        return Ok(unclaimed);
    }

    let meta = ModuleMeta {
        path,
        type_name: &type_name,
        depth,
        own_numel,
        unwrapped_numel: unclaimed.iter().map(Parameter::numel).sum(),
    };
    if !policy.should_wrap(&meta) {
        return Ok(unclaimed);
    }
    if unclaimed.is_empty() {
        // Always wraps everything, so parameter-free modules are simply skipped
        if matches!(policy, WrapPolicy::Always) {
            return Ok(unclaimed);
        }
        return Err(Error::Config {
            reason: format!("wrap policy selected module '{path}' which owns no parameters"),
        });
    }
    units.push((
        preorder,
        GroupSpec {
            unit_path: path.to_string(),
            params: unclaimed,
        },
    ));
    Ok(Vec::new())
}

fn collect_params<R: Runtime>(node: ModuleNode<R>, path: &str, out: &mut Vec<Parameter<R>>) {
    let (_, _, params, children) = node.into_parts();
    for mut p in params {
        p.name = join_path(path, &p.name);
        out.push(p);
    }
    for child in children {
        let child_path = join_path(path, child.name());
        collect_params(child, &child_path, out);
    }
}

fn partition_explicit<R: Runtime>(
    root: ModuleNode<R>,
    order: &[Vec<String>],
) -> Result<Vec<GroupSpec<R>>> {
    let mut all = Vec::new();
    collect_params(root, "", &mut all);

    let declared: Vec<String> = all.iter().map(|p| p.name.clone()).collect();
    let mut by_name: HashMap<String, Parameter<R>> = HashMap::with_capacity(all.len());
    for p in all {
        if by_name.contains_key(&p.name) {
            return Err(Error::Config {
                reason: format!("duplicate parameter name '{}'", p.name),
            });
        }
        by_name.insert(p.name.clone(), p);
    }

    let mut groups = Vec::with_capacity(order.len() + 1);
    for (i, names) in order.iter().enumerate() {
        if names.is_empty() {
            return Err(Error::Config {
                reason: format!("explicit group {i} is empty"),
            });
        }
        let mut params = Vec::with_capacity(names.len());
        for name in names {
            let p = by_name.remove(name).ok_or_else(|| Error::Config {
                reason: if declared.contains(name) {
                    format!("parameter '{name}' appears in more than one group")
                } else {
                    format!("explicit group {i} names unknown parameter '{name}'")
                },
            })?;
            params.push(p);
        }
        groups.push(GroupSpec {
            unit_path: format!("group{i}"),
            params,
        });
    }

    if !by_name.is_empty() {
        // Keep declaration order for the leftovers
        let rest: Vec<Parameter<R>> = declared
            .iter()
            .filter_map(|name| by_name.remove(name))
            .collect();
        groups.push(GroupSpec {
            unit_path: String::new(),
            params: rest,
        });
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use numr::runtime::cpu::CpuRuntime;

    use super::*;
    use crate::test_utils::{linear, toy_model};

    fn names(g: &GroupSpec<CpuRuntime>) -> Vec<&str> {
        g.params.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_always_wraps_each_child() {
        let part = partition(toy_model(), &WrapPolicy::Always).unwrap();
        let paths: Vec<&str> = part.groups().iter().map(|g| g.unit_path.as_str()).collect();
        // Root owns the embedding; groups follow pre-order
        assert_eq!(paths, vec!["", "layers.0", "layers.1", "head"]);
        assert_eq!(names(&part.groups()[1]), vec!["layers.0.weight", "layers.0.bias"]);
    }

    #[test]
    fn test_size_based() {
        // Each linear layer is 4*4+4 = 20 elements, head 4*2+2 = 10
        let part = partition(toy_model(), &WrapPolicy::SizeBased { min_num_params: 20 }).unwrap();
        let paths: Vec<&str> = part.groups().iter().map(|g| g.unit_path.as_str()).collect();
        assert_eq!(paths, vec!["", "layers.0", "layers.1"]);
        assert!(names(&part.groups()[0]).contains(&"head.weight"));
    }

    #[test]
    fn test_module_types() {
        let types = ["Linear".to_string()].into_iter().collect();
        let part = partition(toy_model(), &WrapPolicy::ModuleTypes(types)).unwrap();
        assert_eq!(part.len(), 4);
    }

    #[test]
    fn test_custom_predicate() {
        let policy = WrapPolicy::Custom(Arc::new(|m: &ModuleMeta<'_>| m.path == "head"));
        let part = partition(toy_model(), &policy).unwrap();
        assert_eq!(part.len(), 2);
        assert_eq!(part.groups()[1].unit_path, "head");
    }

    #[test]
    fn test_never_wrapping_yields_single_root_group() {
        let part = partition(toy_model(), &WrapPolicy::SizeBased { min_num_params: usize::MAX })
            .unwrap();
        assert_eq!(part.len(), 1);
        assert_eq!(part.groups()[0].numel(), toy_model().subtree_numel());
    }

    #[test]
    fn test_empty_unit_rejected() {
        let tree = ModuleNode::new("", "Model")
            .with_child(linear("fc", 2, 2))
            .with_child(ModuleNode::new("act", "ReLU"));
        let types = ["ReLU".to_string()].into_iter().collect();
        let err = partition(tree, &WrapPolicy::ModuleTypes(types)).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_no_params_rejected() {
        let err = partition(ModuleNode::<CpuRuntime>::new("", "Model"), &WrapPolicy::Always).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_explicit_groups() {
        let order = vec![
            vec!["head.weight".to_string(), "head.bias".to_string()],
            vec!["layers.0.weight".to_string()],
        ];
        let part = partition(toy_model(), &WrapPolicy::ParamExecOrder(order)).unwrap();
        assert_eq!(part.len(), 3);
        assert_eq!(names(&part.groups()[0]), vec!["head.weight", "head.bias"]);
        assert_eq!(part.groups()[2].unit_path, "");
        assert_eq!(names(&part.groups()[2])[0], "embed");
    }

    #[test]
    fn test_explicit_groups_overlap_rejected() {
        let order = vec![
            vec!["head.weight".to_string()],
            vec!["head.weight".to_string()],
        ];
        let err = partition(toy_model(), &WrapPolicy::ParamExecOrder(order)).unwrap_err();
        assert!(err.to_string().contains("more than one group"));
    }

    #[test]
    fn test_explicit_groups_unknown_rejected() {
        let order = vec![vec!["nope".to_string()]];
        let err = partition(toy_model(), &WrapPolicy::ParamExecOrder(order)).unwrap_err();
        assert!(err.to_string().contains("unknown parameter"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let tree = ModuleNode::new("", "Model")
            .with_child(linear("fc", 2, 2))
            .with_child(linear("fc", 2, 2));
        let err = partition(tree, &WrapPolicy::Always).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_config_conversion() {
        let cfg: WrapPolicyConfig =
            serde_json::from_str(r#"{"kind":"module_types","types":["Linear"]}"#).unwrap();
        assert!(matches!(WrapPolicy::from(&cfg), WrapPolicy::ModuleTypes(t) if t.contains("Linear")));
    }
}
