//! Shared helpers for multi-rank integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use shardr::comm::{CallLog, CollectiveCall};
use shardr::{
    LocalProcessGroup, ModuleNode, Parameter, RecordingProcessGroup, Result, Runtime,
    ShardedModule, ShardingConfig, Tensor, WrapPolicyConfig, tensor,
};

pub type Module = ShardedModule<CpuRuntime>;
pub type Group = LocalProcessGroup<CpuRuntime>;

pub fn cpu() -> (CpuClient, CpuDevice) {
    let device = CpuDevice::new();
    let client = CpuRuntime::default_client(&device);
    (client, device)
}

pub fn f32s(values: &[f32]) -> Tensor<CpuRuntime> {
    Tensor::from_slice(values, &[values.len()], &cpu().1)
}

pub fn linear(name: &str, in_features: usize, out_features: usize) -> ModuleNode<CpuRuntime> {
    let (_, device) = cpu();
    let seed = name.bytes().map(f32::from).sum::<f32>() * 0.01;
    let weight: Vec<f32> = (0..in_features * out_features)
        .map(|i| seed + (i % 7) as f32 * 0.1 - 0.3)
        .collect();
    let bias: Vec<f32> = (0..out_features).map(|i| seed - i as f32 * 0.05).collect();
    ModuleNode::new(name, "Linear")
        .with_param(
            Parameter::from_slice("weight", &[out_features, in_features], &weight, &device)
                .unwrap(),
        )
        .with_param(Parameter::from_slice("bias", &[out_features], &bias, &device).unwrap())
}

/// Root `embed` [4], `layers.0` and `layers.1` (4x4 linear), `head` (4x2 linear).
///
/// With [`WrapPolicyConfig::Always`] this wraps into four groups:
/// `""`, `layers.0`, `layers.1`, `head`.
pub fn toy_model() -> ModuleNode<CpuRuntime> {
    let (_, device) = cpu();
    ModuleNode::new("", "Model")
        .with_param(
            Parameter::from_slice("embed", &[4], &[0.1f32, 0.2, 0.3, 0.4], &device).unwrap(),
        )
        .with_child(
            ModuleNode::new("layers", "ModuleList")
                .with_child(linear("0", 4, 4))
                .with_child(linear("1", 4, 4)),
        )
        .with_child(linear("head", 4, 2))
}

/// Every parameter of [`toy_model`] by fully-qualified name, as f64.
pub fn toy_params() -> Vec<(String, Vec<f64>)> {
    let mut out = Vec::new();
    collect(&toy_model(), "", &mut out);
    out
}

fn collect(node: &ModuleNode<CpuRuntime>, prefix: &str, out: &mut Vec<(String, Vec<f64>)>) {
    let join = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        }
    };
    for p in node.params() {
        out.push((join(&p.name), tensor::to_f64_vec(&p.data).unwrap()));
    }
    for child in node.children() {
        collect(child, &join(child.name()), out);
    }
}

pub fn always() -> ShardingConfig {
    ShardingConfig::default().with_wrap(WrapPolicyConfig::Always)
}

/// Run `f` once per rank, each on its own thread, results in rank order.
pub fn run_ranks<T, F>(world_size: usize, f: F) -> Vec<T>
where
    F: Fn(Group) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    run_group(LocalProcessGroup::new_group(world_size), f)
}

/// Like [`run_ranks`] over an already-built set of rank groups.
pub fn run_group<T, F>(groups: Vec<Group>, f: F) -> Vec<T>
where
    F: Fn(Group) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = groups
        .into_iter()
        .map(|pg| {
            let f = Arc::clone(&f);
            std::thread::spawn(move || (*f)(pg))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// Like [`run_ranks`], with each rank's group wrapped in a recorder.
/// Returns each rank's result together with its call sequence.
pub fn run_recorded<T, F>(world_size: usize, f: F) -> Vec<(T, Vec<CollectiveCall>)>
where
    F: Fn(Arc<RecordingProcessGroup<CpuRuntime, Group>>, Arc<CallLog>) -> T
        + Send
        + Sync
        + 'static,
    T: Send + 'static,
{
    run_ranks(world_size, move |pg| {
        let rec = Arc::new(RecordingProcessGroup::new(pg));
        let log = rec.log();
        let out = f(rec, log.clone());
        (out, log.snapshot())
    })
}

pub fn build(pg: Group, config: ShardingConfig) -> Module {
    ShardedModule::new(toy_model(), Arc::new(pg), config).unwrap()
}

/// Forward through every group in order, returning the sum of all
/// parameter values seen.
pub fn forward_all(module: &mut Module) -> Result<f64> {
    module.forward(|ctx| -> Result<f64> {
        let mut total = 0.0;
        for g in 0..ctx.num_groups() {
            total += ctx.with_unit(g, |params| {
                params
                    .iter()
                    .map(|p| p.to_f64_vec().map(|v| v.iter().sum::<f64>()))
                    .sum::<Result<f64>>()
            })??;
        }
        Ok(total)
    })
}

/// Backward in reverse order with each gradient equal to `scale` times the
/// parameter itself, in the parameter's compute dtype.
pub fn backward_scaled(module: &mut Module, scale: f64) -> Result<()> {
    let (_, device) = cpu();
    module.backward(|ctx| -> Result<()> {
        for g in ctx.order() {
            ctx.with_unit(g, |params| {
                params
                    .iter()
                    .map(|p| {
                        let values: Vec<f64> = p.to_f64_vec()?.iter().map(|v| v * scale).collect();
                        tensor::from_f64s(p.dtype(), &values, p.shape(), &device)
                    })
                    .collect()
            })?;
        }
        Ok(())
    })
}

pub fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "element {i}: {x} vs {y}");
    }
}
