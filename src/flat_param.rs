//! Flattening layer: one contiguous, padded buffer per shard group.
//!
//! Parameters are laid out back to back in group order and the tail is
//! zero-padded so the buffer divides evenly by the world size. Rank `r` owns
//! the half-open range `[r * shard_numel, (r + 1) * shard_numel)`.

use std::ops::Range;

use numr::dtype::DType;
use numr::ops::{ShapeOps, TypeConversionOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

use crate::error::{Error, Result};
use crate::module::Parameter;
use crate::tensor;

/// Placement of one parameter inside the flat buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlatParamInfo {
    /// Fully-qualified parameter name
    pub name: String,
    pub shape: Vec<usize>,
    pub numel: usize,
    /// Element offset into the unpadded flat buffer
    pub offset: usize,
}

/// The part of one parameter that falls inside a rank's shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardParamInfo {
    /// Index into [`FlatLayout::params`]
    pub param_index: usize,
    /// Offset of the piece inside the local shard
    pub shard_offset: usize,
    /// Offset of the piece inside the (flattened) parameter
    pub param_offset: usize,
    pub len: usize,
}

/// Static description of a group's flat buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlatLayout {
    params: Vec<FlatParamInfo>,
    dtype: DType,
    numel: usize,
    padded_numel: usize,
    world_size: usize,
}

impl FlatLayout {
    /// Lay out `(name, shape)` pairs in order for `world_size` ranks.
    pub fn new(
        specs: impl IntoIterator<Item = (String, Vec<usize>)>,
        dtype: DType,
        world_size: usize,
    ) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "world_size",
                reason: "must be at least 1".into(),
            });
        }
        if !tensor::is_supported(dtype) {
            return Err(Error::UnsupportedDType { dtype });
        }

        let mut params = Vec::new();
        let mut offset = 0usize;
        for (name, shape) in specs {
            let numel: usize = shape.iter().product();
            params.push(FlatParamInfo {
                name,
                shape,
                numel,
                offset,
            });
            offset += numel;
        }
        if params.is_empty() {
            return Err(Error::Config {
                reason: "cannot flatten a group with zero parameters".into(),
            });
        }

        let padded_numel = offset.div_ceil(world_size) * world_size;
        Ok(Self {
            params,
            dtype,
            numel: offset,
            padded_numel,
            world_size,
        })
    }

    pub fn params(&self) -> &[FlatParamInfo] {
        &self.params
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Elements without padding.
    pub fn numel(&self) -> usize {
        self.numel
    }

    pub fn padded_numel(&self) -> usize {
        self.padded_numel
    }

    pub fn padding(&self) -> usize {
        self.padded_numel - self.numel
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn shard_numel(&self) -> usize {
        self.padded_numel / self.world_size
    }

    /// Range of the padded flat buffer owned by `rank`.
    pub fn shard_range(&self, rank: usize) -> Range<usize> {
        let n = self.shard_numel();
        rank * n..(rank + 1) * n
    }

    /// Same layout re-targeted at a different dtype.
    pub fn with_dtype(&self, dtype: DType) -> Self {
        Self {
            dtype,
            ..self.clone()
        }
    }

    /// Pieces of each parameter held by `rank`, padding excluded.
    pub fn shard_param_infos(&self, rank: usize) -> Vec<ShardParamInfo> {
        let range = self.shard_range(rank);
        self.params
            .iter()
            .enumerate()
            .filter_map(|(i, p)| {
                let start = p.offset.max(range.start);
                let end = (p.offset + p.numel).min(range.end);
                (start < end).then(|| ShardParamInfo {
                    param_index: i,
                    shard_offset: start - range.start,
                    param_offset: start - p.offset,
                    len: end - start,
                })
            })
            .collect()
    }

    fn check_flat<R: Runtime>(&self, flat: &Tensor<R>) -> Result<()> {
        if flat.dtype() != self.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.dtype,
                got: flat.dtype(),
            });
        }
        if flat.numel() != self.numel && flat.numel() != self.padded_numel {
            return Err(Error::InvalidArgument {
                arg: "flat",
                reason: format!(
                    "flat buffer has {} elements, layout expects {} ({} padded)",
                    flat.numel(),
                    self.numel,
                    self.padded_numel
                ),
            });
        }
        Ok(())
    }
}

/// Concatenate `tensors` in layout order and zero-pad to the padded size.
pub fn flatten<R, C>(client: &C, layout: &FlatLayout, tensors: &[Tensor<R>]) -> Result<Tensor<R>>
where
    R: Runtime,
    C: RuntimeClient<R> + ShapeOps<R>,
{
    if tensors.len() != layout.params.len() {
        return Err(Error::InvalidArgument {
            arg: "tensors",
            reason: format!(
                "got {} tensors for a layout of {} parameters",
                tensors.len(),
                layout.params.len()
            ),
        });
    }
    let mut parts = Vec::with_capacity(tensors.len() + 1);
    for (info, t) in layout.params.iter().zip(tensors) {
        if t.numel() != info.numel {
            return Err(Error::InvalidArgument {
                arg: "tensors",
                reason: format!(
                    "parameter '{}' has {} elements, layout expects {}",
                    info.name,
                    t.numel(),
                    info.numel
                ),
            });
        }
        if t.dtype() != layout.dtype {
            return Err(Error::DTypeMismatch {
                expected: layout.dtype,
                got: t.dtype(),
            });
        }
        // Empty parameters hold no storage to copy from.
        if info.numel > 0 {
            parts.push(t.contiguous().reshape(&[info.numel])?);
        }
    }
    if layout.padding() > 0 {
        parts.push(tensor::zeros(layout.dtype, layout.padding(), client.device())?);
    }
    if parts.is_empty() {
        return tensor::zeros(layout.dtype, 0, client.device());
    }
    let refs: Vec<&Tensor<R>> = parts.iter().collect();
    Ok(client.cat(&refs, 0)?)
}

/// Inverse of [`flatten`]: one owned tensor per parameter, padding dropped.
pub fn split<R: Runtime>(layout: &FlatLayout, flat: &Tensor<R>) -> Result<Vec<Tensor<R>>> {
    layout.check_flat(flat)?;
    layout
        .params
        .iter()
        .map(|p| -> Result<Tensor<R>> {
            Ok(tensor::copy_range(flat, p.offset, p.numel)?.reshape(&p.shape)?)
        })
        .collect()
}

/// Copy out the partition of a padded flat buffer owned by `rank`.
pub fn shard<R, C>(client: &C, layout: &FlatLayout, flat: &Tensor<R>, rank: usize) -> Result<Tensor<R>>
where
    R: Runtime,
    C: RuntimeClient<R> + ShapeOps<R>,
{
    if rank >= layout.world_size {
        return Err(Error::InvalidArgument {
            arg: "rank",
            reason: format!("rank {rank} outside world of {}", layout.world_size),
        });
    }
    layout.check_flat(flat)?;
    let range = layout.shard_range(rank);
    if flat.numel() == layout.padded_numel {
        return tensor::copy_range(flat, range.start, range.len());
    }
    // Unpadded input: the tail of the last shard is padding.
    let end = range.end.min(layout.numel);
    let start = range.start.min(end);
    let body = tensor::copy_range(flat, start, end - start)?;
    pad_to(client, &body, range.len())
}

/// Zero-extend a 1-D tensor to `len` elements.
pub(crate) fn pad_to<R, C>(client: &C, t: &Tensor<R>, len: usize) -> Result<Tensor<R>>
where
    R: Runtime,
    C: RuntimeClient<R> + ShapeOps<R>,
{
    let numel = t.numel();
    if numel == len {
        return Ok(t.clone());
    }
    if numel > len {
        return Err(Error::InvalidArgument {
            arg: "len",
            reason: format!("cannot pad {numel} elements down to {len}"),
        });
    }
    if numel == 0 {
        return tensor::zeros(t.dtype(), len, client.device());
    }
    Ok(client.pad(&t.contiguous().reshape(&[numel])?, &[0, len - numel], 0.0)?)
}

/// Flatten a group's parameters into a layout and a padded buffer in
/// `storage_dtype`.
///
/// With `require_uniform_dtype`, every parameter must share the first
/// parameter's dtype; otherwise mixed inputs are cast to the storage dtype.
pub fn flatten_params<R, C>(
    client: &C,
    params: &[Parameter<R>],
    world_size: usize,
    storage_dtype: DType,
    require_uniform_dtype: bool,
) -> Result<(FlatLayout, Tensor<R>)>
where
    R: Runtime,
    C: RuntimeClient<R> + ShapeOps<R> + TypeConversionOps<R>,
{
    if let Some(first) = params.first() {
        if require_uniform_dtype {
            if let Some(p) = params.iter().find(|p| p.dtype() != first.dtype()) {
                return Err(Error::DTypeMismatch {
                    expected: first.dtype(),
                    got: p.dtype(),
                });
            }
        }
    }

    let layout = FlatLayout::new(
        params.iter().map(|p| (p.name.clone(), p.shape().to_vec())),
        storage_dtype,
        world_size,
    )?;
    let cast: Vec<Tensor<R>> = params
        .iter()
        .map(|p| -> Result<Tensor<R>> { Ok(client.cast(&p.data, storage_dtype)?) })
        .collect::<Result<_>>()?;
    let flat = flatten(client, &layout, &cast)?;
    Ok((layout, flat))
}

#[cfg(test)]
mod tests {
    use numr::runtime::cpu::CpuRuntime;

    use super::*;
    use crate::test_utils::cpu_setup;

    fn f32s(values: &[f32]) -> Tensor<CpuRuntime> {
        Tensor::from_slice(values, &[values.len()], &cpu_setup().1)
    }

    fn specs(sizes: &[usize]) -> Vec<(String, Vec<usize>)> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| (format!("p{i}"), vec![n]))
            .collect()
    }

    #[test]
    fn test_layout_padding() {
        let layout = FlatLayout::new(specs(&[2, 3, 1]), DType::F32, 4).unwrap();
        assert_eq!(layout.numel(), 6);
        assert_eq!(layout.padded_numel(), 8);
        assert_eq!(layout.shard_numel(), 2);
        assert_eq!(layout.padding(), 2);
        assert_eq!(layout.shard_range(3), 6..8);
        assert_eq!(layout.params()[2].offset, 5);
    }

    #[test]
    fn test_zero_params_rejected() {
        let err = FlatLayout::new(Vec::new(), DType::F32, 2).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_flatten_split_three_params() {
        let (client, _) = cpu_setup();
        let layout = FlatLayout::new(
            vec![
                ("a".to_string(), vec![2]),
                ("b".to_string(), vec![3]),
                ("c".to_string(), vec![1]),
            ],
            DType::F32,
            4,
        )
        .unwrap();
        let tensors = vec![f32s(&[1.0, 2.0]), f32s(&[3.0, 4.0, 5.0]), f32s(&[6.0])];
        let flat = flatten(&client, &layout, &tensors).unwrap();
        assert_eq!(flat.to_vec::<f32>(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.0, 0.0]);

        let back = split(&layout, &flat).unwrap();
        assert_eq!(back.len(), 3);
        for (a, b) in back.iter().zip(&tensors) {
            assert!(tensor::bit_eq(a, b));
        }
    }

    #[test]
    fn test_shards_reconstruct_flat() {
        let (client, device) = cpu_setup();
        for world in 1..=5 {
            let layout = FlatLayout::new(specs(&[3, 4]), DType::F64, world).unwrap();
            let values: Vec<f64> = (0..7).map(|i| i as f64 * 0.5).collect();
            let parts = [
                Tensor::<CpuRuntime>::from_slice(&values[..3], &[3], &device),
                Tensor::<CpuRuntime>::from_slice(&values[3..], &[4], &device),
            ];
            let flat = flatten(&client, &layout, &parts).unwrap();

            let shards: Vec<_> = (0..world)
                .map(|r| shard(&client, &layout, &flat, r).unwrap())
                .collect();
            let refs: Vec<&Tensor<CpuRuntime>> = shards.iter().collect();
            let joined = client.cat(&refs, 0).unwrap().to_vec::<f64>();
            assert_eq!(joined.len(), layout.padded_numel());
            assert_eq!(&joined[..layout.numel()], &values[..], "world_size={world}");

            // Unpadded input yields the same shards.
            let unpadded = tensor::copy_range(&flat, 0, layout.numel()).unwrap();
            let last = world - 1;
            let a = shard(&client, &layout, &unpadded, last).unwrap();
            assert!(tensor::bit_eq(&a, &shards[last]), "world_size={world}");
        }
    }

    #[test]
    fn test_shard_param_infos_skip_padding() {
        // [a a | b b | b c | pad pad]
        let layout = FlatLayout::new(specs(&[2, 3, 1]), DType::F32, 4).unwrap();
        let r1 = layout.shard_param_infos(1);
        assert_eq!(
            r1,
            vec![ShardParamInfo {
                param_index: 1,
                shard_offset: 0,
                param_offset: 0,
                len: 2
            }]
        );
        let r2 = layout.shard_param_infos(2);
        assert_eq!(r2.len(), 2);
        assert_eq!(r2[0].param_offset, 2);
        assert_eq!(r2[1].param_index, 2);
        assert!(layout.shard_param_infos(3).is_empty());
    }

    #[test]
    fn test_flatten_params_dtype_rules() {
        let (client, device) = cpu_setup();
        let a = Parameter::<CpuRuntime>::from_slice("a", &[2], &[1.0f32, 2.0], &device).unwrap();
        let b = Parameter::from_slice("b", &[1], &[3.0f64], &device).unwrap();

        let err =
            flatten_params(&client, &[a.clone(), b.clone()], 2, DType::F32, true).unwrap_err();
        assert!(matches!(err, Error::DTypeMismatch { .. }));

        let (layout, flat) = flatten_params(&client, &[a, b], 2, DType::F32, false).unwrap();
        assert_eq!(layout.padded_numel(), 4);
        assert_eq!(flat.dtype(), DType::F32);
        assert_eq!(flat.to_vec::<f32>(), vec![1.0, 2.0, 3.0, 0.0]);
    }

    #[test]
    fn test_split_rejects_wrong_length() {
        let layout = FlatLayout::new(specs(&[2]), DType::F32, 1).unwrap();
        let device = cpu_setup().1;
        assert!(split(&layout, &f32s(&[1.0])).is_err());
        let wide = Tensor::<CpuRuntime>::from_slice(&[1.0f64, 2.0], &[2], &device);
        assert!(split(&layout, &wide).is_err());
    }

    #[test]
    fn test_split_restores_shapes() {
        let layout = FlatLayout::new(
            vec![("w".to_string(), vec![2, 2]), ("b".to_string(), vec![2])],
            DType::F32,
            4,
        )
        .unwrap();
        let flat = f32s(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.0, 0.0]);
        let parts = split(&layout, &flat).unwrap();
        assert_eq!(parts[0].shape(), &[2, 2]);
        assert_eq!(parts[1].to_vec::<f32>(), vec![5.0, 6.0]);
    }

    #[test]
    fn test_pad_to() {
        let (client, _) = cpu_setup();
        let padded = pad_to(&client, &f32s(&[1.0]), 3).unwrap();
        assert_eq!(padded.to_vec::<f32>(), vec![1.0, 0.0, 0.0]);
        assert!(pad_to(&client, &f32s(&[1.0, 2.0]), 1).is_err());
    }
}
