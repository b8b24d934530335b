//! Tensor helpers for flat parameters, shards and gradients.
//!
//! Flat buffers are 1-D [`Tensor`]s in one of the floating dtypes a flat
//! parameter can persist in. Element-wise math goes through the numr client;
//! the helpers here cover construction, positional copies, host staging and
//! byte-level IO.

use half::{bf16, f16};
use numr::dtype::{DType, Element};
use numr::ops::{BinaryOps, ReduceOps, TypeConversionOps};
use numr::runtime::Runtime;
use numr::runtime::cpu::{CpuDevice, CpuRuntime};
use numr::tensor::{Layout, Storage, Tensor};

use crate::error::{Error, Result};

/// Whether `dtype` can back a flat parameter.
pub fn is_supported(dtype: DType) -> bool {
    matches!(dtype, DType::F32 | DType::F64 | DType::F16 | DType::BF16)
}

fn check_supported(dtype: DType) -> Result<()> {
    if is_supported(dtype) {
        Ok(())
    } else {
        Err(Error::UnsupportedDType { dtype })
    }
}

/// Size of `tensor`'s viewed elements in bytes.
pub fn nbytes<R: Runtime>(tensor: &Tensor<R>) -> usize {
    tensor.numel() * tensor.dtype().size_in_bytes()
}

/// Zero-filled 1-D tensor of `len` elements.
pub fn zeros<R: Runtime>(dtype: DType, len: usize, device: &R::Device) -> Result<Tensor<R>> {
    check_supported(dtype)?;
    Ok(Tensor::try_zeros(&[len], dtype, device)?)
}

fn convert<T: Element, R: Runtime>(
    values: &[f64],
    shape: &[usize],
    device: &R::Device,
) -> Result<Tensor<R>> {
    let data: Vec<T> = values.iter().map(|&x| T::from_f64(x)).collect();
    Ok(Tensor::try_from_slice(&data, shape, device)?)
}

/// Tensor of `dtype` and `shape` from f64 values, rounding as needed.
pub fn from_f64s<R: Runtime>(
    dtype: DType,
    values: &[f64],
    shape: &[usize],
    device: &R::Device,
) -> Result<Tensor<R>> {
    match dtype {
        DType::F32 => convert::<f32, R>(values, shape, device),
        DType::F64 => Ok(Tensor::try_from_slice(values, shape, device)?),
        DType::F16 => convert::<f16, R>(values, shape, device),
        DType::BF16 => convert::<bf16, R>(values, shape, device),
        other => Err(Error::UnsupportedDType { dtype: other }),
    }
}

fn widen<T: Element, R: Runtime>(tensor: &Tensor<R>) -> Vec<f64> {
    tensor.to_vec::<T>().into_iter().map(Element::to_f64).collect()
}

/// Every element widened to f64, in row-major order.
pub fn to_f64_vec<R: Runtime>(tensor: &Tensor<R>) -> Result<Vec<f64>> {
    if tensor.numel() == 0 {
        return Ok(Vec::new());
    }
    let t = tensor.contiguous();
    match t.dtype() {
        DType::F32 => Ok(widen::<f32, R>(&t)),
        DType::F64 => Ok(t.to_vec::<f64>()),
        DType::F16 => Ok(widen::<f16, R>(&t)),
        DType::BF16 => Ok(widen::<bf16, R>(&t)),
        other => Err(Error::UnsupportedDType { dtype: other }),
    }
}

/// Raw little-endian bytes of the viewed elements.
pub fn to_le_bytes<R: Runtime>(tensor: &Tensor<R>) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; nbytes(tensor)];
    if bytes.is_empty() {
        return Ok(bytes);
    }
    let t = tensor.contiguous();
    R::copy_from_device(t.storage().ptr(), &mut bytes, t.device())?;
    Ok(bytes)
}

/// Reinterpret little-endian bytes as a tensor of `dtype` and `shape`.
pub fn from_le_bytes<R: Runtime>(
    dtype: DType,
    shape: &[usize],
    bytes: &[u8],
    device: &R::Device,
) -> Result<Tensor<R>> {
    check_supported(dtype)?;
    let numel: usize = shape.iter().product();
    let expected = numel * dtype.size_in_bytes();
    if bytes.len() != expected {
        return Err(Error::InvalidArgument {
            arg: "bytes",
            reason: format!(
                "{} bytes do not hold a {dtype} tensor of shape {shape:?} ({expected} bytes)",
                bytes.len()
            ),
        });
    }
    let storage = Storage::from_bytes(bytes, dtype, device)?;
    Ok(Tensor::from_parts(storage, Layout::contiguous(shape)))
}

/// Copy `tensor` into fresh host memory.
pub fn to_host<R: Runtime>(tensor: &Tensor<R>) -> Result<Tensor<CpuRuntime>> {
    from_le_bytes(
        tensor.dtype(),
        tensor.shape(),
        &to_le_bytes(tensor)?,
        &CpuDevice::new(),
    )
}

/// Copy a host tensor into fresh memory on `device`.
pub fn to_device<R: Runtime>(host: &Tensor<CpuRuntime>, device: &R::Device) -> Result<Tensor<R>> {
    from_le_bytes(host.dtype(), host.shape(), &to_le_bytes(host)?, device)
}

/// Owned 1-D copy of `len` elements of the flat `tensor` starting at `start`.
pub fn copy_range<R: Runtime>(tensor: &Tensor<R>, start: usize, len: usize) -> Result<Tensor<R>> {
    let numel = tensor.numel();
    if start + len > numel {
        return Err(Error::InvalidArgument {
            arg: "range",
            reason: format!(
                "{start}..{} out of bounds for tensor of length {numel}",
                start + len
            ),
        });
    }
    if len == 0 {
        return Ok(Tensor::try_empty(&[0], tensor.dtype(), tensor.device())?);
    }
    let flat = tensor.contiguous().flatten()?;
    let out = Tensor::<R>::try_empty(&[len], tensor.dtype(), tensor.device())?;
    let elem = tensor.dtype().size_in_bytes();
    R::copy_within_device(
        flat.storage().ptr() + (start * elem) as u64,
        out.storage().ptr(),
        len * elem,
        tensor.device(),
    )?;
    Ok(out)
}

/// Owned copy of `tensor` in fresh memory.
pub fn duplicate<R: Runtime>(tensor: &Tensor<R>) -> Result<Tensor<R>> {
    let copy = copy_range(tensor, 0, tensor.numel())?;
    Ok(copy.reshape(tensor.shape())?)
}

/// Zero-copy view of `shape` over the flat `tensor` starting at element `offset`.
///
/// The view shares storage with `tensor`. Views with a non-zero offset are
/// not contiguous; call [`Tensor::contiguous`] before reading them out.
pub fn view<R: Runtime>(tensor: &Tensor<R>, offset: usize, shape: &[usize]) -> Result<Tensor<R>> {
    let numel: usize = shape.iter().product();
    if !tensor.is_contiguous() || offset + numel > tensor.numel() {
        return Err(Error::InvalidArgument {
            arg: "offset",
            reason: format!(
                "view of {shape:?} at {offset} does not fit a contiguous tensor of length {}",
                tensor.numel()
            ),
        });
    }
    let strides = Layout::contiguous(shape).strides().to_vec();
    let layout = Layout::new(shape.to_vec(), strides, tensor.layout().offset() + offset);
    Ok(Tensor::from_parts(tensor.storage().clone(), layout))
}

/// True when both tensors have the same dtype, shape and bits.
pub fn bit_eq<R: Runtime, S: Runtime>(a: &Tensor<R>, b: &Tensor<S>) -> bool {
    a.dtype() == b.dtype()
        && a.shape() == b.shape()
        && matches!((to_le_bytes(a), to_le_bytes(b)), (Ok(x), Ok(y)) if x == y)
}

/// Sum of squared elements, accumulated in f64 on the tensor's device.
pub fn sum_squares<R: Runtime, C>(client: &C, tensor: &Tensor<R>) -> Result<f64>
where
    C: TypeConversionOps<R> + BinaryOps<R> + ReduceOps<R>,
{
    if tensor.numel() == 0 {
        return Ok(0.0);
    }
    let wide = client.cast(tensor, DType::F64)?.contiguous().flatten()?;
    let sq = client.mul(&wide, &wide)?;
    let total = client.sum(&sq, &[0], false)?;
    Ok(total.item::<f64>()?)
}

/// Parse a safetensors dtype name.
pub fn parse_dtype(name: &str) -> Result<DType> {
    match name {
        "F32" => Ok(DType::F32),
        "F64" => Ok(DType::F64),
        "F16" => Ok(DType::F16),
        "BF16" => Ok(DType::BF16),
        other => Err(Error::InvalidArgument {
            arg: "dtype",
            reason: format!("unsupported dtype name: {other}"),
        }),
    }
}

/// safetensors name of a supported dtype.
pub fn dtype_name(dtype: DType) -> Result<&'static str> {
    match dtype {
        DType::F32 => Ok("F32"),
        DType::F64 => Ok("F64"),
        DType::F16 => Ok("F16"),
        DType::BF16 => Ok("BF16"),
        other => Err(Error::UnsupportedDType { dtype: other }),
    }
}

/// `serde(with = ...)` adapter storing dtypes by name.
pub(crate) mod dtype_serde {
    use numr::dtype::DType;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dtype: &DType, s: S) -> std::result::Result<S::Ok, S::Error> {
        let name = super::dtype_name(*dtype).map_err(serde::ser::Error::custom)?;
        s.serialize_str(name)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<DType, D::Error> {
        let name = String::deserialize(d)?;
        super::parse_dtype(&name).map_err(serde::de::Error::custom)
    }
}
