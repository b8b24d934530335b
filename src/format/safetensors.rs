//! SafeTensors reader and writer for numr tensors
//!
//! # Format
//!
//! ```text
//! [8 bytes] header_size (little-endian u64)
//! [header_size bytes] JSON header containing:
//!   - "__metadata__": optional dict of string key-value pairs
//!   - "<tensor_name>": { "dtype": str, "shape": [int], "data_offsets": [start, end] }
//! [remaining bytes] raw tensor data
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::error::{Error, Result};
use crate::tensor::{self, dtype_name, parse_dtype};

fn io_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Checkpoint {
        reason: format!("{context}: {e}"),
    }
}

fn format_err(reason: impl Into<String>) -> Error {
    Error::Checkpoint {
        reason: reason.into(),
    }
}

/// Information about a tensor in a SafeTensors file
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data_start: usize,
    pub data_end: usize,
}

impl TensorInfo {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.data_end - self.data_start
    }
}

/// SafeTensors file reader
pub struct SafeTensors {
    file: File,
    data_offset: u64,
    tensors: BTreeMap<String, TensorInfo>,
    metadata: HashMap<String, String>,
}

impl SafeTensors {
    /// Open and parse a SafeTensors file header
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut file =
            File::open(path).map_err(|e| io_err(&format!("open {}", path.display()), e))?;
        let file_size = file.metadata().map_err(|e| io_err("stat", e))?.len();

        let mut buf = [0u8; 8];
        file.read_exact(&mut buf)
            .map_err(|e| io_err("read header size", e))?;
        let header_size = u64::from_le_bytes(buf);
        if header_size > file_size.saturating_sub(8) {
            return Err(format_err(format!(
                "header size {header_size} exceeds file size {file_size}"
            )));
        }
        let data_len = (file_size - 8 - header_size) as usize;

        let mut header_buf = vec![0u8; header_size as usize];
        file.read_exact(&mut header_buf)
            .map_err(|e| io_err("read header", e))?;
        let header: serde_json::Value =
            serde_json::from_slice(&header_buf).map_err(|e| io_err("parse header", e))?;
        let header_obj = header
            .as_object()
            .ok_or_else(|| format_err("header is not a JSON object"))?;

        let mut tensors = BTreeMap::new();
        let mut metadata = HashMap::new();
        for (key, value) in header_obj {
            if key == "__metadata__" {
                if let Some(meta_obj) = value.as_object() {
                    for (mk, mv) in meta_obj {
                        if let Some(s) = mv.as_str() {
                            metadata.insert(mk.clone(), s.to_string());
                        }
                    }
                }
                continue;
            }
            let info = parse_entry(key, value)?;
            if info.data_start > info.data_end || info.data_end > data_len {
                return Err(format_err(format!(
                    "tensor '{key}' spans bytes {}..{} of a {data_len}-byte data section",
                    info.data_start, info.data_end
                )));
            }
            if info.size_bytes() != info.numel() * info.dtype.size_in_bytes() {
                return Err(format_err(format!(
                    "tensor '{key}' has {} bytes for shape {:?} of {}",
                    info.size_bytes(),
                    info.shape,
                    info.dtype
                )));
            }
            tensors.insert(key.clone(), info);
        }

        Ok(SafeTensors {
            file,
            data_offset: 8 + header_size,
            tensors,
            metadata,
        })
    }

    /// Tensor names in sorted order
    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn tensor_info(&self, name: &str) -> Result<&TensorInfo> {
        self.tensors
            .get(name)
            .ok_or_else(|| format_err(format!("tensor not found: {name}")))
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Metadata value that must be present.
    pub fn require_metadata(&self, key: &str) -> Result<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| format_err(format!("missing metadata key '{key}'")))
    }

    /// Read raw tensor data as bytes
    pub fn read_tensor_bytes(&mut self, name: &str) -> Result<Vec<u8>> {
        let info = self.tensor_info(name)?.clone();
        let mut buf = vec![0u8; info.size_bytes()];
        self.file
            .seek(SeekFrom::Start(self.data_offset + info.data_start as u64))
            .map_err(|e| io_err("seek", e))?;
        self.file
            .read_exact(&mut buf)
            .map_err(|e| io_err(&format!("read tensor '{name}'"), e))?;
        Ok(buf)
    }

    /// Read a tensor in its stored dtype and shape onto `device`.
    pub fn read_tensor<R: Runtime>(&mut self, name: &str, device: &R::Device) -> Result<Tensor<R>> {
        let info = self.tensor_info(name)?.clone();
        let bytes = self.read_tensor_bytes(name)?;
        tensor::from_le_bytes(info.dtype, &info.shape, &bytes, device)
    }
}

fn parse_entry(key: &str, value: &serde_json::Value) -> Result<TensorInfo> {
    let obj = value
        .as_object()
        .ok_or_else(|| format_err(format!("tensor '{key}' is not an object")))?;
    let dtype_str = obj
        .get("dtype")
        .and_then(|v| v.as_str())
        .ok_or_else(|| format_err(format!("tensor '{key}' missing dtype")))?;
    let dtype = parse_dtype(dtype_str)?;

    let shape = obj
        .get("shape")
        .and_then(|v| v.as_array())
        .ok_or_else(|| format_err(format!("tensor '{key}' missing shape")))?
        .iter()
        .map(|v| {
            v.as_u64()
                .map(|n| n as usize)
                .ok_or_else(|| format_err(format!("tensor '{key}' has a non-integer dimension")))
        })
        .collect::<Result<Vec<_>>>()?;

    let offsets = obj
        .get("data_offsets")
        .and_then(|v| v.as_array())
        .ok_or_else(|| format_err(format!("tensor '{key}' missing data_offsets")))?;
    let [start, end] = offsets.as_slice() else {
        return Err(format_err(format!(
            "tensor '{key}' data_offsets must have 2 elements"
        )));
    };
    let offset = |v: &serde_json::Value| {
        v.as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| format_err(format!("tensor '{key}' has invalid data_offsets")))
    };

    Ok(TensorInfo {
        name: key.to_string(),
        dtype,
        shape,
        data_start: offset(start)?,
        data_end: offset(end)?,
    })
}

/// Save named tensors to SafeTensors format, each in its own dtype and shape.
///
/// Tensors are written in key order.
pub fn save_safetensors<R: Runtime, P: AsRef<Path>>(
    path: P,
    tensors: &BTreeMap<String, Tensor<R>>,
    metadata: Option<&HashMap<String, String>>,
) -> Result<()> {
    let path = path.as_ref();
    let mut header = serde_json::Map::new();
    if let Some(meta) = metadata {
        let meta_obj = meta
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        header.insert("__metadata__".into(), serde_json::Value::Object(meta_obj));
    }

    let mut current_offset = 0usize;
    for (name, t) in tensors {
        let byte_len = tensor::nbytes(t);
        header.insert(
            name.clone(),
            serde_json::json!({
                "dtype": dtype_name(t.dtype())?,
                "shape": t.shape(),
                "data_offsets": [current_offset, current_offset + byte_len],
            }),
        );
        current_offset += byte_len;
    }

    let header_bytes = serde_json::to_vec(&serde_json::Value::Object(header))
        .map_err(|e| io_err("serialize header", e))?;

    let file =
        File::create(path).map_err(|e| io_err(&format!("create {}", path.display()), e))?;
    let mut out = BufWriter::new(file);
    out.write_all(&(header_bytes.len() as u64).to_le_bytes())
        .map_err(|e| io_err("write", e))?;
    out.write_all(&header_bytes).map_err(|e| io_err("write", e))?;
    for t in tensors.values() {
        out.write_all(&tensor::to_le_bytes(t)?)
            .map_err(|e| io_err("write", e))?;
    }
    out.flush().map_err(|e| io_err("flush", e))?;
    Ok(())
}
