use ndarray as nd;
use ndarray::ShapeBuilder;
use strum_macros::Display;

/// Element types a legacy numpy payload can carry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}
impl DType {
    pub fn item_size(self) -> usize {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }
    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }
    /// Parses a numpy type descriptor such as ``f8``, ``<i4`` or ``b1``.
    /// Returns ``None`` for descriptors without a fixed numeric layout (object,
    /// strings, half floats, ...)
    pub fn from_descr(descr: &str) -> Option<Self> {
        let code = descr.trim_start_matches(|c| matches!(c, '<' | '>' | '|' | '='));
        let dtype = match code {
            "b1" | "?" => Self::Bool,
            "i1" => Self::I8,
            "i2" => Self::I16,
            "i4" => Self::I32,
            "i8" => Self::I64,
            "u1" => Self::U8,
            "u2" => Self::U16,
            "u4" => Self::U32,
            "u8" => Self::U64,
            "f4" => Self::F32,
            "f8" => Self::F64,
            _ => return None,
        };
        Some(dtype)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}
impl ByteOrder {
    /// numpy byte order characters. ``|`` (not applicable) and ``=`` (native)
    /// are read as little endian
    pub fn from_char(c: &str) -> Self {
        if c == ">" {
            Self::Big
        } else {
            Self::Little
        }
    }
    fn uint(self, bytes: &[u8]) -> u64 {
        let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
        match self {
            Self::Little => bytes.iter().rev().fold(0, fold),
            Self::Big => bytes.iter().fold(0, fold),
        }
    }
}

/// Numeric payload of a dense array. Integer payloads are kept as integers so
/// index tensors survive without a detour through floating point
#[derive(Clone, Debug, PartialEq)]
pub enum ArrayData {
    Float(nd::ArrayD<f64>),
    Int(nd::ArrayD<i64>),
}

/// A dense, owned, c-ordered numeric array together with the dtype it was
/// stored with
#[derive(Clone, Debug, PartialEq)]
pub struct DenseArray {
    dtype: DType,
    data: ArrayData,
}
impl DenseArray {
    pub fn from_float(dtype: DType, values: nd::ArrayD<f64>) -> Self {
        Self {
            dtype,
            data: ArrayData::Float(values),
        }
    }
    pub fn from_int(dtype: DType, values: nd::ArrayD<i64>) -> Self {
        Self {
            dtype,
            data: ArrayData::Int(values),
        }
    }
    pub fn dtype(&self) -> DType {
        self.dtype
    }
    pub fn data(&self) -> &ArrayData {
        &self.data
    }
    pub fn shape(&self) -> &[usize] {
        match &self.data {
            ArrayData::Float(a) => a.shape(),
            ArrayData::Int(a) => a.shape(),
        }
    }
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    #[allow(clippy::cast_precision_loss)]
    pub fn to_f64(&self) -> nd::ArrayD<f64> {
        match &self.data {
            ArrayData::Float(a) => a.clone(),
            ArrayData::Int(a) => a.mapv(|x| x as f64),
        }
    }

    /// Decodes a raw numpy buffer of ``shape`` elements. ``fortran`` selects
    /// column-major element order in ``bytes``; the result is always c-ordered.
    #[allow(clippy::cast_possible_wrap)]
    #[allow(clippy::cast_possible_truncation)]
    pub fn decode(dtype: DType, order: ByteOrder, shape: &[usize], fortran: bool, bytes: &[u8]) -> Result<Self, String> {
        let item_size = dtype.item_size();
        let nr_bytes = shape
            .iter()
            .try_fold(item_size, |acc, d| acc.checked_mul(*d))
            .ok_or_else(|| format!("array of shape {shape:?} and dtype {dtype} is too large"))?;
        if bytes.len() != nr_bytes {
            return Err(format!(
                "array of shape {shape:?} and dtype {dtype} needs {nr_bytes} bytes, buffer has {}",
                bytes.len()
            ));
        }
        let words = bytes.chunks_exact(item_size).map(|c| order.uint(c));
        let data = match dtype {
            DType::F64 => ArrayData::Float(to_array(shape, fortran, words.map(f64::from_bits).collect())?),
            DType::F32 => ArrayData::Float(to_array(shape, fortran, words.map(|w| f64::from(f32::from_bits(w as u32))).collect())?),
            DType::Bool => ArrayData::Int(to_array(shape, fortran, words.map(|w| i64::from(w != 0)).collect())?),
            DType::I8 => ArrayData::Int(to_array(shape, fortran, words.map(|w| i64::from(w as u8 as i8)).collect())?),
            DType::I16 => ArrayData::Int(to_array(shape, fortran, words.map(|w| i64::from(w as u16 as i16)).collect())?),
            DType::I32 => ArrayData::Int(to_array(shape, fortran, words.map(|w| i64::from(w as u32 as i32)).collect())?),
            // u64 beyond i64::MAX wraps, which maps the 2^64-1 "no parent" marker onto -1
            DType::I64 | DType::U8 | DType::U16 | DType::U32 | DType::U64 => ArrayData::Int(to_array(shape, fortran, words.map(|w| w as i64).collect())?),
        };
        Ok(Self { dtype, data })
    }
}

fn to_array<T: Clone>(shape: &[usize], fortran: bool, values: Vec<T>) -> Result<nd::ArrayD<T>, String> {
    let arr = if fortran {
        nd::ArrayD::from_shape_vec(nd::IxDyn(shape).f(), values)
    } else {
        nd::ArrayD::from_shape_vec(nd::IxDyn(shape), values)
    }
    .map_err(|e| e.to_string())?;
    Ok(arr.as_standard_layout().into_owned())
}

impl From<nd::Array2<f64>> for DenseArray {
    fn from(values: nd::Array2<f64>) -> Self {
        Self::from_float(DType::F64, values.into_dyn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn descr_parsing() {
        assert_eq!(DType::from_descr("f8"), Some(DType::F64));
        assert_eq!(DType::from_descr("<f4"), Some(DType::F32));
        assert_eq!(DType::from_descr("|u1"), Some(DType::U8));
        assert_eq!(DType::from_descr("O8"), None);
    }

    #[test]
    fn decode_little_and_big_endian() {
        let le: Vec<u8> = [1.5f64, -2.0].iter().flat_map(|x| x.to_le_bytes()).collect();
        let be: Vec<u8> = [1.5f64, -2.0].iter().flat_map(|x| x.to_be_bytes()).collect();
        let a = DenseArray::decode(DType::F64, ByteOrder::Little, &[2], false, &le).unwrap();
        let b = DenseArray::decode(DType::F64, ByteOrder::Big, &[2], false, &be).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_f64(), array![1.5, -2.0].into_dyn());
    }

    #[test]
    fn decode_fortran_order_is_transposed_into_c_order() {
        // column-major buffer of [[1, 2, 3], [4, 5, 6]]
        let bytes: Vec<u8> = [1i32, 4, 2, 5, 3, 6].iter().flat_map(|x| x.to_le_bytes()).collect();
        let arr = DenseArray::decode(DType::I32, ByteOrder::Little, &[2, 3], true, &bytes).unwrap();
        assert_eq!(arr.data(), &ArrayData::Int(array![[1, 2, 3], [4, 5, 6]].into_dyn()));
    }

    #[test]
    fn decode_keeps_uint32_sentinel() {
        let bytes: Vec<u8> = [u32::MAX, 0].iter().flat_map(|x| x.to_le_bytes()).collect();
        let arr = DenseArray::decode(DType::U32, ByteOrder::Little, &[2], false, &bytes).unwrap();
        assert_eq!(arr.data(), &ArrayData::Int(array![4_294_967_295, 0].into_dyn()));
    }

    #[test]
    fn decode_rejects_short_buffers() {
        assert!(DenseArray::decode(DType::F32, ByteOrder::Little, &[3], false, &[0u8; 8]).is_err());
    }

    #[test]
    fn decode_rejects_overflowing_shapes() {
        let huge = usize::MAX / 4;
        let err = DenseArray::decode(DType::F64, ByteOrder::Little, &[huge, huge], false, &[]).unwrap_err();
        assert!(err.contains("too large"), "{err}");
        assert!(DenseArray::decode(DType::F64, ByteOrder::Little, &[huge], false, &[]).is_err());
    }
}
