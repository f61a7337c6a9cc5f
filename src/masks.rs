// Loading label and exclusion grids from numpy files.
//
// A file either stores the grid directly (.npy) or stores a bundle of named
// arrays with the grid under the "masks" key: a .npz archive, or a
// dictionary saved with `np.save` (a pickled 0-d object array, which is what
// cellpose writes to *_seg.npy). Either way the payload is resolved to a
// single `LabelGrid` here, before any counting happens.

use ndarray::{Array2, Ix2, ShapeBuilder};
use ndarray_npy::{NpzReader, ReadNpyExt, ReadableElement};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::Path;

use crate::census::{Label, LabelGrid};
use crate::errors::MaskError;
use crate::pickle::{self, ArrayData, NdArray, Value};

pub const MASK_KEY: &str = "masks";

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// How stored values become grid cells.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MaskRole {
    /// Values are cell labels and must be integral.
    Labels,
    /// Only zero vs. non-zero matters; any numeric type is accepted.
    Exclusion,
}

pub enum MaskPayload {
    Grid(LabelGrid),
    KeyedBundle(BTreeMap<String, LabelGrid>),
}

impl MaskPayload {
    pub fn into_grid(self) -> Result<LabelGrid, MaskError> {
        match self {
            MaskPayload::Grid(grid) => Ok(grid),
            MaskPayload::KeyedBundle(mut entries) => entries
                .remove(MASK_KEY)
                .ok_or_else(|| MaskError::MissingKey(MASK_KEY.to_string())),
        }
    }
}

pub fn load_mask(path: &Path, role: MaskRole) -> Result<LabelGrid, MaskError> {
    read_payload(path, role)?.into_grid()
}

pub fn read_payload(path: &Path, role: MaskRole) -> Result<MaskPayload, MaskError> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "npy" => {
            let mut bytes = Vec::new();
            File::open(path)?.read_to_end(&mut bytes)?;
            read_npy_payload(&bytes, role)
        }
        "npz" => read_npz_payload(File::open(path)?, role),
        _ => Err(MaskError::UnsupportedExtension(ext)),
    }
}

pub fn read_npy_payload(bytes: &[u8], role: MaskRole) -> Result<MaskPayload, MaskError> {
    if is_object_array(bytes) {
        let data = bytes
            .get(npy_data_offset(bytes)?..)
            .ok_or(MaskError::BadHeader)?;
        return read_pickled_bundle(data, role);
    }
    decode_grid(&mut NpyBytes(bytes), role).map(MaskPayload::Grid)
}

pub fn read_npz_payload<R: Read + Seek>(reader: R, role: MaskRole) -> Result<MaskPayload, MaskError> {
    let mut npz = NpzReader::new(reader)?;
    let mut entries = BTreeMap::new();
    for name in npz.names()? {
        let key = name.strip_suffix(".npy").unwrap_or(&name).to_string();
        let grid = decode_grid(
            &mut NpzMember {
                npz: &mut npz,
                name: &name,
            },
            role,
        );
        match grid {
            Ok(grid) => {
                entries.insert(key, grid);
            }
            // other members (flows, images, ...) need not be label grids
            Err(err) if key == MASK_KEY => return Err(err),
            Err(err) => log::debug!("Ignoring bundle member '{}': {}", name, err),
        }
    }
    Ok(MaskPayload::KeyedBundle(entries))
}

// Object arrays carry a '|O' descriptor in the header dictionary.
fn is_object_array(bytes: &[u8]) -> bool {
    if !bytes.starts_with(NPY_MAGIC) {
        return false;
    }
    let header = &bytes[..bytes.len().min(512)];
    let header = String::from_utf8_lossy(header);
    header.contains("'|O'")
}

// Version 1.x headers have a u16 length, 2.x and 3.x a u32.
fn npy_data_offset(bytes: &[u8]) -> Result<usize, MaskError> {
    let version = *bytes.get(NPY_MAGIC.len()).ok_or(MaskError::BadHeader)?;
    match version {
        1 => {
            let len = bytes.get(8..10).ok_or(MaskError::BadHeader)?;
            Ok(10 + u16::from_le_bytes([len[0], len[1]]) as usize)
        }
        2 | 3 => {
            let len = bytes.get(8..12).ok_or(MaskError::BadHeader)?;
            Ok(12 + u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize)
        }
        _ => Err(MaskError::BadHeader),
    }
}

fn read_pickled_bundle(data: &[u8], role: MaskRole) -> Result<MaskPayload, MaskError> {
    let value = pickle::loads(data)?;

    // np.save(dict) stores a 0-d object array holding the dict
    let dict = match &value {
        Value::Array(NdArray {
            data: ArrayData::Objects(items),
            ..
        }) if items.len() == 1 => &items[0],
        other => other,
    };
    let Value::Dict(items) = dict else {
        return Err(MaskError::MissingKey(MASK_KEY.to_string()));
    };

    let mut entries = BTreeMap::new();
    for (key, value) in items {
        let (Value::Str(key), Value::Array(array)) = (key, value) else {
            if matches!(key, Value::Str(k) if k == MASK_KEY) {
                return Err(MaskError::UnsupportedDtype);
            }
            continue;
        };
        match pickled_grid(array, role) {
            Ok(grid) => {
                entries.insert(key.clone(), grid);
            }
            Err(err) if key == MASK_KEY => return Err(err),
            Err(err) => log::debug!("Ignoring bundle member '{}': {}", key, err),
        }
    }
    Ok(MaskPayload::KeyedBundle(entries))
}

fn pickled_grid(array: &NdArray, role: MaskRole) -> Result<LabelGrid, MaskError> {
    let &[nrows, ncols] = array.shape.as_slice() else {
        return Err(MaskError::NotAGrid(array.shape.clone()));
    };
    let (ArrayData::Raw(bytes), Some(dtype)) = (&array.data, &array.dtype) else {
        return Err(MaskError::UnsupportedDtype);
    };

    let little = dtype.byte_order != '>';
    let values = match dtype.descr.as_str() {
        "i1" => decode_raw::<i8>(bytes, little, role)?,
        "i2" => decode_raw::<i16>(bytes, little, role)?,
        "i4" => decode_raw::<i32>(bytes, little, role)?,
        "i8" => decode_raw::<i64>(bytes, little, role)?,
        "u1" => decode_raw::<u8>(bytes, little, role)?,
        "u2" => decode_raw::<u16>(bytes, little, role)?,
        "u4" => decode_raw::<u32>(bytes, little, role)?,
        "u8" => decode_raw::<u64>(bytes, little, role)?,
        "b1" => decode_raw::<bool>(bytes, little, role)?,
        "f4" => decode_raw::<f32>(bytes, little, role)?,
        "f8" => decode_raw::<f64>(bytes, little, role)?,
        _ => return Err(MaskError::UnsupportedDtype),
    };

    let grid = if array.fortran_order {
        Array2::from_shape_vec((nrows, ncols).f(), values)?
    } else {
        Array2::from_shape_vec((nrows, ncols), values)?
    };
    Ok(grid)
}

fn decode_raw<T: MaskElement>(bytes: &[u8], little: bool, role: MaskRole) -> Result<Vec<Label>, MaskError> {
    if bytes.len() % T::SIZE != 0 {
        return Err(MaskError::BadHeader);
    }
    bytes
        .chunks_exact(T::SIZE)
        .map(|chunk| {
            let v = if little {
                T::from_le(chunk)
            } else {
                T::from_be(chunk)
            };
            to_cell(v, role)
        })
        .collect()
}

trait MaskElement: ReadableElement + Copy {
    const SIZE: usize;

    // `bytes` is exactly SIZE long
    fn from_le(bytes: &[u8]) -> Self;
    fn from_be(bytes: &[u8]) -> Self;

    fn to_label(self) -> Result<Label, MaskError>;
    fn is_nonzero(self) -> bool;
}

macro_rules! int_element {
    ($($t:ty),*) => {$(
        impl MaskElement for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn from_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_le_bytes(buf)
            }

            fn from_be(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_be_bytes(buf)
            }

            fn to_label(self) -> Result<Label, MaskError> {
                Ok(Label::from(self))
            }

            fn is_nonzero(self) -> bool {
                self != 0
            }
        }
    )*};
}

int_element!(i8, i16, i32, i64, u8, u16, u32);

impl MaskElement for u64 {
    const SIZE: usize = 8;

    fn from_le(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        u64::from_le_bytes(buf)
    }

    fn from_be(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        u64::from_be_bytes(buf)
    }

    fn to_label(self) -> Result<Label, MaskError> {
        Label::try_from(self).map_err(|_| MaskError::ValueOutOfRange(self))
    }

    fn is_nonzero(self) -> bool {
        self != 0
    }
}

impl MaskElement for bool {
    const SIZE: usize = 1;

    fn from_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn from_be(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn to_label(self) -> Result<Label, MaskError> {
        Ok(Label::from(self))
    }

    fn is_nonzero(self) -> bool {
        self
    }
}

// Floats are never labels; rounding would silently merge or split cells.
macro_rules! float_element {
    ($($t:ty),*) => {$(
        impl MaskElement for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn from_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_le_bytes(buf)
            }

            fn from_be(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_be_bytes(buf)
            }

            fn to_label(self) -> Result<Label, MaskError> {
                Err(MaskError::UnsupportedDtype)
            }

            fn is_nonzero(self) -> bool {
                self != 0.0
            }
        }
    )*};
}

float_element!(f32, f64);

fn to_cell<T: MaskElement>(v: T, role: MaskRole) -> Result<Label, MaskError> {
    match role {
        MaskRole::Labels => v.to_label(),
        MaskRole::Exclusion => Ok(Label::from(v.is_nonzero())),
    }
}

trait GridSource {
    fn read_as<T: ReadableElement>(&mut self) -> Result<Array2<T>, MaskError>;
}

struct NpyBytes<'a>(&'a [u8]);

impl GridSource for NpyBytes<'_> {
    fn read_as<T: ReadableElement>(&mut self) -> Result<Array2<T>, MaskError> {
        Ok(Array2::<T>::read_npy(Cursor::new(self.0))?)
    }
}

struct NpzMember<'a, R: Read + Seek> {
    npz: &'a mut NpzReader<R>,
    name: &'a str,
}

impl<R: Read + Seek> GridSource for NpzMember<'_, R> {
    fn read_as<T: ReadableElement>(&mut self) -> Result<Array2<T>, MaskError> {
        Ok(self.npz.by_name::<ndarray::OwnedRepr<T>, Ix2>(self.name)?)
    }
}

fn convert<T: MaskElement>(grid: Array2<T>, role: MaskRole) -> Result<LabelGrid, MaskError> {
    let mut out = LabelGrid::zeros(grid.raw_dim());
    for (dst, &src) in out.iter_mut().zip(grid.iter()) {
        *dst = to_cell(src, role)?;
    }
    Ok(out)
}

// Try each supported element type until one matches the stored descriptor.
fn decode_grid<S: GridSource>(source: &mut S, role: MaskRole) -> Result<LabelGrid, MaskError> {
    macro_rules! try_element {
        ($($t:ty),*) => {$(
            match source.read_as::<$t>() {
                Ok(grid) => return convert(grid, role),
                Err(err) if err.is_wrong_descriptor() => {}
                Err(err) => return Err(err),
            }
        )*};
    }

    try_element!(i64, i32, i16, i8, u64, u32, u16, u8, bool);
    if role == MaskRole::Exclusion {
        try_element!(f64, f32);
    }

    Err(MaskError::UnsupportedDtype)
}
