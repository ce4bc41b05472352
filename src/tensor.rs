use crate::error::{OpError, Result};
use crate::kernels::utils::offset_to_indices;
use std::fmt;

/// Channel block width of the blocked layout.
pub const BLOCK: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    S32,
    S8,
    U8,
}

impl DataType {
    pub fn size_of(self) -> usize {
        match self {
            DataType::F32 | DataType::S32 => 4,
            DataType::S8 | DataType::U8 => 1,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, DataType::F32)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::F32 => "f32",
            DataType::S32 => "s32",
            DataType::S8 => "s8",
            DataType::U8 => "u8",
        };
        f.write_str(name)
    }
}

/// Physical order of the four logical axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Layout {
    #[default]
    Nchw,
    Nhwc,
    /// Channels split into blocks of [`BLOCK`], innermost.
    NChw8c,
}

impl Layout {
    #[inline]
    pub fn offset(self, dims: &Dims, n: usize, c: usize, h: usize, w: usize) -> usize {
        match self {
            Layout::Nchw => ((n * dims.c + c) * dims.h + h) * dims.w + w,
            Layout::Nhwc => ((n * dims.h + h) * dims.w + w) * dims.c + c,
            Layout::NChw8c => {
                let blocks = dims.c / BLOCK;
                (((n * blocks + c / BLOCK) * dims.h + h) * dims.w + w) * BLOCK + c % BLOCK
            }
        }
    }
}

/// Logical `(n, c, h, w)` shape. Weights read it as `(o, i, kh, kw)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dims {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
}

impl Dims {
    pub const fn new(n: usize, c: usize, h: usize, w: usize) -> Self {
        Self { n, c, h, w }
    }

    pub fn count(&self) -> usize {
        self.n * self.c * self.h * self.w
    }

    pub fn as_array(&self) -> [usize; 4] {
        [self.n, self.c, self.h, self.w]
    }
}

impl From<[usize; 4]> for Dims {
    fn from(d: [usize; 4]) -> Self {
        Self::new(d[0], d[1], d[2], d[3])
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.n, self.c, self.h, self.w)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    S32(Vec<i32>),
    S8(Vec<i8>),
    U8(Vec<u8>),
}

impl TensorData {
    fn zeros(dtype: DataType, len: usize) -> Self {
        match dtype {
            DataType::F32 => TensorData::F32(vec![0.0; len]),
            DataType::S32 => TensorData::S32(vec![0; len]),
            DataType::S8 => TensorData::S8(vec![0; len]),
            DataType::U8 => TensorData::U8(vec![0; len]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::S32(v) => v.len(),
            TensorData::S8(v) => v.len(),
            TensorData::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DataType {
        match self {
            TensorData::F32(_) => DataType::F32,
            TensorData::S32(_) => DataType::S32,
            TensorData::S8(_) => DataType::S8,
            TensorData::U8(_) => DataType::U8,
        }
    }

    /// Widening load of the element at physical index `idx`.
    #[inline]
    pub fn load_f64(&self, idx: usize) -> f64 {
        match self {
            TensorData::F32(v) => v[idx] as f64,
            TensorData::S32(v) => v[idx] as f64,
            TensorData::S8(v) => v[idx] as f64,
            TensorData::U8(v) => v[idx] as f64,
        }
    }
}

/// Scalar types a tensor can hold.
pub trait Element: Copy + Default + PartialOrd + Send + Sync + fmt::Debug + 'static {
    const DTYPE: DataType;
    const LOWEST: f64;
    const HIGHEST: f64;

    fn to_f64(self) -> f64;
    fn to_i32(self) -> i32;
    /// Clamps `v` into the representable range. `v` is expected to be rounded already.
    fn saturate(v: f64) -> Self;
    fn slice(data: &TensorData) -> Option<&[Self]>;
    fn slice_mut(data: &mut TensorData) -> Option<&mut [Self]>;
    fn into_data(v: Vec<Self>) -> TensorData;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident, $lo:expr, $hi:expr) => {
        impl Element for $t {
            const DTYPE: DataType = DataType::$variant;
            const LOWEST: f64 = $lo;
            const HIGHEST: f64 = $hi;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }
            #[inline]
            fn to_i32(self) -> i32 {
                self as i32
            }
            #[inline]
            fn saturate(v: f64) -> Self {
                // `as` saturates at the integer bounds and maps NaN to zero
                v.clamp(Self::LOWEST, Self::HIGHEST) as $t
            }
            fn slice(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }
            fn slice_mut(data: &mut TensorData) -> Option<&mut [Self]> {
                match data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }
            fn into_data(v: Vec<Self>) -> TensorData {
                TensorData::$variant(v)
            }
        }
    };
}

impl_element!(i32, S32, i32::MIN as f64, i32::MAX as f64);
impl_element!(i8, S8, -128.0, 127.0);
impl_element!(u8, U8, 0.0, 255.0);

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;
    const LOWEST: f64 = f32::MIN as f64;
    const HIGHEST: f64 = f32::MAX as f64;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
    #[inline]
    fn to_i32(self) -> i32 {
        self as i32
    }
    #[inline]
    fn saturate(v: f64) -> Self {
        v.clamp(Self::LOWEST, Self::HIGHEST) as f32
    }
    fn slice(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }
    fn slice_mut(data: &mut TensorData) -> Option<&mut [Self]> {
        match data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }
    fn into_data(v: Vec<Self>) -> TensorData {
        TensorData::F32(v)
    }
}

/// A 4-d tensor descriptor owning its contiguous buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dims: Dims,
    layout: Layout,
    data: TensorData,
}

impl Tensor {
    pub fn zeros(dims: impl Into<Dims>, layout: Layout, dtype: DataType) -> Result<Self> {
        let dims = dims.into();
        check_layout(&dims, layout)?;
        Ok(Self {
            dims,
            layout,
            data: TensorData::zeros(dtype, dims.count()),
        })
    }

    pub fn from_vec<T: Element>(dims: impl Into<Dims>, layout: Layout, data: Vec<T>) -> Result<Self> {
        let dims = dims.into();
        check_layout(&dims, layout)?;
        if data.len() != dims.count() {
            return Err(OpError::Buffer(format!(
                "{} elements supplied for shape {}",
                data.len(),
                dims
            )));
        }
        Ok(Self {
            dims,
            layout,
            data: T::into_data(data),
        })
    }

    /// A bias-style vector of shape `(len, 1, 1, 1)`.
    pub fn vector<T: Element>(data: Vec<T>) -> Self {
        Self {
            dims: Dims::new(data.len(), 1, 1, 1),
            layout: Layout::Nchw,
            data: T::into_data(data),
        }
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size() * self.dtype().size_of()
    }

    pub fn raw(&self) -> &TensorData {
        &self.data
    }

    pub fn data<T: Element>(&self) -> Result<&[T]> {
        let actual = self.dtype();
        T::slice(&self.data).ok_or(OpError::DataType {
            what: "tensor",
            expected: T::DTYPE,
            actual,
        })
    }

    pub fn data_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        let actual = self.dtype();
        T::slice_mut(&mut self.data).ok_or(OpError::DataType {
            what: "tensor",
            expected: T::DTYPE,
            actual,
        })
    }

    #[inline]
    pub fn offset(&self, n: usize, c: usize, h: usize, w: usize) -> usize {
        self.layout.offset(&self.dims, n, c, h, w)
    }

    pub fn get<T: Element>(&self, n: usize, c: usize, h: usize, w: usize) -> Result<T> {
        let idx = self.offset(n, c, h, w);
        Ok(self.data::<T>()?[idx])
    }

    pub fn set<T: Element>(&mut self, n: usize, c: usize, h: usize, w: usize, v: T) -> Result<()> {
        let idx = self.offset(n, c, h, w);
        self.data_mut::<T>()?[idx] = v;
        Ok(())
    }

    #[inline]
    pub fn load_f64(&self, n: usize, c: usize, h: usize, w: usize) -> f64 {
        self.data.load_f64(self.offset(n, c, h, w))
    }

    /// Fills every element; `f` receives the logical NCHW linear index.
    pub fn fill_with<T: Element, F: FnMut(usize) -> T>(&mut self, mut f: F) -> Result<()> {
        let dims = self.dims;
        let layout = self.layout;
        let shape = dims.as_array();
        let data = self.data_mut::<T>()?;
        for i in 0..dims.count() {
            let idx = offset_to_indices(i, &shape);
            data[layout.offset(&dims, idx[0], idx[1], idx[2], idx[3])] = f(i);
        }
        Ok(())
    }

    /// Copies the elements out in logical NCHW order.
    pub fn to_nchw_vec<T: Element>(&self) -> Result<Vec<T>> {
        let data = self.data::<T>()?;
        let d = self.dims;
        let mut out = Vec::with_capacity(d.count());
        for n in 0..d.n {
            for c in 0..d.c {
                for h in 0..d.h {
                    for w in 0..d.w {
                        out.push(data[self.offset(n, c, h, w)]);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Same logical contents, different physical layout.
    pub fn reorder(&self, layout: Layout) -> Result<Tensor> {
        check_layout(&self.dims, layout)?;
        let mut out = Tensor {
            dims: self.dims,
            layout,
            data: self.data.clone(),
        };
        let d = self.dims;
        macro_rules! copy_as {
            ($t:ty) => {{
                let src = self.data::<$t>()?;
                let dst = out.data_mut::<$t>()?;
                for n in 0..d.n {
                    for c in 0..d.c {
                        for h in 0..d.h {
                            for w in 0..d.w {
                                dst[layout.offset(&d, n, c, h, w)] = src[self.layout.offset(&d, n, c, h, w)];
                            }
                        }
                    }
                }
            }};
        }
        match self.dtype() {
            DataType::F32 => copy_as!(f32),
            DataType::S32 => copy_as!(i32),
            DataType::S8 => copy_as!(i8),
            DataType::U8 => copy_as!(u8),
        }
        Ok(out)
    }
}

fn check_layout(dims: &Dims, layout: Layout) -> Result<()> {
    if layout == Layout::NChw8c && dims.c % BLOCK != 0 {
        return Err(OpError::Unsupported(format!(
            "blocked layout needs channels divisible by {}, got {}",
            BLOCK, dims.c
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_and_bytes() {
        let t = Tensor::zeros([2, 3, 4, 5], Layout::Nchw, DataType::S32).unwrap();
        assert_eq!(t.size(), 120);
        assert_eq!(t.size_in_bytes(), 480);
        let t = Tensor::zeros([2, 3, 4, 5], Layout::Nhwc, DataType::U8).unwrap();
        assert_eq!(t.size_in_bytes(), 120);
    }

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        let err = Tensor::from_vec([1, 2, 2, 2], Layout::Nchw, vec![0.0f32; 7]).unwrap_err();
        assert!(matches!(err, OpError::Buffer(_)));
    }

    #[test]
    fn test_blocked_layout_needs_full_blocks() {
        assert!(Tensor::zeros([1, 12, 2, 2], Layout::NChw8c, DataType::F32).is_err());
        assert!(Tensor::zeros([1, 16, 2, 2], Layout::NChw8c, DataType::F32).is_ok());
    }

    #[test]
    fn test_layout_offsets() {
        let d = Dims::new(2, 16, 3, 4);
        assert_eq!(Layout::Nchw.offset(&d, 1, 2, 1, 3), ((16 + 2) * 3 + 1) * 4 + 3);
        assert_eq!(Layout::Nhwc.offset(&d, 1, 2, 1, 3), ((3 + 1) * 4 + 3) * 16 + 2);
        assert_eq!(Layout::NChw8c.offset(&d, 0, 9, 0, 1), ((3 * 4) + 1) * 8 + 1);
    }

    #[test]
    fn test_reorder_keeps_logical_values() {
        let mut t = Tensor::zeros([2, 8, 3, 3], Layout::Nchw, DataType::S8).unwrap();
        t.fill_with(|i| (i % 100) as i8).unwrap();
        let nhwc = t.reorder(Layout::Nhwc).unwrap();
        let blocked = t.reorder(Layout::NChw8c).unwrap();
        assert_eq!(t.to_nchw_vec::<i8>().unwrap(), nhwc.to_nchw_vec::<i8>().unwrap());
        assert_eq!(t.to_nchw_vec::<i8>().unwrap(), blocked.to_nchw_vec::<i8>().unwrap());
        assert_ne!(t.data::<i8>().unwrap(), nhwc.data::<i8>().unwrap());
    }

    #[test]
    fn test_typed_access_checks_dtype() {
        let t = Tensor::vector(vec![1i32, 2, 3]);
        assert_eq!(t.dims(), Dims::new(3, 1, 1, 1));
        assert!(t.data::<f32>().is_err());
        assert_eq!(t.get::<i32>(2, 0, 0, 0).unwrap(), 3);
    }

    #[test]
    fn test_saturate() {
        assert_eq!(u8::saturate(300.0), 255);
        assert_eq!(u8::saturate(-3.0), 0);
        assert_eq!(i8::saturate(-200.0), -128);
        assert_eq!(i32::saturate(1e12), i32::MAX);
        assert_eq!(f32::saturate(1e12), 1e12);
        assert_eq!(f32::saturate(1e300), f32::MAX);
        // odd values above 2^24 survive the wide path
        assert_eq!(i32::saturate(18_653_505.0), 18_653_505);
    }
}
