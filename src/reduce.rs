//! Element-wise reduction kernels used by the engine threads and the
//! compression pipeline.
//!
//! All kernels interpret byte buffers as packed elements of a runtime
//! dtype tag, iterate in a fixed order, and never reassociate, so output
//! is bit-reproducible for identical inputs. Buffers need no particular
//! alignment: elements are read and written through byte copies.
//!
//! Trailing bytes (`len % size_of::<T>()`) are copied verbatim by `copy`
//! and ignored by the arithmetic kernels.

use half::f16;

use crate::error::{Result, ServerError};
use crate::types::DataType;

/// Read/write one element at an arbitrary byte offset (alignment-safe).
trait Elem: Copy + 'static {
    fn read(bytes: &[u8]) -> Self;
    fn write(self, bytes: &mut [u8]);
    fn add(self, other: Self) -> Self;
}

macro_rules! impl_elem {
    (int: $($ty:ty),*) => {
        $(
            impl Elem for $ty {
                #[inline]
                fn read(bytes: &[u8]) -> Self {
                    Self::from_ne_bytes(bytes.try_into().expect("slice length matches type size"))
                }
                #[inline]
                fn write(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_ne_bytes());
                }
                #[inline]
                fn add(self, other: Self) -> Self {
                    self.wrapping_add(other)
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Elem for $ty {
                #[inline]
                fn read(bytes: &[u8]) -> Self {
                    Self::from_ne_bytes(bytes.try_into().expect("slice length matches type size"))
                }
                #[inline]
                fn write(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_ne_bytes());
                }
                #[inline]
                fn add(self, other: Self) -> Self {
                    self + other
                }
            }
        )*
    };
}

impl_elem!(int: i8, i32, i64, u8);
impl_elem!(float: f32, f64);

impl Elem for f16 {
    #[inline]
    fn read(bytes: &[u8]) -> Self {
        f16::from_ne_bytes(bytes.try_into().expect("slice length matches type size"))
    }
    #[inline]
    fn write(self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.to_ne_bytes());
    }
    #[inline]
    fn add(self, other: Self) -> Self {
        f16::from_f32(self.to_f32() + other.to_f32())
    }
}

/// Floating-point elements additionally support scaled accumulation.
trait FloatElem: Elem {
    /// `self + alpha * other`
    fn fma(self, alpha: f32, other: Self) -> Self;
    fn zero() -> Self;
}

impl FloatElem for f32 {
    #[inline]
    fn fma(self, alpha: f32, other: Self) -> Self {
        self + alpha * other
    }
    #[inline]
    fn zero() -> Self {
        0.0
    }
}

impl FloatElem for f64 {
    #[inline]
    fn fma(self, alpha: f32, other: Self) -> Self {
        self + alpha as f64 * other
    }
    #[inline]
    fn zero() -> Self {
        0.0
    }
}

impl FloatElem for f16 {
    #[inline]
    fn fma(self, alpha: f32, other: Self) -> Self {
        f16::from_f32(self.to_f32() + alpha * other.to_f32())
    }
    #[inline]
    fn zero() -> Self {
        f16::from_f32(0.0)
    }
}

fn sum_typed<T: Elem>(dst: &mut [u8], src: &[u8], len: usize) {
    let t = std::mem::size_of::<T>();
    for i in 0..len / t {
        let off = i * t;
        let a = T::read(&dst[off..off + t]);
        let b = T::read(&src[off..off + t]);
        a.add(b).write(&mut dst[off..off + t]);
    }
}

fn sum_alpha_typed<T: FloatElem>(dst: &mut [u8], src: &[u8], len: usize, alpha: f32) {
    let t = std::mem::size_of::<T>();
    for i in 0..len / t {
        let off = i * t;
        let a = T::read(&dst[off..off + t]);
        let b = T::read(&src[off..off + t]);
        a.fma(alpha, b).write(&mut dst[off..off + t]);
    }
}

fn sum3_typed<T: FloatElem>(dst: &mut [u8], src1: &[u8], src2: &[u8], len: usize, alpha: f32) {
    let t = std::mem::size_of::<T>();
    for i in 0..len / t {
        let off = i * t;
        let a = T::read(&src1[off..off + t]);
        let b = T::read(&src2[off..off + t]);
        a.fma(alpha, b).write(&mut dst[off..off + t]);
    }
}

fn sparse_sum_typed<T: FloatElem>(
    dst: &mut [u8],
    src: &mut [u8],
    alpha: f32,
    idx_list: &[u32],
) {
    let t = std::mem::size_of::<T>();
    for &idx in idx_list {
        let off = idx as usize * t;
        let a = T::read(&dst[off..off + t]);
        let b = T::read(&src[off..off + t]);
        a.fma(alpha, b).write(&mut dst[off..off + t]);
        T::zero().write(&mut src[off..off + t]);
    }
}

/// CPU reduction kernels, bundled so the server context owns one reducer
/// the way it owns the store maps.
#[derive(Debug, Default)]
pub struct CpuReducer;

impl CpuReducer {
    pub fn new() -> Self {
        Self
    }

    /// Byte copy, including any trailing partial element.
    pub fn copy(&self, dst: &mut [u8], src: &[u8]) {
        dst[..src.len()].copy_from_slice(src);
    }

    /// `dst += src` over `len / size` elements of `dtype`.
    pub fn sum(&self, dst: &mut [u8], src: &[u8], len: usize, dtype: DataType) -> Result<()> {
        match dtype {
            DataType::F32 => sum_typed::<f32>(dst, src, len),
            DataType::F64 => sum_typed::<f64>(dst, src, len),
            DataType::F16 => sum_typed::<f16>(dst, src, len),
            DataType::U8 => sum_typed::<u8>(dst, src, len),
            DataType::I32 => sum_typed::<i32>(dst, src, len),
            DataType::I8 => sum_typed::<i8>(dst, src, len),
            DataType::I64 => sum_typed::<i64>(dst, src, len),
        }
        Ok(())
    }

    /// `dst += alpha * src` over float elements.
    pub fn sum_alpha(
        &self,
        dst: &mut [u8],
        src: &[u8],
        len: usize,
        dtype: DataType,
        alpha: f32,
    ) -> Result<()> {
        match dtype {
            DataType::F32 => sum_alpha_typed::<f32>(dst, src, len, alpha),
            DataType::F64 => sum_alpha_typed::<f64>(dst, src, len, alpha),
            DataType::F16 => sum_alpha_typed::<f16>(dst, src, len, alpha),
            _ => {
                return Err(ServerError::UnsupportedDType {
                    dtype,
                    op: "sum_alpha",
                })
            }
        }
        Ok(())
    }

    /// `dst = src1 + alpha * src2` over float elements.
    pub fn sum3(
        &self,
        dst: &mut [u8],
        src1: &[u8],
        src2: &[u8],
        len: usize,
        dtype: DataType,
        alpha: f32,
    ) -> Result<()> {
        match dtype {
            DataType::F32 => sum3_typed::<f32>(dst, src1, src2, len, alpha),
            DataType::F64 => sum3_typed::<f64>(dst, src1, src2, len, alpha),
            DataType::F16 => sum3_typed::<f16>(dst, src1, src2, len, alpha),
            _ => {
                return Err(ServerError::UnsupportedDType {
                    dtype,
                    op: "sum3",
                })
            }
        }
        Ok(())
    }

    /// `dst[i] += alpha * src[i]` at the listed indices only, zeroing
    /// `src` at those indices (folds an error-feedback residue into the
    /// gradient and consumes it in one pass).
    pub fn sparse_sum(
        &self,
        dst: &mut [u8],
        src: &mut [u8],
        dtype: DataType,
        alpha: f32,
        idx_list: &[u32],
    ) -> Result<()> {
        match dtype {
            DataType::F32 => sparse_sum_typed::<f32>(dst, src, alpha, idx_list),
            DataType::F64 => sparse_sum_typed::<f64>(dst, src, alpha, idx_list),
            DataType::F16 => sparse_sum_typed::<f16>(dst, src, alpha, idx_list),
            _ => {
                return Err(ServerError::UnsupportedDType {
                    dtype,
                    op: "sparse_sum",
                })
            }
        }
        Ok(())
    }

    /// Widen fp16 `src` into fp32 `dst`. `src.len()` must be even and
    /// `dst` at least twice as long.
    pub fn promote(&self, dst: &mut [u8], src: &[u8]) {
        let n = src.len() / 2;
        for i in 0..n {
            let h = f16::read(&src[i * 2..i * 2 + 2]);
            h.to_f32().write(&mut dst[i * 4..i * 4 + 4]);
        }
    }

    /// Narrow fp32 `src` into fp16 `dst`. `dst.len()` must be half of the
    /// element span of `src`.
    pub fn demote(&self, dst: &mut [u8], src: &[u8]) {
        let n = dst.len() / 2;
        for i in 0..n {
            let v = f32::read(&src[i * 4..i * 4 + 4]);
            f16::from_f32(v).write(&mut dst[i * 2..i * 2 + 2]);
        }
    }

    /// Accumulate fp16 `src` into fp32 `dst`: `dst[i] += widen(src[i])`.
    pub fn sum_mixed_precision(&self, dst: &mut [u8], src: &[u8]) {
        let n = src.len() / 2;
        for i in 0..n {
            let h = f16::read(&src[i * 2..i * 2 + 2]).to_f32();
            let a = f32::read(&dst[i * 4..i * 4 + 4]);
            (a + h).write(&mut dst[i * 4..i * 4 + 4]);
        }
    }

    /// Raw-address byte copy.
    ///
    /// # Safety
    /// `dst` and `src` must each point to at least `len` valid,
    /// non-overlapping bytes for the duration of the call.
    pub unsafe fn copy_ptr(&self, dst: u64, src: u64, len: usize) {
        let d = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, len) };
        let s = unsafe { std::slice::from_raw_parts(src as *const u8, len) };
        self.copy(d, s);
    }

    /// Raw-address `dst += src`.
    ///
    /// # Safety
    /// Same contract as [`CpuReducer::copy_ptr`].
    pub unsafe fn sum_ptr(&self, dst: u64, src: u64, len: usize, dtype: DataType) -> Result<()> {
        let d = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, len) };
        let s = unsafe { std::slice::from_raw_parts(src as *const u8, len) };
        self.sum(d, s, len, dtype)
    }

    /// Raw-address fp16 -> fp32 widening copy; `src_len` is the fp16 byte
    /// count, `dst` must hold `2 * src_len` bytes.
    ///
    /// # Safety
    /// Same contract as [`CpuReducer::copy_ptr`], with the doubled `dst` span.
    pub unsafe fn promote_ptr(&self, dst: u64, src: u64, src_len: usize) {
        let d = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, src_len * 2) };
        let s = unsafe { std::slice::from_raw_parts(src as *const u8, src_len) };
        self.promote(d, s);
    }

    /// Raw-address fp32 -> fp16 narrowing copy; `dst_len` is the fp16 byte
    /// count, `src` must hold `2 * dst_len` bytes.
    ///
    /// # Safety
    /// Same contract as [`CpuReducer::copy_ptr`], with the doubled `src` span.
    pub unsafe fn demote_ptr(&self, dst: u64, src: u64, dst_len: usize) {
        let d = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, dst_len) };
        let s = unsafe { std::slice::from_raw_parts(src as *const u8, dst_len * 2) };
        self.demote(d, s);
    }

    /// Raw-address fp16-into-fp32 accumulation; `src_len` is the fp16 byte
    /// count.
    ///
    /// # Safety
    /// Same contract as [`CpuReducer::copy_ptr`], with the doubled `dst` span.
    pub unsafe fn sum_mixed_ptr(&self, dst: u64, src: u64, src_len: usize) {
        let d = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, src_len * 2) };
        let s = unsafe { std::slice::from_raw_parts(src as *const u8, src_len) };
        self.sum_mixed_precision(d, s);
    }
}

/// Borrow a value slice as raw bytes (test and codec helper).
pub(crate) fn as_bytes<T>(v: &[T]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(v.as_ptr() as *const u8, std::mem::size_of_val(v)) }
}

/// Borrow a mutable value slice as raw bytes.
pub(crate) fn as_bytes_mut<T>(v: &mut [T]) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(v.as_mut_ptr() as *mut u8, std::mem::size_of_val(v)) }
}
