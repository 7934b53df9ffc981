//! VBScript arrays: zero-based, multi-dimensional, stored column-major
//! (first index varies fastest) like an OLE SAFEARRAY.

use super::error::{FaultKind, RuntimeError};
use super::value::Value;

/// Arrays larger than this are refused rather than allocated.
const MAX_ELEMENTS: usize = 1 << 28;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct VbArray {
    lengths: Vec<usize>,
    data: Vec<Value>,
    /// Declared with bounds (`Dim a(3)`); cannot be `ReDim`med.
    fixed: bool,
}

impl VbArray {
    /// Allocate with per-dimension lengths, every element Empty.
    pub fn new(lengths: &[usize]) -> Result<Self, RuntimeError> {
        let total = element_count(lengths)?;
        Ok(Self {
            lengths: lengths.to_vec(),
            data: vec![Value::Empty; total],
            fixed: false,
        })
    }

    /// A one-dimensional array holding `values` (the `Array(...)` builtin,
    /// `Split`, dictionary `Keys`).
    pub fn from_vec(values: Vec<Value>) -> Self {
        Self {
            lengths: vec![values.len()],
            data: values,
            fixed: false,
        }
    }

    /// `ReDim a(u1, u2, ...)`: bounds are inclusive, so each is one less
    /// than the allocated length.
    pub fn redim(upper_bounds: &[i64]) -> Result<Self, RuntimeError> {
        let lengths = lengths_from_bounds(upper_bounds)?;
        Self::new(&lengths)
    }

    /// Allocate for a `Dim a(3)` declaration.
    pub fn fixed(upper_bounds: &[i64]) -> Result<Self, RuntimeError> {
        let mut arr = Self::redim(upper_bounds)?;
        arr.fixed = true;
        Ok(arr)
    }

    /// `ReDim Preserve`: only the last dimension may change. The surviving
    /// prefix is the product of the leading lengths times the smaller of the
    /// old and new last lengths, copied in one block.
    pub fn redim_preserve(&self, upper_bounds: &[i64]) -> Result<Self, RuntimeError> {
        if self.fixed {
            return Err(RuntimeError::new(FaultKind::ArrayLocked));
        }
        let new_lengths = lengths_from_bounds(upper_bounds)?;
        if self.lengths.is_empty() {
            return Self::new(&new_lengths);
        }
        if new_lengths.len() != self.lengths.len() {
            return Err(RuntimeError::invalid_argument(format!(
                "ReDim Preserve cannot change the number of dimensions from {} to {}",
                self.lengths.len(),
                new_lengths.len()
            )));
        }
        let last = self.lengths.len() - 1;
        for (dim, (old, new)) in self.lengths.iter().zip(&new_lengths).enumerate().take(last) {
            if old != new {
                return Err(RuntimeError::invalid_argument(format!(
                    "ReDim Preserve can only resize the last dimension; dimension {} changed from {} to {}",
                    dim + 1,
                    old,
                    new
                )));
            }
        }
        let mut next = Self::new(&new_lengths)?;
        let leading: usize = self.lengths[..last].iter().product();
        let keep = leading * self.lengths[last].min(new_lengths[last]);
        next.data[..keep].clone_from_slice(&self.data[..keep]);
        Ok(next)
    }

    pub fn rank(&self) -> usize {
        self.lengths.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.lengths
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// `UBound(a, dim)`, `dim` 1-based. An unallocated dynamic array has no
    /// bounds.
    pub fn ubound(&self, dim: usize) -> Result<i64, RuntimeError> {
        let len = dim
            .checked_sub(1)
            .and_then(|d| self.lengths.get(d))
            .ok_or_else(RuntimeError::subscript_out_of_range)?;
        Ok(*len as i64 - 1)
    }

    pub fn lbound(&self, dim: usize) -> Result<i64, RuntimeError> {
        self.ubound(dim).map(|_| 0)
    }

    fn offset(&self, indices: &[i64]) -> Result<usize, RuntimeError> {
        if indices.len() != self.lengths.len() {
            return Err(RuntimeError::subscript_out_of_range());
        }
        let mut offset = 0usize;
        let mut stride = 1usize;
        for (&i, &len) in indices.iter().zip(&self.lengths) {
            let i = usize::try_from(i).map_err(|_| RuntimeError::subscript_out_of_range())?;
            if i >= len {
                return Err(RuntimeError::subscript_out_of_range());
            }
            offset += i * stride;
            stride *= len;
        }
        Ok(offset)
    }

    pub fn get(&self, indices: &[i64]) -> Result<Value, RuntimeError> {
        let at = self.offset(indices)?;
        Ok(self.data[at].clone())
    }

    pub fn set(&mut self, indices: &[i64], value: Value) -> Result<(), RuntimeError> {
        let at = self.offset(indices)?;
        self.data[at] = value;
        Ok(())
    }

    /// Elements in storage order, which is `For Each` order.
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.data.iter()
    }

    /// `Erase`: a fixed array keeps its shape with every element reset; a
    /// dynamic array is deallocated.
    pub fn erase(&mut self) {
        if self.fixed {
            self.data.iter_mut().for_each(|v| *v = Value::Empty);
        } else {
            self.lengths.clear();
            self.data.clear();
        }
    }
}

fn lengths_from_bounds(upper_bounds: &[i64]) -> Result<Vec<usize>, RuntimeError> {
    if upper_bounds.is_empty() || upper_bounds.len() > 60 {
        return Err(RuntimeError::subscript_out_of_range());
    }
    upper_bounds
        .iter()
        .map(|&u| {
            u.checked_add(1)
                .and_then(|len| usize::try_from(len).ok())
                .ok_or_else(RuntimeError::subscript_out_of_range)
        })
        .collect()
}

fn element_count(lengths: &[usize]) -> Result<usize, RuntimeError> {
    let total = lengths
        .iter()
        .try_fold(1usize, |acc, &len| acc.checked_mul(len))
        .ok_or_else(RuntimeError::overflow)?;
    if total > MAX_ELEMENTS {
        return Err(RuntimeError::new(FaultKind::OutOfStack));
    }
    Ok(total)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn filled(upper: i64) -> VbArray {
        let mut a = VbArray::redim(&[upper]).unwrap();
        for i in 0..=upper {
            a.set(&[i], Value::Long(i as i32 * 10)).unwrap();
        }
        a
    }

    #[test]
    fn redim_adds_one_to_bounds() {
        let a = VbArray::redim(&[4]).unwrap();
        assert_eq!(a.len(), 5);
        assert_eq!(a.ubound(1).unwrap(), 4);
        let b = VbArray::redim(&[2, 3]).unwrap();
        assert_eq!(b.dims(), &[3, 4]);
        assert_eq!(b.ubound(2).unwrap(), 3);
        assert!(b.ubound(3).is_err());
    }

    #[test]
    fn shrink_keeps_prefix() {
        let a = filled(4);
        let b = a.redim_preserve(&[2]).unwrap();
        assert_eq!(b.len(), 3);
        let kept: Vec<Value> = b.iter().cloned().collect();
        assert_eq!(kept, vec![Value::Long(0), Value::Long(10), Value::Long(20)]);
    }

    #[test]
    fn grow_pads_with_empty() {
        let a = filled(2);
        let b = a.redim_preserve(&[4]).unwrap();
        assert_eq!(b.get(&[2]).unwrap(), Value::Long(20));
        assert_eq!(b.get(&[3]).unwrap(), Value::Empty);
        assert_eq!(b.get(&[4]).unwrap(), Value::Empty);
    }

    #[test]
    fn preserve_on_last_dimension_of_matrix() {
        let mut a = VbArray::redim(&[1, 1]).unwrap();
        a.set(&[0, 0], Value::Long(1)).unwrap();
        a.set(&[1, 0], Value::Long(2)).unwrap();
        a.set(&[0, 1], Value::Long(3)).unwrap();
        a.set(&[1, 1], Value::Long(4)).unwrap();
        let b = a.redim_preserve(&[1, 2]).unwrap();
        assert_eq!(b.get(&[1, 1]).unwrap(), Value::Long(4));
        assert_eq!(b.get(&[0, 2]).unwrap(), Value::Empty);
    }

    #[test]
    fn preserve_rejects_leading_dimension_change() {
        let a = VbArray::redim(&[1, 1]).unwrap();
        let err = a.redim_preserve(&[2, 1]).unwrap_err();
        assert_eq!(err.number, 5);
        assert!(err.description.contains("dimension 1 changed from 2 to 3"));
    }

    #[test]
    fn preserve_rejects_rank_change() {
        let a = VbArray::redim(&[3]).unwrap();
        assert!(a.redim_preserve(&[3, 3]).is_err());
    }

    #[test]
    fn bounds_checks() {
        let a = VbArray::redim(&[2]).unwrap();
        assert_eq!(a.get(&[3]).unwrap_err().number, 9);
        assert_eq!(a.get(&[-1]).unwrap_err().number, 9);
        assert_eq!(a.get(&[0, 0]).unwrap_err().number, 9);
        assert_eq!(VbArray::redim(&[-1]).unwrap().len(), 0);
    }

    #[test]
    fn fixed_arrays_are_locked() {
        let mut a = VbArray::fixed(&[2]).unwrap();
        assert_eq!(a.redim_preserve(&[3]).unwrap_err().number, 10);
        a.set(&[1], Value::Long(1)).unwrap();
        a.erase();
        assert_eq!(a.len(), 3);
        assert_eq!(a.get(&[1]).unwrap(), Value::Empty);
    }
}
