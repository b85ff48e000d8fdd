use crate::common::DimSize;

const INDENT_SIZE: usize = 2;

/// Returns the factors of an integer, in ascending order.
pub fn factors(x: DimSize) -> Vec<DimSize> {
    let mut result = Vec::new();
    let mut i: DimSize = 1;
    while u64::from(i) * u64::from(i) <= u64::from(x) {
        if x % i == 0 {
            result.push(i);
            if x / i != i {
                result.push(x / i);
            }
        }
        i += 1;
    }
    result.sort_unstable();
    result
}

/// Returns the powers of two which divide `x`, in ascending order.
pub fn power_of_two_factors(x: DimSize) -> Vec<DimSize> {
    if x == 0 {
        return vec![];
    }
    (0..=x.trailing_zeros()).map(|b| 1 << b).collect()
}

/// Arithmetic mean. Returns `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub fn join_into_string(c: impl IntoIterator<Item = impl ToString>, separator: &str) -> String {
    c.into_iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

pub fn indent(depth: usize) -> String {
    " ".repeat(depth * INDENT_SIZE)
}
