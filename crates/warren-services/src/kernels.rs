//! Built-in compute kernels.
//!
//! | job                    | input                        | output          |
//! |------------------------|------------------------------|-----------------|
//! | `simpleMath`           | `{"a": i64, "b": i64}`       | `{"result": a+b}` |
//! | `determinant`          | `[[[i64]]]` (list of square) | `[i64]`         |
//! | `matrixMultiplication` | `[A, B]`                     | `A·B`           |
//!
//! The matrix kernels split their work across at most `cores` threads.

use serde::Deserialize;
use serde_json::json;

use crate::handler::{HandlerTable, JobError};

pub const SIMPLE_MATH: &str = "simpleMath";
pub const DETERMINANT: &str = "determinant";
pub const MATRIX_MULTIPLICATION: &str = "matrixMultiplication";

type Matrix = Vec<Vec<i64>>;

/// Table with every built-in kernel registered.
pub fn builtin_handlers() -> HandlerTable {
    let mut table = HandlerTable::new();
    table
        .register(SIMPLE_MATH, simple_math)
        .register(DETERMINANT, determinant)
        .register(MATRIX_MULTIPLICATION, matrix_multiplication);
    table
}

#[derive(Deserialize)]
struct SimpleMathInput {
    a: i64,
    b: i64,
}

pub fn simple_math(input: &str, _cores: u32) -> Result<String, JobError> {
    let SimpleMathInput { a, b } = serde_json::from_str(input)?;
    let sum = a
        .checked_add(b)
        .ok_or_else(|| JobError::Compute("integer overflow".into()))?;
    Ok(json!({ "result": sum }).to_string())
}

pub fn determinant(input: &str, cores: u32) -> Result<String, JobError> {
    let matrices: Vec<Matrix> = serde_json::from_str(input)?;
    for (i, m) in matrices.iter().enumerate() {
        if m.iter().any(|row| row.len() != m.len()) {
            return Err(JobError::InvalidInput(format!("matrix {i} is not square")));
        }
    }
    let results = parallel_map(&matrices, cores, det)?;
    Ok(serde_json::to_string(&results)?)
}

pub fn matrix_multiplication(input: &str, cores: u32) -> Result<String, JobError> {
    let matrices: Vec<Matrix> = serde_json::from_str(input)?;
    let [a, b] = <[Matrix; 2]>::try_from(matrices)
        .map_err(|m| JobError::InvalidInput(format!("expected 2 matrices, got {}", m.len())))?;

    let cols_a = a.first().map_or(0, Vec::len);
    if a.iter().any(|row| row.len() != cols_a) || b.len() != cols_a {
        return Err(JobError::InvalidInput("matrix dimensions do not match".into()));
    }
    let cols_b = b.first().map_or(0, Vec::len);
    if b.iter().any(|row| row.len() != cols_b) {
        return Err(JobError::InvalidInput("matrix dimensions do not match".into()));
    }

    let product = parallel_map(&a, cores, |row| {
        (0..cols_b)
            .map(|col| {
                row.iter()
                    .zip(&b)
                    .try_fold(0i64, |acc, (x, b_row)| {
                        x.checked_mul(b_row[col]).and_then(|p| acc.checked_add(p))
                    })
                    .ok_or_else(|| JobError::Compute("integer overflow".into()))
            })
            .collect::<Result<Vec<i64>, JobError>>()
    })?;
    Ok(serde_json::to_string(&product)?)
}

/// Exact integer determinant (Bareiss elimination).
fn det(m: &Matrix) -> Result<i64, JobError> {
    let n = m.len();
    if n == 0 {
        return Ok(1);
    }
    let mut a: Vec<Vec<i128>> = m
        .iter()
        .map(|row| row.iter().map(|&x| x as i128).collect())
        .collect();
    let mut sign = 1i128;
    let mut prev = 1i128;

    for k in 0..n - 1 {
        if a[k][k] == 0 {
            match (k + 1..n).find(|&r| a[r][k] != 0) {
                Some(r) => {
                    a.swap(k, r);
                    sign = -sign;
                }
                None => return Ok(0),
            }
        }
        for i in k + 1..n {
            for j in k + 1..n {
                let num = a[i][j]
                    .checked_mul(a[k][k])
                    .zip(a[i][k].checked_mul(a[k][j]))
                    .and_then(|(x, y)| x.checked_sub(y))
                    .ok_or_else(|| JobError::Compute("determinant overflow".into()))?;
                a[i][j] = num / prev;
            }
        }
        prev = a[k][k];
    }

    i64::try_from(sign * a[n - 1][n - 1])
        .map_err(|_| JobError::Compute("determinant overflow".into()))
}

/// Apply `f` to every item using up to `cores` scoped threads, keeping order.
fn parallel_map<T, R, F>(items: &[T], cores: u32, f: F) -> Result<Vec<R>, JobError>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Result<R, JobError> + Sync,
{
    let threads = (cores.max(1) as usize).min(items.len().max(1));
    if threads == 1 {
        return items.iter().map(&f).collect();
    }
    let chunk = items.len().div_ceil(threads);
    std::thread::scope(|scope| {
        let handles: Vec<_> = items
            .chunks(chunk)
            .map(|part| scope.spawn(|| part.iter().map(&f).collect::<Result<Vec<R>, JobError>>()))
            .collect();
        let mut out = Vec::with_capacity(items.len());
        for handle in handles {
            let part = handle
                .join()
                .map_err(|_| JobError::Compute("kernel thread panicked".into()))??;
            out.extend(part);
        }
        Ok(out)
    })
}
