//! Computation definitions for the operators the tuner knows how to template.
//!
//! Each definition takes its integer arguments as a slice and returns the
//! output ops along with every buffer, inputs first and output last.

use crate::common::DimSize;
use crate::tensor::{ComputeOp, DefinitionError, Tensor};

pub type Definition = (Vec<ComputeOp>, Vec<Tensor>);

pub const BATCH_MATMUL_ARGS: usize = 4;
pub const CONV2D_ARGS: usize = 13;

/// Batched matrix multiplication `C[b, y, x] = Σ_k A[b, y, k] * B[b, k, x]`.
///
/// Arguments: `batch, n, l, m` where `A` is `batch×n×l` and `B` is `batch×l×m`.
pub fn batch_matmul(args: &[i64]) -> Result<Definition, DefinitionError> {
    expect_arity(args, BATCH_MATMUL_ARGS)?;
    let batch = positive("batch", args[0])?;
    let n = positive("n", args[1])?;
    let l = positive("l", args[2])?;
    let m = positive("m", args[3])?;

    let a = Tensor::placeholder("A", &[batch, n, l])?;
    let b = Tensor::placeholder("B", &[batch, l, m])?;
    let c = ComputeOp::compute("C", &[batch, n, m], &["b", "y", "x"], &[("k", l)], |s, r| {
        let (bi, y, x, k) = (&s[0], &s[1], &s[2], &r[0]);
        a.at([bi.clone(), y.clone(), k.clone()]) * b.at([bi.clone(), k.clone(), x.clone()])
    })?;
    let out = c.output.clone();
    Ok((vec![c], vec![a, b, out]))
}

/// NCHW 2-D convolution with zero padding.
///
/// Arguments: `batch, in_channels, height, width, out_channels, kernel_h,
/// kernel_w, pad_h, pad_w, stride_h, stride_w, dilation_h, dilation_w`.
pub fn conv2d(args: &[i64]) -> Result<Definition, DefinitionError> {
    expect_arity(args, CONV2D_ARGS)?;
    let batch = positive("batch", args[0])?;
    let in_channels = positive("in_channels", args[1])?;
    let height = positive("height", args[2])?;
    let width = positive("width", args[3])?;
    let out_channels = positive("out_channels", args[4])?;
    let kernel_h = positive("kernel_h", args[5])?;
    let kernel_w = positive("kernel_w", args[6])?;
    let pad_h = non_negative("pad_h", args[7])?;
    let pad_w = non_negative("pad_w", args[8])?;
    let stride_h = positive("stride_h", args[9])?;
    let stride_w = positive("stride_w", args[10])?;
    let dilation_h = positive("dilation_h", args[11])?;
    let dilation_w = positive("dilation_w", args[12])?;

    let out_h = conv_out_size(height, kernel_h, pad_h, stride_h, dilation_h)
        .ok_or(DefinitionError::InvalidArgument {
            name: "kernel_h",
            value: args[5],
        })?;
    let out_w = conv_out_size(width, kernel_w, pad_w, stride_w, dilation_w)
        .ok_or(DefinitionError::InvalidArgument {
            name: "kernel_w",
            value: args[6],
        })?;

    let data = Tensor::placeholder("data", &[batch, in_channels, height, width])?;
    let kernel = Tensor::placeholder("kernel", &[out_channels, in_channels, kernel_h, kernel_w])?;
    let out = ComputeOp::compute(
        "conv",
        &[batch, out_channels, out_h, out_w],
        &["n", "f", "y", "x"],
        &[("rc", in_channels), ("ry", kernel_h), ("rx", kernel_w)],
        |s, r| {
            let (n, f, y, x) = (&s[0], &s[1], &s[2], &s[3]);
            let (rc, ry, rx) = (&r[0], &r[1], &r[2]);
            let in_y = y.clone() * i64::from(stride_h) + ry.clone() * i64::from(dilation_h)
                - i64::from(pad_h);
            let in_x = x.clone() * i64::from(stride_w) + rx.clone() * i64::from(dilation_w)
                - i64::from(pad_w);
            data.at([n.clone(), rc.clone(), in_y, in_x])
                * kernel.at([f.clone(), rc.clone(), ry.clone(), rx.clone()])
        },
    )?;
    let out_tensor = out.output.clone();
    Ok((vec![out], vec![data, kernel, out_tensor]))
}

fn conv_out_size(
    size: DimSize,
    kernel: DimSize,
    pad: DimSize,
    stride: DimSize,
    dilation: DimSize,
) -> Option<DimSize> {
    let padded = u64::from(size) + 2 * u64::from(pad);
    let dilated = (u64::from(kernel) - 1) * u64::from(dilation) + 1;
    if dilated > padded {
        return None;
    }
    DimSize::try_from((padded - dilated) / u64::from(stride) + 1).ok()
}

fn expect_arity(args: &[i64], expected: usize) -> Result<(), DefinitionError> {
    if args.len() != expected {
        return Err(DefinitionError::ArgumentCount {
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn positive(name: &'static str, value: i64) -> Result<DimSize, DefinitionError> {
    match DimSize::try_from(value) {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(DefinitionError::InvalidArgument { name, value }),
    }
}

fn non_negative(name: &'static str, value: i64) -> Result<DimSize, DefinitionError> {
    DimSize::try_from(value).map_err(|_| DefinitionError::InvalidArgument { name, value })
}
