//! Cross-entropy with an ignore-index.

use candle_core::{D, DType, Result, Tensor};

/// Target value excluded from the loss.
pub const IGNORE_INDEX: i64 = -1;

/// Mean cross-entropy over the targets that are not `ignore_index`.
///
/// `logits` has shape (N, vocab) and `targets` shape (N,) with any integer dtype. When every
/// target is ignored the loss is exactly zero.
///
/// # Errors
/// Returns an error on shape mismatch or if tensor operations fail.
pub fn cross_entropy(logits: &Tensor, targets: &Tensor, ignore_index: i64) -> Result<Tensor> {
    let (n, _) = logits.dims2()?;
    let targets = targets.to_dtype(DType::I64)?;
    if targets.dims1()? != n {
        return Err(candle_core::Error::Msg(format!(
            "targets hold {} entries but logits have {n} rows",
            targets.elem_count()
        )));
    }

    let keep = targets.ne(ignore_index)?;
    let safe = keep
        .where_cond(&targets, &targets.zeros_like()?)?
        .to_dtype(DType::U32)?;
    let weight = keep.to_dtype(logits.dtype())?;
    let count = weight.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Tensor::zeros((), logits.dtype(), logits.device());
    }

    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let picked = log_probs.gather(&safe.unsqueeze(1)?, 1)?.squeeze(1)?;
    let total = (picked * weight)?.sum_all()?;
    total.neg()? / f64::from(count)
}
