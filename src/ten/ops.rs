use crate::ten::{Error, ErrorKind, Shape};
use ndarray::{Array, ArrayBase, ArrayViewD, Axis, Data, Dimension, Zip};

/// Elementwise `(x - mean) / std` with scalar statistics.
///
/// `std == 0` is not guarded against and produces infinities / NaNs.
pub fn normalize<S, D>(x: &ArrayBase<S, D>, mean: f32, std: f32) -> Array<f32, D>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    x.mapv(|v| (v - mean) / std)
}

/// Same as [`normalize`], with per-element statistics broadcast to the shape of `x`.
pub fn normalize_with<S, D, SM, DM, SS, DS>(
    x: &ArrayBase<S, D>,
    mean: &ArrayBase<SM, DM>,
    std: &ArrayBase<SS, DS>,
) -> Result<Array<f32, D>, Error>
where
    S: Data<Elem = f32>,
    D: Dimension,
    SM: Data<Elem = f32>,
    DM: Dimension,
    SS: Data<Elem = f32>,
    DS: Dimension,
{
    let dim = x.raw_dim();
    let mean = mean
        .broadcast(dim.clone())
        .ok_or_else(|| ErrorKind::wrong_shape(x.shape(), mean.shape()))?;
    let std = std
        .broadcast(dim)
        .ok_or_else(|| ErrorKind::wrong_shape(x.shape(), std.shape()))?;

    let mut out = x.to_owned();
    Zip::from(&mut out)
        .and(&mean)
        .and(&std)
        .for_each(|o, &m, &s| *o = (*o - m) / s);
    Ok(out)
}

/// Removes `axis` if it has length 1. Negative axes count from the end.
/// Any other axis, or one out of range, leaves the view untouched.
pub fn squeeze<S, D>(x: &ArrayBase<S, D>, axis: isize) -> ArrayViewD<'_, S::Elem>
where
    S: Data,
    D: Dimension,
{
    let view = x.view().into_dyn();
    let shape = Shape::from(x.shape());
    match shape.wrap(axis) {
        Some(p) if shape.dims()[p] == 1 => view.index_axis_move(Axis(p), 0),
        _ => view,
    }
}

/// Mean squared error between a prediction and its target.
///
/// A trailing axis of length 1 on `output` is dropped first when `output`
/// has more axes than `targ`, so `[n, 1]` predictions line up with `[n]`
/// labels. The remaining shapes must match exactly.
pub fn mse<SO, DO, ST, DT>(output: &ArrayBase<SO, DO>, targ: &ArrayBase<ST, DT>) -> Result<f32, Error>
where
    SO: Data<Elem = f32>,
    DO: Dimension,
    ST: Data<Elem = f32>,
    DT: Dimension,
{
    let output = if output.ndim() > targ.ndim() {
        squeeze(output, -1)
    } else {
        output.view().into_dyn()
    };
    let targ = targ.view().into_dyn();

    if output.shape() != targ.shape() {
        return Err(ErrorKind::wrong_shape(targ.shape(), output.shape()));
    }
    if output.is_empty() {
        return Err(Box::new(ErrorKind::Empty));
    }

    let sum = Zip::from(&output).and(&targ).fold(0.0f64, |acc, &o, &t| {
        let d = f64::from(o - t);
        acc + d * d
    });
    Ok((sum / output.len() as f64) as f32)
}

/// Mean and unbiased (n - 1) standard deviation over all elements.
pub fn stats<S, D>(x: &ArrayBase<S, D>) -> Result<(f32, f32), Error>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let mean = x.mean().ok_or_else(|| Box::new(ErrorKind::Empty))?;
    Ok((mean, x.std(1.0)))
}
