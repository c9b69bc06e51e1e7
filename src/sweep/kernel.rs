use thiserror::Error;

use crate::sweep::model::Task;

/// Errors raised by a kernel for a single task
#[derive(Debug, Clone, Error, PartialEq)]
pub enum KernelError {
    #[error("invalid task parameters: {0}")]
    InvalidParameters(String),

    #[error("computation produced a non-finite value")]
    NonFinite,

    #[error("{0}")]
    Failed(String),
}

/// The pure per-task computation run by each worker.
///
/// Implementations must be deterministic: a task may be recomputed after a
/// worker crash and the result is written again at the same coordinate.
pub trait TaskKernel: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn compute(&self, task: &Task) -> Result<f64, KernelError>;
}

/// Score above which a point counts as inside the Mandelbrot set
pub const STABILITY_CUTOFF: f64 = 10.0;

/// Stability score of the quadratic map `z -> z^2 + c` started at zero.
///
/// The score is the percentage of `max_iterations` survived before `|z|`
/// exceeds `threshold` (or stops being finite); a point that never escapes
/// scores 100.
#[derive(Debug, Default, Clone, Copy)]
pub struct MandelbrotKernel;

impl MandelbrotKernel {
    pub fn is_in_set(score: f64) -> bool {
        score > STABILITY_CUTOFF
    }
}

impl TaskKernel for MandelbrotKernel {
    fn name(&self) -> &str {
        "mandelbrot"
    }

    fn compute(&self, task: &Task) -> Result<f64, KernelError> {
        let params = task.parameters;
        if params.max_iterations == 0 {
            return Err(KernelError::InvalidParameters(
                "max_iterations must be greater than 0".to_string(),
            ));
        }
        if !(params.threshold > 0.0) {
            return Err(KernelError::InvalidParameters(format!(
                "threshold must be greater than 0, got {}",
                params.threshold
            )));
        }

        let (c_re, c_im) = (task.value.re, task.value.im);
        if !(c_re.is_finite() && c_im.is_finite()) {
            return Err(KernelError::NonFinite);
        }

        let (mut z_re, mut z_im) = (0.0_f64, 0.0_f64);
        for t in 0..params.max_iterations {
            let next_re = z_re * z_re - z_im * z_im + c_re;
            let next_im = 2.0 * z_re * z_im + c_im;
            z_re = next_re;
            z_im = next_im;

            let modulus = z_re.hypot(z_im);
            if modulus > params.threshold || !modulus.is_finite() {
                return Ok(100.0 * f64::from(t + 1) / f64::from(params.max_iterations));
            }
        }
        Ok(100.0)
    }
}
