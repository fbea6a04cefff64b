//! Limited-memory quasi-Newton minimisation (L-BFGS) with orthant-wise
//! L1 regularisation (OWL-QN).
//!
//! The optimiser works in place on slices owned by the caller, so training
//! can keep its weight arena and lend it out for each run.

mod linesearch;

use std::fmt;

use tracing::trace;

use self::linesearch::{Line, Search};
use crate::error::{Error, Result};

pub use self::linesearch::LineSearch;

/// Why a minimisation run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Gradient norm test satisfied
    Converged,
    /// Objective improvement over `period` iterations fell below `delta`
    Stopped,
    /// The starting point already satisfied the gradient test
    AlreadyMinimized,
    /// `max_iterations` reached
    MaxIterations,
    /// The progress callback asked to stop
    Cancelled,
    /// Line search could not find a better point because of rounding errors
    RoundingError,
    MinimumStep,
    MaximumStep,
    MaxLineSearch,
    /// Interval of uncertainty became smaller than `xtol`
    WidthTooSmall,
    /// The search direction is not a descent direction
    IncreaseGradient,
    OutOfInterval,
    IncorrectTminmax,
    InvalidStep,
}

impl Status {
    /// Whether the run ended normally
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Status::Converged
                | Status::Stopped
                | Status::AlreadyMinimized
                | Status::MaxIterations
                | Status::Cancelled
        )
    }

    /// Numeric code in the liblbfgs convention: non-negative on convergence,
    /// negative otherwise
    pub fn code(self) -> i32 {
        match self {
            Status::Converged => 0,
            Status::Stopped => 1,
            Status::AlreadyMinimized => 2,
            Status::Cancelled => -1021,
            Status::RoundingError => -1001,
            Status::MinimumStep => -1000,
            Status::MaximumStep => -999,
            Status::MaxLineSearch => -998,
            Status::MaxIterations => -997,
            Status::WidthTooSmall => -996,
            Status::IncreaseGradient => -994,
            Status::OutOfInterval => -993,
            Status::IncorrectTminmax => -992,
            Status::InvalidStep => -1012,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Status::Converged => "converged",
            Status::Stopped => "stopped: objective no longer improving",
            Status::AlreadyMinimized => "initial point is already a minimizer",
            Status::MaxIterations => "reached the maximum number of iterations",
            Status::Cancelled => "cancelled",
            Status::RoundingError => "line search failed: rounding error",
            Status::MinimumStep => "line search failed: step below minimum",
            Status::MaximumStep => "line search failed: step above maximum",
            Status::MaxLineSearch => "line search failed: too many evaluations",
            Status::WidthTooSmall => "line search failed: interval too small",
            Status::IncreaseGradient => "line search failed: not a descent direction",
            Status::OutOfInterval => "line search failed: step out of interval",
            Status::IncorrectTminmax => "line search failed: inconsistent interval",
            Status::InvalidStep => "line search failed: invalid step",
        };
        f.write_str(msg)
    }
}

/// Result of [`Lbfgs::minimize`]
#[derive(Debug, Clone, Copy)]
pub struct Report {
    pub status: Status,
    /// Objective at the returned point, including the L1 term
    pub fx: f64,
    pub iterations: usize,
    pub evaluations: usize,
}

/// State handed to the progress callback after each iteration
#[derive(Debug)]
pub struct Progress<'a> {
    pub x: &'a [f64],
    pub g: &'a [f64],
    pub fx: f64,
    pub xnorm: f64,
    pub gnorm: f64,
    pub step: f64,
    pub iteration: usize,
    pub evaluations: usize,
}

/// L-BFGS parameters.
#[derive(Debug, Clone)]
pub struct LbfgsParams {
    c1: f64,
    num_memories: usize,
    max_iterations: usize,
    epsilon: f64,
    period: usize,
    delta: f64,
    linesearch: LineSearch,
    max_linesearch: usize,
    pub(crate) min_step: f64,
    pub(crate) max_step: f64,
    pub(crate) ftol: f64,
    pub(crate) wolfe: f64,
    pub(crate) gtol: f64,
    pub(crate) xtol: f64,
}

impl Default for LbfgsParams {
    fn default() -> Self {
        Self {
            c1: 0.0,
            num_memories: 100,
            max_iterations: usize::MAX,
            epsilon: 1e-5,
            period: 10,
            delta: 1e-5,
            linesearch: LineSearch::default(),
            max_linesearch: 20,
            min_step: 1e-20,
            max_step: 1e20,
            ftol: 1e-4,
            wolfe: 0.9,
            gtol: 0.9,
            xtol: 1e-16,
        }
    }
}

impl LbfgsParams {
    /// Coefficient of the L1 term; positive values switch on OWL-QN
    pub fn c1(&self) -> f64 {
        self.c1
    }

    pub fn set_c1(&mut self, c1: f64) -> Result<()> {
        if !(c1 >= 0.0) {
            return Err(Error::invalid("c1 must be non-negative"));
        }
        self.c1 = c1;
        Ok(())
    }

    pub fn num_memories(&self) -> usize {
        self.num_memories
    }

    pub fn set_num_memories(&mut self, num_memories: usize) -> Result<()> {
        if num_memories < 1 {
            return Err(Error::invalid("num_memories must be at least 1"));
        }
        self.num_memories = num_memories;
        Ok(())
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn set_max_iterations(&mut self, max_iterations: usize) -> Result<()> {
        if max_iterations < 1 {
            return Err(Error::invalid("max_iterations must be at least 1"));
        }
        self.max_iterations = max_iterations;
        Ok(())
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn set_epsilon(&mut self, epsilon: f64) -> Result<()> {
        if !(epsilon >= 0.0) {
            return Err(Error::invalid("epsilon must be non-negative"));
        }
        self.epsilon = epsilon;
        Ok(())
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Set the period for delta-based convergence test.
    ///
    /// Setting period to 0 disables the delta-based convergence test.
    pub fn set_period(&mut self, period: usize) {
        self.period = period;
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn set_delta(&mut self, delta: f64) -> Result<()> {
        if !(delta >= 0.0) {
            return Err(Error::invalid("delta must be non-negative"));
        }
        self.delta = delta;
        Ok(())
    }

    pub fn linesearch(&self) -> LineSearch {
        self.linesearch
    }

    pub fn set_linesearch(&mut self, linesearch: LineSearch) {
        self.linesearch = linesearch;
    }

    pub fn max_linesearch(&self) -> usize {
        self.max_linesearch
    }

    pub fn set_max_linesearch(&mut self, max_linesearch: usize) -> Result<()> {
        if max_linesearch == 0 {
            return Err(Error::invalid("max_linesearch must be positive"));
        }
        self.max_linesearch = max_linesearch;
        Ok(())
    }
}

/// One stored correction pair of the limited-memory Hessian approximation
struct Correction {
    s: Vec<f64>,
    y: Vec<f64>,
    ys: f64,
    alpha: f64,
}

impl Correction {
    fn new(n: usize) -> Self {
        Self {
            s: vec![0.0; n],
            y: vec![0.0; n],
            ys: 0.0,
            alpha: 0.0,
        }
    }
}

/// L-BFGS / OWL-QN minimiser
#[derive(Debug, Clone, Default)]
pub struct Lbfgs {
    params: LbfgsParams,
}

impl Lbfgs {
    pub fn new(params: LbfgsParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &LbfgsParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut LbfgsParams {
        &mut self.params
    }

    /// Minimise the objective computed by `evaluate`, starting from `x`.
    ///
    /// `evaluate(x, g)` returns `f(x)` and writes the gradient into `g`. On
    /// return `x` and `g` hold the final point and its gradient; after a line
    /// search failure they hold the last accepted iterate. `progress` is
    /// called once per iteration and stops the run by returning `true`.
    pub fn minimize<F, P>(
        &self,
        x: &mut [f64],
        g: &mut [f64],
        mut evaluate: F,
        mut progress: P,
    ) -> Result<Report>
    where
        F: FnMut(&[f64], &mut [f64]) -> Result<f64>,
        P: FnMut(&Progress<'_>) -> bool,
    {
        let n = x.len();
        if n == 0 {
            return Err(Error::invalid("nothing to optimize"));
        }
        if g.len() != n {
            return Err(Error::invalid(format!(
                "gradient has {} entries for {} variables",
                g.len(),
                n
            )));
        }
        let param = &self.params;
        let m = param.num_memories;
        let c1 = param.c1;
        let owlqn = c1 > 0.0;

        let mut xp = vec![0.0; n];
        let mut gp = vec![0.0; n];
        let mut d = vec![0.0; n];
        let mut pg = if owlqn { vec![0.0; n] } else { Vec::new() };
        let mut wp = if owlqn { vec![0.0; n] } else { Vec::new() };
        let mut history: Vec<Correction> = Vec::new();
        let mut pf = vec![0.0; param.period];

        let mut fx = evaluate(x, g)?;
        let mut evaluations = 1;
        if owlqn {
            fx += c1 * linesearch::norm1(x);
            pseudo_gradient(&mut pg, x, g, c1);
        }
        if let Some(first) = pf.first_mut() {
            *first = fx;
        }

        {
            let steepest = if owlqn { &pg[..] } else { &g[..] };
            for (di, &gi) in d.iter_mut().zip(steepest) {
                *di = -gi;
            }
            let xnorm = norm2(x).max(1.0);
            let gnorm = norm2(steepest);
            if gnorm / xnorm <= param.epsilon {
                return Ok(Report {
                    status: Status::AlreadyMinimized,
                    fx,
                    iterations: 0,
                    evaluations,
                });
            }
        }

        let mut step = 1.0 / norm2(&d);
        let mut k = 1;
        let mut end = 0;

        loop {
            xp.copy_from_slice(x);
            gp.copy_from_slice(g);
            let fxp = fx;

            let search = {
                let mut line = Line {
                    x: &mut *x,
                    f: &mut fx,
                    g: &mut *g,
                    s: &d,
                    xp: &xp,
                };
                if owlqn {
                    linesearch::owlqn_backtracking(
                        &mut line,
                        &mut step,
                        &pg,
                        &mut wp,
                        param,
                        &mut evaluate,
                    )?
                } else if param.linesearch == LineSearch::MoreThuente {
                    linesearch::more_thuente(&mut line, &mut step, param, &mut evaluate)?
                } else {
                    linesearch::backtracking(
                        &mut line,
                        &mut step,
                        param.linesearch,
                        param,
                        &mut evaluate,
                    )?
                }
            };
            match search {
                Search::Done(count) => evaluations += count,
                Search::Failed(status) => {
                    x.copy_from_slice(&xp);
                    g.copy_from_slice(&gp);
                    return Ok(Report {
                        status,
                        fx: fxp,
                        iterations: k - 1,
                        evaluations,
                    });
                }
            }
            if owlqn {
                pseudo_gradient(&mut pg, x, g, c1);
            }

            let steepest = if owlqn { &pg[..] } else { &g[..] };
            let xnorm = norm2(x);
            let gnorm = norm2(steepest);
            trace!(iteration = k, fx, xnorm, gnorm, step, "lbfgs iteration");
            let cancel = progress(&Progress {
                x,
                g: steepest,
                fx,
                xnorm,
                gnorm,
                step,
                iteration: k,
                evaluations,
            });
            let stop = |status| Report {
                status,
                fx,
                iterations: k,
                evaluations,
            };
            if cancel {
                return Ok(stop(Status::Cancelled));
            }
            if gnorm / xnorm.max(1.0) <= param.epsilon {
                return Ok(stop(Status::Converged));
            }
            if !pf.is_empty() {
                let period = pf.len();
                if period <= k {
                    let rate = (pf[k % period] - fx) / fx;
                    if rate.abs() < param.delta {
                        return Ok(stop(Status::Stopped));
                    }
                }
                pf[k % period] = fx;
            }
            if param.max_iterations <= k {
                return Ok(stop(Status::MaxIterations));
            }

            if history.len() == end {
                history.push(Correction::new(n));
            }
            let it = &mut history[end];
            for i in 0..n {
                it.s[i] = x[i] - xp[i];
                it.y[i] = g[i] - gp[i];
            }
            let ys = dot(&it.y, &it.s);
            let yy = dot(&it.y, &it.y);
            it.ys = ys;

            let bound = m.min(k);
            k += 1;
            end = (end + 1) % m;

            for (di, &gi) in d.iter_mut().zip(steepest) {
                *di = -gi;
            }
            // Two-loop recursion over the most recent `bound` corrections
            let mut j = end;
            for _ in 0..bound {
                j = (j + m - 1) % m;
                let it = &mut history[j];
                it.alpha = dot(&it.s, &d) / it.ys;
                axpy(&mut d, -it.alpha, &it.y);
            }
            scale(&mut d, ys / yy);
            for _ in 0..bound {
                let it = &history[j];
                let beta = dot(&it.y, &d) / it.ys;
                axpy(&mut d, it.alpha - beta, &it.s);
                j = (j + 1) % m;
            }

            if owlqn {
                for (di, &pgi) in d.iter_mut().zip(&pg) {
                    if *di * pgi >= 0.0 {
                        *di = 0.0;
                    }
                }
            }
            step = 1.0;
        }
    }
}

/// Pseudo-gradient of `f(x) + c1 * |x|_1`
fn pseudo_gradient(pg: &mut [f64], x: &[f64], g: &[f64], c1: f64) {
    for ((p, &xi), &gi) in pg.iter_mut().zip(x).zip(g) {
        *p = if xi < 0.0 {
            gi - c1
        } else if xi > 0.0 {
            gi + c1
        } else if gi < -c1 {
            gi + c1
        } else if gi > c1 {
            gi - c1
        } else {
            0.0
        };
    }
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm2(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

fn axpy(y: &mut [f64], a: f64, x: &[f64]) {
    for (yi, &xi) in y.iter_mut().zip(x) {
        *yi += a * xi;
    }
}

fn scale(y: &mut [f64], a: f64) {
    for yi in y.iter_mut() {
        *yi *= a;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadratic(x: &[f64], g: &mut [f64]) -> Result<f64> {
        let mut fx = 0.0;
        for (i, (&xi, gi)) in x.iter().zip(g.iter_mut()).enumerate() {
            let c = i as f64 + 1.0;
            fx += c * (xi - c) * (xi - c);
            *gi = 2.0 * c * (xi - c);
        }
        Ok(fx)
    }

    fn rosenbrock(x: &[f64], g: &mut [f64]) -> Result<f64> {
        let mut fx = 0.0;
        g.iter_mut().for_each(|v| *v = 0.0);
        for i in (0..x.len()).step_by(2) {
            let t1 = 1.0 - x[i];
            let t2 = 10.0 * (x[i + 1] - x[i] * x[i]);
            g[i + 1] = 20.0 * t2;
            g[i] = -2.0 * (x[i] * g[i + 1] + t1);
            fx += t1 * t1 + t2 * t2;
        }
        Ok(fx)
    }

    #[test]
    fn test_minimize_quadratic_with_each_line_search() {
        for kind in [
            LineSearch::MoreThuente,
            LineSearch::BacktrackingArmijo,
            LineSearch::BacktrackingWolfe,
            LineSearch::BacktrackingStrongWolfe,
        ] {
            let mut params = LbfgsParams::default();
            params.set_linesearch(kind);
            params.set_epsilon(1e-6).unwrap();
            params.set_period(0);
            let lbfgs = Lbfgs::new(params);
            let mut x = vec![0.0; 5];
            let mut g = vec![0.0; 5];
            let report = lbfgs
                .minimize(&mut x, &mut g, quadratic, |_| false)
                .unwrap();
            assert!(report.status.is_success(), "{:?}: {}", kind, report.status);
            for (i, xi) in x.iter().enumerate() {
                assert!((xi - (i as f64 + 1.0)).abs() < 1e-3, "{:?}: {:?}", kind, x);
            }
        }
    }

    #[test]
    fn test_minimize_rosenbrock() {
        let mut params = LbfgsParams::default();
        params.set_num_memories(6).unwrap();
        params.set_period(0);
        let lbfgs = Lbfgs::new(params);
        let mut x: Vec<f64> = (0..10).map(|i| if i % 2 == 0 { -1.2 } else { 1.0 }).collect();
        let mut g = vec![0.0; 10];
        let report = lbfgs
            .minimize(&mut x, &mut g, rosenbrock, |_| false)
            .unwrap();
        assert_eq!(report.status, Status::Converged);
        assert!(report.fx < 1e-6);
        for xi in &x {
            assert!((xi - 1.0).abs() < 1e-2);
        }
    }

    #[test]
    fn test_owlqn_produces_exact_zeros() {
        // f(x) = sum (x_i - a_i)^2 + |x|_1 has minimiser
        // sign(a) * max(|a| - 0.5, 0)
        let a = [0.2, -3.0, 1.0, -0.4];
        let mut params = LbfgsParams::default();
        params.set_c1(1.0).unwrap();
        params.set_epsilon(1e-6).unwrap();
        params.set_period(0);
        let lbfgs = Lbfgs::new(params);
        let mut x = vec![0.0; 4];
        let mut g = vec![0.0; 4];
        let report = lbfgs
            .minimize(
                &mut x,
                &mut g,
                |x, g| {
                    let mut fx = 0.0;
                    for i in 0..x.len() {
                        fx += (x[i] - a[i]) * (x[i] - a[i]);
                        g[i] = 2.0 * (x[i] - a[i]);
                    }
                    Ok(fx)
                },
                |_| false,
            )
            .unwrap();
        assert!(report.status.is_success(), "{}", report.status);
        assert_eq!(x[0], 0.0);
        assert_eq!(x[3], 0.0);
        assert!((x[1] + 2.5).abs() < 1e-4);
        assert!((x[2] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_max_iterations_and_cancel() {
        let mut params = LbfgsParams::default();
        params.set_max_iterations(2).unwrap();
        params.set_period(0);
        let lbfgs = Lbfgs::new(params);
        let mut x = vec![-1.2, 1.0];
        let mut g = vec![0.0; 2];
        let report = lbfgs
            .minimize(&mut x, &mut g, rosenbrock, |_| false)
            .unwrap();
        assert_eq!(report.status, Status::MaxIterations);
        assert_eq!(report.iterations, 2);

        let lbfgs = Lbfgs::default();
        let mut x = vec![-1.2, 1.0];
        let report = lbfgs
            .minimize(&mut x, &mut g, rosenbrock, |p| p.iteration >= 1)
            .unwrap();
        assert_eq!(report.status, Status::Cancelled);
        assert_eq!(report.iterations, 1);
    }

    #[test]
    fn test_already_minimized() {
        let lbfgs = Lbfgs::default();
        let mut x = vec![1.0, 2.0];
        let mut g = vec![0.0; 2];
        let report = lbfgs
            .minimize(&mut x, &mut g, quadratic, |_| false)
            .unwrap();
        assert_eq!(report.status, Status::AlreadyMinimized);
        assert_eq!(report.evaluations, 1);
    }

    #[test]
    fn test_evaluation_error_propagates() {
        let lbfgs = Lbfgs::default();
        let mut x = vec![0.0];
        let mut g = vec![0.0];
        let err = lbfgs
            .minimize(
                &mut x,
                &mut g,
                |_, _| Err(Error::invalid("boom")),
                |_| false,
            )
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_param_validation() {
        let mut params = LbfgsParams::default();
        assert!(params.set_c1(-1.0).is_err());
        assert!(params.set_num_memories(0).is_err());
        assert!(params.set_max_iterations(0).is_err());
        assert!(params.set_epsilon(-1.0).is_err());
        assert!(params.set_delta(f64::NAN).is_err());
        assert!(params.set_max_linesearch(0).is_err());
        assert_eq!(params.num_memories(), 100);
        assert!(!Status::MaxLineSearch.is_success());
        assert!(Status::MaxLineSearch.code() < 0);
    }
}
