use std::str::FromStr;

use super::{dot, LbfgsParams, Status};
use crate::error::{Error, Result};

/// Line search algorithm for L-BFGS optimization.
///
/// OWL-QN always uses its own projected backtracking search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineSearch {
    /// More-Thuente line search
    #[default]
    MoreThuente,
    /// Backtracking with Armijo condition
    BacktrackingArmijo,
    /// Backtracking with Wolfe condition
    BacktrackingWolfe,
    /// Backtracking with strong Wolfe condition
    BacktrackingStrongWolfe,
}

impl LineSearch {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MoreThuente => "MoreThuente",
            Self::BacktrackingArmijo => "BacktrackingArmijo",
            Self::BacktrackingWolfe => "BacktrackingWolfe",
            Self::BacktrackingStrongWolfe => "BacktrackingStrongWolfe",
        }
    }
}

impl FromStr for LineSearch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MoreThuente" => Ok(Self::MoreThuente),
            "BacktrackingArmijo" => Ok(Self::BacktrackingArmijo),
            "Backtracking" | "BacktrackingWolfe" => Ok(Self::BacktrackingWolfe),
            "BacktrackingStrongWolfe" => Ok(Self::BacktrackingStrongWolfe),
            _ => Err(Error::invalid(format!("unknown line search '{}'", s))),
        }
    }
}

/// Outcome of one line search
pub(super) enum Search {
    /// Accepted step after this many evaluations
    Done(usize),
    Failed(Status),
}

/// Shared state of a line search: the current point is written into `x`
/// and `g`, starting from `xp` along direction `s`.
pub(super) struct Line<'a> {
    pub x: &'a mut [f64],
    pub f: &'a mut f64,
    pub g: &'a mut [f64],
    pub s: &'a [f64],
    pub xp: &'a [f64],
}

impl Line<'_> {
    fn step_to(&mut self, stp: f64) {
        for ((x, &xp), &s) in self.x.iter_mut().zip(self.xp).zip(self.s) {
            *x = xp + stp * s;
        }
    }
}

pub(super) fn backtracking<F>(
    line: &mut Line<'_>,
    stp: &mut f64,
    kind: LineSearch,
    param: &LbfgsParams,
    evaluate: &mut F,
) -> Result<Search>
where
    F: FnMut(&[f64], &mut [f64]) -> Result<f64>,
{
    const DEC: f64 = 0.5;
    const INC: f64 = 2.1;

    if *stp <= 0.0 {
        return Ok(Search::Failed(Status::InvalidStep));
    }
    let dginit = dot(line.g, line.s);
    if dginit > 0.0 {
        return Ok(Search::Failed(Status::IncreaseGradient));
    }
    let finit = *line.f;
    let dgtest = param.ftol * dginit;
    let mut count = 0;

    loop {
        line.step_to(*stp);
        *line.f = evaluate(line.x, line.g)?;
        count += 1;

        let width = if *line.f > finit + *stp * dgtest {
            DEC
        } else {
            if kind == LineSearch::BacktrackingArmijo {
                return Ok(Search::Done(count));
            }
            let dg = dot(line.g, line.s);
            if dg < param.wolfe * dginit {
                INC
            } else if kind == LineSearch::BacktrackingWolfe {
                return Ok(Search::Done(count));
            } else if dg > -param.wolfe * dginit {
                DEC
            } else {
                return Ok(Search::Done(count));
            }
        };

        if *stp < param.min_step {
            return Ok(Search::Failed(Status::MinimumStep));
        }
        if *stp > param.max_step {
            return Ok(Search::Failed(Status::MaximumStep));
        }
        if param.max_linesearch <= count {
            return Ok(Search::Failed(Status::MaxLineSearch));
        }
        *stp *= width;
    }
}

/// Projected backtracking search of OWL-QN.
///
/// `pg` is the pseudo-gradient at `xp`; `wp` receives the orthant signs.
/// The objective written to `line.f` includes the `c1 * |x|_1` term.
pub(super) fn owlqn_backtracking<F>(
    line: &mut Line<'_>,
    stp: &mut f64,
    pg: &[f64],
    wp: &mut [f64],
    param: &LbfgsParams,
    evaluate: &mut F,
) -> Result<Search>
where
    F: FnMut(&[f64], &mut [f64]) -> Result<f64>,
{
    if *stp <= 0.0 {
        return Ok(Search::Failed(Status::InvalidStep));
    }
    for ((w, &xp), &g) in wp.iter_mut().zip(line.xp).zip(pg) {
        *w = if xp == 0.0 { -g } else { xp };
    }
    let finit = *line.f;
    let mut count = 0;

    loop {
        line.step_to(*stp);
        for (x, &w) in line.x.iter_mut().zip(wp.iter()) {
            if *x * w <= 0.0 {
                *x = 0.0;
            }
        }
        *line.f = evaluate(line.x, line.g)? + param.c1 * norm1(line.x);
        count += 1;

        let dgtest: f64 = line
            .x
            .iter()
            .zip(line.xp)
            .zip(pg)
            .map(|((&x, &xp), &g)| (x - xp) * g)
            .sum();
        if *line.f <= finit + param.ftol * dgtest {
            return Ok(Search::Done(count));
        }

        if *stp < param.min_step {
            return Ok(Search::Failed(Status::MinimumStep));
        }
        if *stp > param.max_step {
            return Ok(Search::Failed(Status::MaximumStep));
        }
        if param.max_linesearch <= count {
            return Ok(Search::Failed(Status::MaxLineSearch));
        }
        *stp *= 0.5;
    }
}

pub(super) fn norm1(x: &[f64]) -> f64 {
    x.iter().map(|v| v.abs()).sum()
}

/// End point of the interval of uncertainty, with its value and derivative
#[derive(Debug, Clone, Copy)]
struct Bound {
    t: f64,
    f: f64,
    d: f64,
}

pub(super) fn more_thuente<F>(
    line: &mut Line<'_>,
    stp: &mut f64,
    param: &LbfgsParams,
    evaluate: &mut F,
) -> Result<Search>
where
    F: FnMut(&[f64], &mut [f64]) -> Result<f64>,
{
    if *stp <= 0.0 {
        return Ok(Search::Failed(Status::InvalidStep));
    }
    let dginit = dot(line.g, line.s);
    if dginit > 0.0 {
        return Ok(Search::Failed(Status::IncreaseGradient));
    }

    let mut brackt = false;
    let mut stage1 = true;
    let mut uinfo: Option<Status> = None;
    let finit = *line.f;
    let dgtest = param.ftol * dginit;
    let mut width = param.max_step - param.min_step;
    let mut prev_width = 2.0 * width;

    let mut bx = Bound {
        t: 0.0,
        f: finit,
        d: dginit,
    };
    let mut by = bx;
    let mut count = 0;

    loop {
        let (stmin, stmax) = if brackt {
            (bx.t.min(by.t), bx.t.max(by.t))
        } else {
            (bx.t, *stp + 4.0 * (*stp - bx.t))
        };

        *stp = stp.clamp(param.min_step, param.max_step);

        // Fall back to the best point so far when nothing better can be found
        if brackt
            && ((*stp <= stmin || stmax <= *stp)
                || param.max_linesearch <= count + 1
                || uinfo.is_some()
                || stmax - stmin <= param.xtol * stmax)
        {
            *stp = bx.t;
        }

        line.step_to(*stp);
        *line.f = evaluate(line.x, line.g)?;
        let f = *line.f;
        let dg = dot(line.g, line.s);
        let ftest1 = finit + *stp * dgtest;
        count += 1;

        if brackt && ((*stp <= stmin || stmax <= *stp) || uinfo.is_some()) {
            return Ok(Search::Failed(Status::RoundingError));
        }
        if *stp == param.max_step && f <= ftest1 && dg <= dgtest {
            return Ok(Search::Failed(Status::MaximumStep));
        }
        if *stp == param.min_step && (ftest1 < f || dgtest <= dg) {
            return Ok(Search::Failed(Status::MinimumStep));
        }
        if brackt && stmax - stmin <= param.xtol * stmax {
            return Ok(Search::Failed(Status::WidthTooSmall));
        }
        if param.max_linesearch <= count {
            return Ok(Search::Failed(Status::MaxLineSearch));
        }
        if f <= ftest1 && dg.abs() <= param.gtol * -dginit {
            return Ok(Search::Done(count));
        }

        if stage1 && f <= ftest1 && param.ftol.min(param.gtol) * dginit <= dg {
            stage1 = false;
        }

        let trial = Bound { t: *stp, f, d: dg };
        if stage1 && ftest1 < f && f <= bx.f {
            // Modified function psi(t) = f(t) - f(0) - ftol * t * f'(0)
            let modify = |b: Bound| Bound {
                t: b.t,
                f: b.f - b.t * dgtest,
                d: b.d - dgtest,
            };
            let restore = |b: Bound| Bound {
                t: b.t,
                f: b.f + b.t * dgtest,
                d: b.d + dgtest,
            };
            let mut mx = modify(bx);
            let mut my = modify(by);
            uinfo = update_trial_interval(
                &mut mx,
                &mut my,
                stp,
                modify(trial),
                stmin,
                stmax,
                &mut brackt,
            );
            bx = restore(mx);
            by = restore(my);
        } else {
            uinfo =
                update_trial_interval(&mut bx, &mut by, stp, trial, stmin, stmax, &mut brackt);
        }

        if brackt {
            if 0.66 * prev_width <= (by.t - bx.t).abs() {
                *stp = bx.t + 0.5 * (by.t - bx.t);
            }
            prev_width = width;
            width = (by.t - bx.t).abs();
        }
    }
}

/// Minimiser of the cubic interpolating `(u, fu, du)` and `(v, fv, dv)`
fn cubic_minimizer(u: f64, fu: f64, du: f64, v: f64, fv: f64, dv: f64) -> f64 {
    let d = v - u;
    let theta = (fu - fv) * 3.0 / d + du + dv;
    let s = theta.abs().max(du.abs()).max(dv.abs());
    let a = theta / s;
    let mut gamma = s * (a * a - (du / s) * (dv / s)).sqrt();
    if v < u {
        gamma = -gamma;
    }
    let p = gamma - du + theta;
    let q = gamma - du + gamma + dv;
    u + p / q * d
}

/// Like [`cubic_minimizer`] but safeguarded to `[tmin, tmax]` when the cubic
/// has no minimiser in the direction of the step
#[allow(clippy::too_many_arguments)]
fn cubic_minimizer2(
    u: f64,
    fu: f64,
    du: f64,
    v: f64,
    fv: f64,
    dv: f64,
    tmin: f64,
    tmax: f64,
) -> f64 {
    let d = v - u;
    let theta = (fu - fv) * 3.0 / d + du + dv;
    let s = theta.abs().max(du.abs()).max(dv.abs());
    let a = theta / s;
    let mut gamma = s * (a * a - (du / s) * (dv / s)).max(0.0).sqrt();
    if u < v {
        gamma = -gamma;
    }
    let p = gamma - dv + theta;
    let q = gamma - dv + gamma + du;
    let r = p / q;
    if r < 0.0 && gamma != 0.0 {
        v - r * d
    } else if a < 0.0 {
        tmax
    } else {
        tmin
    }
}

/// Minimiser of the quadratic through `(u, fu, du)` and `(v, fv)`
fn quad_minimizer(u: f64, fu: f64, du: f64, v: f64, fv: f64) -> f64 {
    let a = v - u;
    u + du / ((fu - fv) / a + du) / 2.0 * a
}

/// Minimiser of the quadratic with derivatives `du` at `u` and `dv` at `v`
fn quad_minimizer2(u: f64, du: f64, v: f64, dv: f64) -> f64 {
    let a = u - v;
    v + dv / (dv - du) * a
}

/// Update the interval of uncertainty `[x, y]` with the trial point `t` and
/// compute the next trial step.
fn update_trial_interval(
    x: &mut Bound,
    y: &mut Bound,
    t: &mut f64,
    trial: Bound,
    tmin: f64,
    tmax: f64,
    brackt: &mut bool,
) -> Option<Status> {
    let (ft, dt) = (trial.f, trial.d);
    let dsign = dt * (x.d / x.d.abs()) < 0.0;

    if *brackt {
        if *t <= x.t.min(y.t) || x.t.max(y.t) <= *t {
            return Some(Status::OutOfInterval);
        }
        if 0.0 <= x.d * (*t - x.t) {
            return Some(Status::IncreaseGradient);
        }
        if tmax < tmin {
            return Some(Status::IncorrectTminmax);
        }
    }

    let bound;
    let mut newt;
    if x.f < ft {
        // Higher function value: the minimum is bracketed
        *brackt = true;
        bound = true;
        let mc = cubic_minimizer(x.t, x.f, x.d, *t, ft, dt);
        let mq = quad_minimizer(x.t, x.f, x.d, *t, ft);
        newt = if (mc - x.t).abs() < (mq - x.t).abs() {
            mc
        } else {
            mc + 0.5 * (mq - mc)
        };
    } else if dsign {
        // Derivatives of opposite sign: the minimum is bracketed
        *brackt = true;
        bound = false;
        let mc = cubic_minimizer(x.t, x.f, x.d, *t, ft, dt);
        let mq = quad_minimizer2(x.t, x.d, *t, dt);
        newt = if (mc - *t).abs() > (mq - *t).abs() {
            mc
        } else {
            mq
        };
    } else if dt.abs() < x.d.abs() {
        // Same sign, decreasing magnitude
        bound = true;
        let mc = cubic_minimizer2(x.t, x.f, x.d, *t, ft, dt, tmin, tmax);
        let mq = quad_minimizer2(x.t, x.d, *t, dt);
        newt = if *brackt {
            if (*t - mc).abs() < (*t - mq).abs() {
                mc
            } else {
                mq
            }
        } else if (*t - mc).abs() > (*t - mq).abs() {
            mc
        } else {
            mq
        };
    } else {
        // Same sign, non-decreasing magnitude
        bound = false;
        newt = if *brackt {
            cubic_minimizer(*t, ft, dt, y.t, y.f, y.d)
        } else if x.t < *t {
            tmax
        } else {
            tmin
        };
    }

    if x.f < ft {
        *y = trial;
    } else {
        if dsign {
            *y = *x;
        }
        *x = trial;
    }

    newt = newt.clamp(tmin, tmax);

    if *brackt && bound {
        let mq = x.t + 0.66 * (y.t - x.t);
        if x.t < y.t {
            newt = newt.min(mq);
        } else {
            newt = newt.max(mq);
        }
    }

    *t = newt;
    None
}
