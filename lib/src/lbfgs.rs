//! Limited-memory BFGS, a quasi-Newton method that builds an approximation
//! of the inverse Hessian from the last few gradient differences.
//!
//! The optimizer never evaluates anything itself, it is handed an
//! [`Objective`] that returns the loss and gradient at the current parameters,
//! and may call it several times per [`Lbfgs::step`].

use crate::Error;
use std::collections::VecDeque;

/// The line search strategy used to pick a step length along each search
/// direction
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineSearch {
    /// Always take the fixed step length
    None,
    /// Halve the step length until the Armijo sufficient decrease condition
    /// holds
    Backtracking,
}

impl Default for LineSearch {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Copy, Clone, Debug)]
pub struct LbfgsParams {
    /// The step length
    pub lr: f32,
    /// The maximum number of iterations per step
    pub max_iter: u32,
    /// The maximum number of objective evaluations per step, defaults to
    /// `max_iter * 5 / 4`
    pub max_eval: Option<u32>,
    /// A step stops early once the largest gradient component drops to this
    pub tolerance_grad: f32,
    /// A step stops early once the loss or the parameters change by less
    /// than this
    pub tolerance_change: f32,
    /// The number of curvature pairs kept
    pub history_size: usize,
    pub line_search: LineSearch,
}

impl Default for LbfgsParams {
    fn default() -> Self {
        Self {
            lr: 1.0,
            max_iter: 20,
            max_eval: None,
            tolerance_grad: 1e-7,
            tolerance_change: 1e-9,
            history_size: 100,
            line_search: LineSearch::None,
        }
    }
}

impl LbfgsParams {
    fn max_eval(&self) -> u32 {
        self.max_eval.unwrap_or(self.max_iter * 5 / 4)
    }
}

/// The function being minimized. It's allowed to modify the parameters it is
/// handed, eg to project them back into a feasible region, before computing
/// the loss and gradient.
pub trait Objective {
    fn evaluate(&mut self, params: &mut [f32]) -> Result<(f32, Vec<f32>), Error>;
}

impl<F> Objective for F
where
    F: FnMut(&mut [f32]) -> Result<(f32, Vec<f32>), Error>,
{
    fn evaluate(&mut self, params: &mut [f32]) -> Result<(f32, Vec<f32>), Error> {
        self(params)
    }
}

/// Why a step finished before exhausting its iterations
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The gradient is already small enough
    Optimal,
    /// The search direction isn't a descent direction
    NoDescent,
    /// Every iteration of the step was used
    MaxIterations,
    /// The evaluation budget of the step was used
    MaxEvaluations,
    /// The parameters or the loss stopped changing
    Converged,
}

pub struct Lbfgs {
    params: LbfgsParams,

    direction: Vec<f32>,
    step_length: f32,
    // (s, y, 1 / y.s) curvature pairs, oldest first
    history: VecDeque<(Vec<f32>, Vec<f32>, f32)>,
    hessian_diag: f32,
    prev_grad: Vec<f32>,

    iterations: u64,
    evaluations: u64,
}

impl Lbfgs {
    pub fn new(params: LbfgsParams) -> Self {
        Self {
            params,
            direction: Vec::new(),
            step_length: params.lr,
            history: VecDeque::with_capacity(params.history_size),
            hessian_diag: 1.0,
            prev_grad: Vec::new(),
            iterations: 0,
            evaluations: 0,
        }
    }

    /// The total number of iterations across every step
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// The total number of objective evaluations across every step
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    /// Runs up to `max_iter` iterations, updating `x` in place, and returns
    /// the loss at the parameters the step started from.
    pub fn step<O: Objective>(&mut self, x: &mut [f32], objective: &mut O) -> Result<f32, Error> {
        let (orig_loss, mut grad) = objective.evaluate(x)?;
        self.evaluations += 1;

        let mut loss = orig_loss;
        let mut current_evals = 1;

        if max_abs(&grad) <= self.params.tolerance_grad {
            log::debug!("lbfgs: {:?} before the first iteration", Termination::Optimal);
            return Ok(orig_loss);
        }

        let lr = self.params.lr;
        let max_iter = self.params.max_iter;
        let mut n_iter = 0;

        let termination = loop {
            n_iter += 1;
            self.iterations += 1;

            if self.iterations == 1 {
                self.direction = grad.iter().map(|g| -g).collect();
                self.history.clear();
                self.hessian_diag = 1.0;
            } else {
                self.update_direction(&grad);
            }

            self.prev_grad.clone_from(&grad);
            let prev_loss = loss;

            self.step_length = if self.iterations == 1 {
                let l1: f32 = grad.iter().map(|g| g.abs()).sum();
                (1.0f32).min(1.0 / l1) * lr
            } else {
                lr
            };

            let gtd = dot(&grad, &self.direction);
            if gtd > -self.params.tolerance_change {
                break Termination::NoDescent;
            }

            let mut opt_cond = false;
            let ls_evals = match self.params.line_search {
                LineSearch::None => {
                    axpy(self.step_length, &self.direction, x);

                    if n_iter != max_iter {
                        let (l, g) = objective.evaluate(x)?;
                        loss = l;
                        grad = g;
                        opt_cond = max_abs(&grad) <= self.params.tolerance_grad;
                        1
                    } else {
                        0
                    }
                }
                LineSearch::Backtracking => {
                    let (l, g, t, evals) = self.backtrack(x, objective, loss, gtd)?;
                    loss = l;
                    grad = g;
                    self.step_length = t;
                    opt_cond = max_abs(&grad) <= self.params.tolerance_grad;
                    evals
                }
            };

            current_evals += ls_evals;
            self.evaluations += u64::from(ls_evals);

            if n_iter == max_iter {
                break Termination::MaxIterations;
            }

            if current_evals >= self.params.max_eval() {
                break Termination::MaxEvaluations;
            }

            if opt_cond {
                break Termination::Optimal;
            }

            let max_change = max_abs(&self.direction) * self.step_length.abs();
            if max_change <= self.params.tolerance_change {
                break Termination::Converged;
            }

            if (loss - prev_loss).abs() < self.params.tolerance_change {
                break Termination::Converged;
            }
        };

        log::debug!(
            "lbfgs: step finished after {} iterations ({:?}), loss {} -> {}",
            n_iter,
            termination,
            orig_loss,
            loss
        );

        Ok(orig_loss)
    }

    // two-loop recursion over the curvature history
    fn update_direction(&mut self, grad: &[f32]) {
        let y: Vec<f32> = grad.iter().zip(&self.prev_grad).map(|(g, p)| g - p).collect();
        let s: Vec<f32> = self.direction.iter().map(|d| d * self.step_length).collect();
        let ys = dot(&y, &s);

        if ys > 1e-10 {
            if self.history.len() == self.params.history_size {
                self.history.pop_front();
            }

            self.hessian_diag = ys / dot(&y, &y);
            self.history.push_back((s, y, 1.0 / ys));
        }

        let mut q: Vec<f32> = grad.iter().map(|g| -g).collect();
        let mut alphas = vec![0.0; self.history.len()];

        for (i, (s, y, rho)) in self.history.iter().enumerate().rev() {
            alphas[i] = dot(s, &q) * rho;
            axpy(-alphas[i], y, &mut q);
        }

        let mut r = q;
        r.iter_mut().for_each(|v| *v *= self.hessian_diag);

        for ((s, y, rho), alpha) in self.history.iter().zip(&alphas) {
            let beta = dot(y, &r) * rho;
            axpy(alpha - beta, s, &mut r);
        }

        self.direction = r;
    }

    // Armijo backtracking from `x`, leaving `x` at the accepted point
    fn backtrack<O: Objective>(
        &self,
        x: &mut [f32],
        objective: &mut O,
        loss: f32,
        gtd: f32,
    ) -> Result<(f32, Vec<f32>, f32, u32), Error> {
        const ARMIJO: f32 = 1e-4;

        let x0 = x.to_vec();
        let max_evals = self.params.max_eval().max(1);
        let mut t = self.step_length;
        let mut evals = 0;

        loop {
            x.copy_from_slice(&x0);
            axpy(t, &self.direction, x);

            let (l, g) = objective.evaluate(x)?;
            evals += 1;

            if l <= loss + ARMIJO * t * gtd || evals >= max_evals {
                return Ok((l, g, t, evals));
            }

            t *= 0.5;
        }
    }
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

/// `y += alpha * x`
#[inline]
fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    for (y, x) in y.iter_mut().zip(x) {
        *y += alpha * x;
    }
}

#[inline]
fn max_abs(v: &[f32]) -> f32 {
    v.iter().fold(0.0, |m, x| m.max(x.abs()))
}
