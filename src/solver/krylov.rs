use tracing::trace;

use super::preconditioner::Preconditioner;
use super::vector::{axpy, dot, l2_norm, residual_into, xpby};
use super::{DivergenceCause, SolverConfig, SolverMethod, SolverStatus};
use crate::operator::LinearSystem;

/// Pivot magnitude below which a Krylov recurrence is considered broken.
const BREAKDOWN: f64 = 1e-300;

/// Per-method recurrence state.
#[derive(Debug)]
enum MethodState<'s> {
    ConjugateResidual {
        r: Vec<f64>,
        p: Vec<f64>,
        ar: Vec<f64>,
        ap: Vec<f64>,
        rar: f64,
    },
    Gmres(Box<GmresState>),
    Pcg {
        r: Vec<f64>,
        z: Vec<f64>,
        p: Vec<f64>,
        ap: Vec<f64>,
        rz: f64,
        preconditioner: Preconditioner<'s>,
    },
}

#[derive(Debug)]
struct GmresState {
    restart: usize,
    basis: Vec<Vec<f64>>,
    /// Columns of the rotated Hessenberg matrix (upper triangular part).
    columns: Vec<Vec<f64>>,
    cs: Vec<f64>,
    sn: Vec<f64>,
    g: Vec<f64>,
    w: Vec<f64>,
}

/// An in-progress linear solve, advanced one iteration at a time.
///
/// `iterate` is the unit timed by the benchmark hooks; [`super::solve`]
/// drives it to completion with cancellation checks in between.
#[derive(Debug)]
pub struct SolveSession<'s> {
    system: &'s LinearSystem,
    config: SolverConfig,
    method: SolverMethod,
    b: Vec<f64>,
    x: Vec<f64>,
    state: MethodState<'s>,
    reference: f64,
    initial_residual: f64,
    residual: f64,
    iterations: usize,
    status: SolverStatus,
    history: Vec<f64>,
}

impl<'s> SolveSession<'s> {
    /// Start a solve of `A x = rhs` from `guess`.
    ///
    /// `rhs` holds the equation right-hand side on unknown rows and the
    /// prescribed values on Dirichlet rows; the guess is overwritten there.
    pub fn new(
        system: &'s LinearSystem,
        rhs: &[f64],
        guess: Vec<f64>,
        config: &SolverConfig,
    ) -> Self {
        Self::with_reference(system, rhs, guess, config, None)
    }

    /// Like [`SolveSession::new`], measuring convergence against a given
    /// reference residual instead of this session's initial one.
    pub(crate) fn with_reference(
        system: &'s LinearSystem,
        rhs: &[f64],
        mut guess: Vec<f64>,
        config: &SolverConfig,
        reference: Option<f64>,
    ) -> Self {
        let n = system.len();
        let b = system.lift(rhs);
        for i in 0..n {
            if !system.is_unknown(i) {
                guess[i] = b[i];
            }
        }

        let mut ax = vec![0.0; n];
        system.apply(&guess, &mut ax);
        let mut r = vec![0.0; n];
        residual_into(&b, &ax, &mut r);
        let r0 = l2_norm(&r);

        let method = config.method.resolve(system);
        let state = match method {
            SolverMethod::Gmres { restart } => {
                MethodState::Gmres(Box::new(GmresState::start(restart.max(1), &r, r0)))
            }
            SolverMethod::Pcg { preconditioner } => {
                let mut preconditioner = Preconditioner::new(preconditioner, system);
                let mut z = vec![0.0; n];
                preconditioner.apply(&r, &mut z);
                let rz = dot(&r, &z);
                MethodState::Pcg {
                    p: z.clone(),
                    r,
                    z,
                    ap: vec![0.0; n],
                    rz,
                    preconditioner,
                }
            }
            // Auto has been resolved above.
            SolverMethod::ConjugateResidual | SolverMethod::Auto => {
                let mut ar = vec![0.0; n];
                system.apply(&r, &mut ar);
                let rar = dot(&r, &ar);
                MethodState::ConjugateResidual {
                    p: r.clone(),
                    ap: ar.clone(),
                    r,
                    ar,
                    rar,
                }
            }
        };

        let reference = reference.unwrap_or(r0);
        let status = if !r0.is_finite() {
            SolverStatus::Diverged(DivergenceCause::NonFinite)
        } else if r0 == 0.0 || r0 < config.tolerance * reference {
            SolverStatus::Converged
        } else if config.max_iterations == 0 {
            SolverStatus::IterationLimitReached
        } else {
            SolverStatus::Running
        };

        Self {
            system,
            config: *config,
            method,
            b,
            x: guess,
            state,
            reference,
            initial_residual: r0,
            residual: r0,
            iterations: 0,
            status,
            history: vec![r0],
        }
    }

    pub fn status(&self) -> SolverStatus {
        self.status
    }

    /// Method actually used, with `Auto` resolved.
    pub fn method(&self) -> SolverMethod {
        self.method
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn residual_norm(&self) -> f64 {
        self.residual
    }

    pub fn initial_residual(&self) -> f64 {
        self.initial_residual
    }

    pub fn residual_history(&self) -> &[f64] {
        &self.history
    }

    /// Current iterate. Only up to date once the session has stopped.
    pub fn solution(&self) -> &[f64] {
        &self.x
    }

    pub(crate) fn into_parts(self) -> (Vec<f64>, Vec<f64>) {
        (self.x, self.history)
    }

    /// Stop a running session, leaving the iterate consistent.
    pub fn cancel(&mut self) {
        if self.status == SolverStatus::Running {
            self.flush();
            self.status = SolverStatus::Diverged(DivergenceCause::Cancelled);
        }
    }

    /// Perform one iteration. A stopped session is left unchanged.
    pub fn iterate(&mut self) -> SolverStatus {
        if self.status != SolverStatus::Running {
            return self.status;
        }
        self.iterations += 1;

        let step = match &mut self.state {
            MethodState::ConjugateResidual { r, p, ar, ap, rar } => {
                conjugate_residual_step(self.system, &mut self.x, r, p, ar, ap, rar)
            }
            MethodState::Pcg {
                r,
                z,
                p,
                ap,
                rz,
                preconditioner,
            } => pcg_step(self.system, preconditioner, &mut self.x, r, z, p, ap, rz),
            MethodState::Gmres(g) => g.step(self.system),
        };

        let (residual, breakdown) = match step {
            Ok(res) => (res, false),
            Err(res) => (res, true),
        };
        self.residual = residual;
        self.history.push(residual);
        trace!(iteration = self.iterations, residual, "solver iteration");

        let tol = self.config.tolerance * self.reference;
        self.status = if !residual.is_finite() {
            SolverStatus::Diverged(DivergenceCause::NonFinite)
        } else if residual < tol {
            SolverStatus::Converged
        } else if breakdown {
            SolverStatus::Diverged(DivergenceCause::Breakdown)
        } else if residual > self.config.divergence_factor * self.reference {
            SolverStatus::Diverged(DivergenceCause::ResidualGrowth)
        } else if self.iterations >= self.config.max_iterations {
            SolverStatus::IterationLimitReached
        } else {
            SolverStatus::Running
        };

        if let MethodState::Gmres(g) = &mut self.state {
            if self.status != SolverStatus::Running || g.cycle_full() {
                g.update_solution(&mut self.x);
                if self.status == SolverStatus::Running {
                    g.restart_from(self.system, &self.b, &self.x);
                }
            }
        }
        if self.status != SolverStatus::Running {
            self.finalize_residual();
        }
        self.status
    }

    fn flush(&mut self) {
        if let MethodState::Gmres(g) = &mut self.state {
            g.update_solution(&mut self.x);
        }
        self.finalize_residual();
    }

    /// Replace the recurrence residual by the true one for reporting.
    fn finalize_residual(&mut self) {
        if !self.residual.is_finite() {
            return;
        }
        let n = self.x.len();
        let mut ax = vec![0.0; n];
        self.system.apply(&self.x, &mut ax);
        let mut r = vec![0.0; n];
        residual_into(&self.b, &ax, &mut r);
        self.residual = l2_norm(&r);
    }
}

/// One conjugate residual step. Returns the new residual norm, or `Err`
/// with the current norm on breakdown.
fn conjugate_residual_step(
    system: &LinearSystem,
    x: &mut [f64],
    r: &mut [f64],
    p: &mut [f64],
    ar: &mut [f64],
    ap: &mut [f64],
    rar: &mut f64,
) -> std::result::Result<f64, f64> {
    let app = dot(ap, ap);
    if app <= BREAKDOWN || rar.abs() <= BREAKDOWN {
        return Err(l2_norm(r));
    }
    let alpha = *rar / app;
    axpy(alpha, p, x);
    axpy(-alpha, ap, r);
    let norm = l2_norm(r);

    system.apply(r, ar);
    let rar_new = dot(r, ar);
    let beta = rar_new / *rar;
    *rar = rar_new;
    xpby(r, beta, p);
    xpby(ar, beta, ap);
    Ok(norm)
}

#[allow(clippy::too_many_arguments)]
fn pcg_step(
    system: &LinearSystem,
    preconditioner: &mut Preconditioner<'_>,
    x: &mut [f64],
    r: &mut [f64],
    z: &mut [f64],
    p: &mut [f64],
    ap: &mut [f64],
    rz: &mut f64,
) -> std::result::Result<f64, f64> {
    system.apply(p, ap);
    let pap = dot(p, ap);
    if pap.is_nan() || pap <= BREAKDOWN || rz.is_nan() || *rz <= BREAKDOWN {
        return Err(l2_norm(r));
    }
    let alpha = *rz / pap;
    axpy(alpha, p, x);
    axpy(-alpha, ap, r);
    let norm = l2_norm(r);

    preconditioner.apply(r, z);
    let rz_new = dot(r, z);
    let beta = rz_new / *rz;
    *rz = rz_new;
    xpby(z, beta, p);
    Ok(norm)
}

impl GmresState {
    fn start(restart: usize, r: &[f64], beta: f64) -> Self {
        let mut g = Self {
            restart,
            basis: Vec::with_capacity(restart + 1),
            columns: Vec::with_capacity(restart),
            cs: Vec::with_capacity(restart),
            sn: Vec::with_capacity(restart),
            g: Vec::with_capacity(restart + 1),
            w: vec![0.0; r.len()],
        };
        g.begin_cycle(r, beta);
        g
    }

    fn begin_cycle(&mut self, r: &[f64], beta: f64) {
        self.basis.clear();
        self.columns.clear();
        self.cs.clear();
        self.sn.clear();
        self.g.clear();
        let scale = if beta > 0.0 { 1.0 / beta } else { 0.0 };
        self.basis.push(r.iter().map(|v| v * scale).collect());
        self.g.push(beta);
    }

    fn cycle_full(&self) -> bool {
        self.columns.len() >= self.restart
    }

    /// One Arnoldi step with modified Gram-Schmidt and Givens update.
    fn step(&mut self, system: &LinearSystem) -> std::result::Result<f64, f64> {
        let j = self.columns.len();
        system.apply(&self.basis[j], &mut self.w);

        let mut h = Vec::with_capacity(j + 2);
        for v in &self.basis {
            let hij = dot(&self.w, v);
            axpy(-hij, v, &mut self.w);
            h.push(hij);
        }
        let h_next = l2_norm(&self.w);
        h.push(h_next);

        for k in 0..j {
            let (c, s) = (self.cs[k], self.sn[k]);
            let (a, b) = (h[k], h[k + 1]);
            h[k] = c * a + s * b;
            h[k + 1] = -s * a + c * b;
        }
        let denom = h[j].hypot(h[j + 1]);
        if denom <= BREAKDOWN {
            return Err(self.g[j].abs());
        }
        let (c, s) = (h[j] / denom, h[j + 1] / denom);
        h[j] = denom;
        h.truncate(j + 1);
        self.cs.push(c);
        self.sn.push(s);
        let gj = self.g[j];
        self.g[j] = c * gj;
        self.g.push(-s * gj);
        self.columns.push(h);

        if h_next > BREAKDOWN {
            let inv = 1.0 / h_next;
            self.basis.push(self.w.iter().map(|v| v * inv).collect());
        } else {
            // Lucky breakdown: the Krylov space is invariant and the
            // least-squares residual is exact.
            self.basis.push(vec![0.0; self.w.len()]);
        }
        Ok(self.g[j + 1].abs())
    }

    /// Back-substitute the triangular system and add the correction to `x`.
    fn update_solution(&mut self, x: &mut [f64]) {
        let k = self.columns.len();
        if k == 0 {
            return;
        }
        let mut y = vec![0.0; k];
        for i in (0..k).rev() {
            let mut s = self.g[i];
            for (jj, yj) in y.iter().enumerate().skip(i + 1) {
                s -= self.columns[jj][i] * yj;
            }
            y[i] = s / self.columns[i][i];
        }
        for (yi, v) in y.iter().zip(&self.basis) {
            axpy(*yi, v, x);
        }
        self.columns.clear();
    }

    fn restart_from(&mut self, system: &LinearSystem, b: &[f64], x: &[f64]) {
        system.apply(x, &mut self.w);
        let r: Vec<f64> = b.iter().zip(&self.w).map(|(bi, ai)| bi - ai).collect();
        let beta = l2_norm(&r);
        self.begin_cycle(&r, beta);
    }
}
