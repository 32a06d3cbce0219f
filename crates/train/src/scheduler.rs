//! Learning rate and coupling schedules.
//!
//! Both advance once per epoch.

use std::f64::consts::PI;

use entropic_common::{CouplingKind, LrSchedule, RobustConfig};

// ── LR Scheduler ────────────────────────────────────────────────────────────

/// Epoch-level learning rate: linear warmup, then the configured schedule.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    epoch: usize,
    lr: f64,
    warmup_epochs: usize,
    max_epochs: usize,
    schedule: LrSchedule,
}

impl LrScheduler {
    pub fn new(lr: f64, warmup_epochs: usize, max_epochs: usize, schedule: LrSchedule) -> Self {
        Self {
            epoch: 0,
            lr,
            warmup_epochs,
            max_epochs,
            schedule,
        }
    }

    /// Learning rate for the current epoch.
    pub fn current_lr(&self) -> f64 {
        let epoch = self.epoch;

        // Warmup phase: linear ramp from 0, reaching lr at `warmup_epochs`.
        if self.warmup_epochs > 0 && epoch < self.warmup_epochs {
            return self.lr * epoch as f64 / self.warmup_epochs as f64;
        }

        match &self.schedule {
            LrSchedule::Constant => self.lr,
            LrSchedule::MultiStep { milestones, gamma } => {
                let drops = milestones.iter().filter(|&&m| m <= epoch).count();
                self.lr * gamma.powi(drops as i32)
            }
            LrSchedule::Step { step_size, gamma } => {
                let drops = epoch / (*step_size).max(1);
                self.lr * gamma.powi(drops as i32)
            }
            LrSchedule::Cosine { eta_min } => {
                let span = self.max_epochs.saturating_sub(self.warmup_epochs).max(1);
                let progress = ((epoch - self.warmup_epochs) as f64 / span as f64).min(1.0);
                eta_min + 0.5 * (self.lr - eta_min) * (1.0 + (PI * progress).cos())
            }
        }
    }

    pub fn advance(&mut self) {
        self.epoch += 1;
    }

    /// Jump to `epoch` (resumed runs).
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

// ── Coupling Schedule ───────────────────────────────────────────────────────

/// Coupling strength `g(t)` between replicas and center.
///
/// `g0` already includes the `gtime` multiplier. All kinds are capped at
/// `g0 · gmax`.
#[derive(Clone, Debug)]
pub struct CouplingSchedule {
    epoch: usize,
    g0: f64,
    grate: f64,
    gmax: f64,
    gtime: f64,
    tmax: usize,
    kind: CouplingKind,
    balance: bool,
}

impl CouplingSchedule {
    /// `tmax` is the total number of epochs.
    pub fn new(config: &RobustConfig, tmax: usize) -> Self {
        Self {
            epoch: 0,
            g0: config.g.unwrap_or(0.0) * config.gtime,
            grate: config.grate,
            gmax: config.gmax,
            gtime: config.gtime,
            tmax,
            kind: config.gsched,
            balance: config.g.is_none(),
        }
    }

    /// Coupling at epoch `t`.
    pub fn value_at(&self, t: usize) -> f64 {
        let cap = self.g0 * self.gmax;
        match self.kind {
            CouplingKind::Exp => (self.g0 * (1.0 + self.grate).powi(t as i32)).min(cap),
            CouplingKind::Lin => (self.g0 * (1.0 + self.grate * t as f64)).min(cap),
            CouplingKind::Cosine => {
                let progress = if self.tmax == 0 {
                    1.0
                } else {
                    t.min(self.tmax) as f64 / self.tmax as f64
                };
                self.g0 * (1.0 + (self.gmax - 1.0) * (1.0 - (PI * progress).cos()) / 2.0)
            }
        }
    }

    pub fn current(&self) -> f64 {
        self.value_at(self.epoch)
    }

    /// Coupling used while training the next epoch. The cosine schedule runs
    /// one epoch ahead, so the final training epoch reaches `g0 · gmax`.
    pub fn training_value(&self) -> f64 {
        let lead = usize::from(self.kind == CouplingKind::Cosine);
        self.value_at(self.epoch + lead)
    }

    pub fn advance(&mut self) {
        self.epoch += 1;
    }

    pub fn fast_forward(&mut self, epochs: usize) {
        self.epoch += epochs;
    }

    /// Whether `g0` still has to be set by balancing losses at epoch 0.
    pub fn needs_balancing(&self) -> bool {
        self.balance
    }

    /// Replace the initial coupling. `g0` is multiplied by `gtime`.
    pub fn rebase(&mut self, g0: f64) {
        self.g0 = g0 * self.gtime;
        self.balance = false;
    }

    /// Balancing rule: `g0 = train_loss / dist_loss`, zero when the replicas
    /// coincide.
    pub fn balanced_g0(train_loss: f64, dist_loss: f64) -> f64 {
        if dist_loss > 0.0 {
            train_loss / dist_loss
        } else {
            0.0
        }
    }

    /// Set `g0` verbatim (it already includes `gtime`), e.g. from a checkpoint.
    pub fn restore_g0(&mut self, g0: f64) {
        self.g0 = g0;
        self.balance = false;
    }

    pub fn g0(&self) -> f64 {
        self.g0
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn robust(g: Option<f64>, grate: f64, gmax: f64, gsched: CouplingKind) -> RobustConfig {
        RobustConfig {
            replicas: 3,
            g,
            grate,
            gmax,
            gsched,
            gtime: 1.0,
        }
    }

    #[test]
    fn lr_warmup() {
        let mut sched = LrScheduler::new(0.1, 5, 100, LrSchedule::Constant);
        assert_eq!(sched.current_lr(), 0.0);
        sched.set_epoch(1);
        assert!((sched.current_lr() - 0.02).abs() < 1e-12);
        sched.set_epoch(4);
        assert!((sched.current_lr() - 0.08).abs() < 1e-12);
        sched.set_epoch(5);
        assert!((sched.current_lr() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn lr_multistep() {
        let mut sched = LrScheduler::new(
            0.1,
            0,
            100,
            LrSchedule::MultiStep {
                milestones: vec![10, 20],
                gamma: 0.1,
            },
        );
        sched.set_epoch(9);
        assert!((sched.current_lr() - 0.1).abs() < 1e-12);
        sched.advance();
        assert!((sched.current_lr() - 0.01).abs() < 1e-12);
        sched.set_epoch(25);
        assert!((sched.current_lr() - 0.001).abs() < 1e-12);
    }

    #[test]
    fn lr_step_every_two_epochs() {
        let mut sched = LrScheduler::new(1.0, 0, 10, LrSchedule::Step { step_size: 2, gamma: 0.5 });
        sched.set_epoch(5);
        assert!((sched.current_lr() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn lr_cosine_midpoint() {
        let mut sched = LrScheduler::new(1e-3, 0, 100, LrSchedule::Cosine { eta_min: 0.0 });
        for _ in 0..50 {
            sched.advance();
        }
        // cos(π·0.5) = 0 → lr = 0.5 * 1e-3
        assert!((sched.current_lr() - 5e-4).abs() < 1e-9);
        sched.set_epoch(100);
        assert!(sched.current_lr().abs() < 1e-12);
    }

    #[test]
    fn coupling_exp_is_capped() {
        let sched = CouplingSchedule::new(&robust(Some(0.01), 0.5, 10.0, CouplingKind::Exp), 50);
        assert!((sched.value_at(0) - 0.01).abs() < 1e-12);
        assert!((sched.value_at(1) - 0.015).abs() < 1e-12);
        assert!((sched.value_at(40) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn coupling_lin_and_cosine() {
        let lin = CouplingSchedule::new(&robust(Some(1.0), 0.1, 2.0, CouplingKind::Lin), 20);
        assert!((lin.value_at(5) - 1.5).abs() < 1e-12);
        assert!((lin.value_at(50) - 2.0).abs() < 1e-12);

        let cos = CouplingSchedule::new(&robust(Some(1.0), 0.0, 3.0, CouplingKind::Cosine), 10);
        assert!((cos.value_at(0) - 1.0).abs() < 1e-12);
        assert!((cos.value_at(5) - 2.0).abs() < 1e-12);
        assert!((cos.value_at(10) - 3.0).abs() < 1e-12);
        assert!((cos.value_at(30) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn cosine_training_values_lead_by_one_epoch() {
        let mut sched = CouplingSchedule::new(&robust(Some(1.0), 0.0, 3.0, CouplingKind::Cosine), 4);
        let mut used = Vec::new();
        for _ in 0..4 {
            used.push(sched.training_value());
            sched.advance();
        }
        let expected: Vec<f64> = (1..=4)
            .map(|t| 1.0 + (1.0 - (PI * t as f64 / 4.0).cos()))
            .collect();
        for (u, e) in used.iter().zip(&expected) {
            assert!((u - e).abs() < 1e-12, "{used:?} vs {expected:?}");
        }
        assert!((used[3] - 3.0).abs() < 1e-12);

        let exp = CouplingSchedule::new(&robust(Some(0.5), 0.1, 10.0, CouplingKind::Exp), 4);
        assert_eq!(exp.training_value(), exp.current());
    }

    #[test]
    fn coupling_is_monotone_and_bounded() {
        for kind in [CouplingKind::Exp, CouplingKind::Lin, CouplingKind::Cosine] {
            let sched = CouplingSchedule::new(&robust(Some(0.3), 0.2, 4.0, kind), 30);
            let mut prev = 0.0;
            for t in 0..60 {
                let g = sched.value_at(t);
                assert!(g >= prev - 1e-12, "{kind:?} decreased at {t}");
                assert!(g <= 0.3 * 4.0 + 1e-12);
                prev = g;
            }
        }
    }

    #[test]
    fn balancing_and_fast_forward() {
        let mut cfg = robust(None, 0.1, 10.0, CouplingKind::Lin);
        cfg.gtime = 2.0;
        let mut sched = CouplingSchedule::new(&cfg, 10);
        assert!(sched.needs_balancing());
        assert_eq!(sched.current(), 0.0);

        sched.rebase(CouplingSchedule::balanced_g0(2.0, 4.0));
        assert!(!sched.needs_balancing());
        assert!((sched.g0() - 1.0).abs() < 1e-12);

        sched.fast_forward(3);
        sched.advance();
        assert!((sched.current() - 1.4).abs() < 1e-12);
        assert_eq!(CouplingSchedule::balanced_g0(1.0, 0.0), 0.0);
    }
}
