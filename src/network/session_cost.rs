//! Session cost governor.
//!
//! ElectrumX charges every session a "cost" that grows with bandwidth and
//! errors and decays over time; past its soft limit the server throttles,
//! past the hard limit it disconnects. We mirror that counter locally so
//! callers can back off before the server does. Advisory only: nothing here
//! blocks a request.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CostConfig {
    /// Cost added per byte sent or received
    pub cost_per_byte: f64,
    /// Fixed cost added per protocol error
    pub error_penalty: f64,
    /// Amount subtracted on every decay tick
    pub decay_amount: f64,
    pub decay_interval: Duration,
    /// Above this callers should slow down
    pub soft_limit: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        // ElectrumX defaults: 5000 bytes per cost unit, hard limit 10000
        // decaying to zero over an hour.
        Self {
            cost_per_byte: 1.0 / 5000.0,
            error_penalty: 10.0,
            decay_amount: 10_000.0 / 3600.0,
            decay_interval: Duration::from_secs(1),
            soft_limit: 1000.0,
        }
    }
}

pub struct SessionCost {
    cost: Mutex<f64>,
    config: CostConfig,
}

impl SessionCost {
    pub fn new(config: CostConfig) -> Self {
        Self {
            cost: Mutex::new(0.0),
            config,
        }
    }

    pub fn config(&self) -> &CostConfig {
        &self.config
    }

    pub fn bump_cost(&self, amount: f64) {
        *self.cost.lock() += amount;
    }

    pub fn bump_for_bytes(&self, n: usize) {
        self.bump_cost(n as f64 * self.config.cost_per_byte);
    }

    pub fn bump_for_error(&self) {
        self.bump_cost(self.config.error_penalty);
    }

    /// One decay step. Not clamped: negative cost is just headroom.
    pub fn decay(&self) {
        *self.cost.lock() -= self.config.decay_amount;
    }

    pub fn cost(&self) -> f64 {
        *self.cost.lock()
    }

    pub fn over_soft_limit(&self) -> bool {
        self.cost() > self.config.soft_limit
    }

    /// Run the decay tick until `shutdown` fires.
    pub fn spawn_decay(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let governor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(governor.config.decay_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => governor.decay(),
                }
            }
            debug!("session cost decay stopped at {:.2}", governor.cost());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> SessionCost {
        SessionCost::new(CostConfig {
            cost_per_byte: 0.01,
            error_penalty: 5.0,
            decay_amount: 2.0,
            decay_interval: Duration::from_millis(10),
            soft_limit: 6.0,
        })
    }

    #[test]
    fn test_bumps_accumulate() {
        let g = governor();
        g.bump_for_bytes(100);
        g.bump_for_error();
        assert!((g.cost() - 6.0).abs() < 1e-9);
        assert!(!g.over_soft_limit());
        g.bump_cost(0.5);
        assert!(g.over_soft_limit());
    }

    #[test]
    fn test_decay_goes_negative() {
        let g = governor();
        g.bump_cost(1.0);
        g.decay();
        assert!((g.cost() + 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decay_task_ticks_until_cancelled() {
        let g = Arc::new(governor());
        g.bump_cost(100.0);
        let token = CancellationToken::new();
        let handle = g.spawn_decay(token.clone());

        tokio::time::sleep(Duration::from_millis(35)).await;
        token.cancel();
        handle.await.unwrap();

        let after = g.cost();
        assert!(after < 100.0);
        assert!(after >= 100.0 - 4.0 * 2.0);
    }
}
