// SPDX-License-Identifier: MPL-2.0

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Shared "don't fetch while rate-limited" gate. Armed whenever the remote
/// source signals throttling; every remote caller (pager, probe, background
/// refresh) checks it before going to the network.
#[derive(Default)]
pub struct RateGate {
    blocked_until: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ok when fetching is allowed, Err with the remaining cooldown when not.
    pub fn check(&self) -> Result<(), Duration> {
        let mut blocked = self.blocked_until.lock().expect("gate lock poisoned");
        match *blocked {
            Some(until) => {
                let now = Instant::now();
                if now < until {
                    Err(until - now)
                } else {
                    *blocked = None;
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.check().is_ok()
    }

    /// Block new remote calls for `cooldown`. Extending an active cooldown
    /// keeps the later deadline.
    pub fn arm(&self, cooldown: Duration) {
        let deadline = Instant::now() + cooldown;
        let mut blocked = self.blocked_until.lock().expect("gate lock poisoned");
        *blocked = Some(match *blocked {
            Some(existing) if existing > deadline => existing,
            _ => deadline,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_open() {
        let gate = RateGate::new();
        assert!(gate.is_open());
    }

    #[test]
    fn armed_gate_blocks_and_reports_remaining() {
        let gate = RateGate::new();
        gate.arm(Duration::from_secs(60));
        let remaining = gate.check().unwrap_err();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(58));
    }

    #[test]
    fn rearming_never_shortens_the_cooldown() {
        let gate = RateGate::new();
        gate.arm(Duration::from_secs(60));
        gate.arm(Duration::from_secs(1));
        let remaining = gate.check().unwrap_err();
        assert!(remaining > Duration::from_secs(30));
    }

    #[test]
    fn expired_cooldown_reopens() {
        let gate = RateGate::new();
        gate.arm(Duration::from_millis(0));
        assert!(gate.is_open());
    }
}
