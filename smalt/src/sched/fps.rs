//! Consumer-side FPS regulation.

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct FpsState {
    desired: f64,
    last_delivery: Option<Instant>,
    /// Smoothed achieved FPS.
    achieved: f64,
}

/// Sleeps the consumer to hold a target frame rate and measures what was
/// actually achieved.
pub struct FpsRegulator {
    state: Mutex<FpsState>,
}

impl FpsRegulator {
    pub fn new(desired: f64) -> Self {
        Self {
            state: Mutex::new(FpsState {
                desired: desired.max(0.001),
                last_delivery: None,
                achieved: 0.0,
            }),
        }
    }

    pub fn set_desired(&self, fps: f64) {
        self.state.lock().expect("fps lock").desired = fps.max(0.001);
    }

    pub fn desired(&self) -> f64 {
        self.state.lock().expect("fps lock").desired
    }

    /// Reset pacing at the start of a run.
    pub fn restart(&self) {
        let mut s = self.state.lock().expect("fps lock");
        s.last_delivery = None;
        s.achieved = 0.0;
    }

    /// Pace one delivery: sleep out the remainder of the frame interval,
    /// then return `(achieved, desired)`.
    pub fn regulate(&self) -> (f64, f64) {
        let (interval, last, desired) = {
            let s = self.state.lock().expect("fps lock");
            (
                Duration::from_secs_f64(1.0 / s.desired),
                s.last_delivery,
                s.desired,
            )
        };
        if let Some(last) = last {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }

        let mut s = self.state.lock().expect("fps lock");
        let now = Instant::now();
        if let Some(last) = s.last_delivery {
            let dt = now.duration_since(last).as_secs_f64().max(1e-9);
            let inst = 1.0 / dt;
            s.achieved = if s.achieved == 0.0 {
                inst
            } else {
                s.achieved * 0.8 + inst * 0.2
            };
        }
        s.last_delivery = Some(now);
        (s.achieved, desired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regulation_holds_the_interval() {
        let reg = FpsRegulator::new(100.0);
        reg.restart();
        let start = Instant::now();
        for _ in 0..5 {
            reg.regulate();
        }
        // 4 paced intervals at 10ms each.
        assert!(start.elapsed() >= Duration::from_millis(36));
        let (achieved, desired) = reg.regulate();
        assert_eq!(desired, 100.0);
        assert!(achieved > 0.0);
        assert!(achieved <= 130.0, "achieved {achieved}");
    }
}
