/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Exponential backoff with jitter, and a timer driven by it.
//!
//! The default values follow
//! <https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md>.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::Error;
use crate::rt::{BoxedTaskHandle, Runtime};

#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// The amount of time to backoff after the first failure.
    pub base_delay: Duration,

    /// The factor with which to multiply backoffs after a
    /// failed retry. Should ideally be greater than 1.
    pub multiplier: f64,

    /// The factor with which backoffs are randomized.
    pub jitter: f64,

    /// The upper bound of backoff delay.
    pub max_delay: Duration,
}

/// This is a backoff configuration with the default values specified
/// at https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md.
pub const DEFAULT_EXPONENTIAL_CONFIG: BackoffConfig = BackoffConfig {
    base_delay: Duration::from_secs(1),
    multiplier: 1.6,
    jitter: 0.2,
    max_delay: Duration::from_secs(120),
};

impl Default for BackoffConfig {
    fn default() -> Self {
        DEFAULT_EXPONENTIAL_CONFIG
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), Error> {
        // 0 <= base_delay <= max_delay
        if self.base_delay > self.max_delay {
            return Err(Error::InvalidBackoffConfig(
                "base_delay must not be greater than max_delay",
            ));
        }
        // 1 <= multiplier
        if self.multiplier < 1.0 {
            return Err(Error::InvalidBackoffConfig(
                "multiplier must be greater than or equal to 1.0",
            ));
        }
        // 0 <= jitter <= 1
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::InvalidBackoffConfig(
                "jitter must be between 0 and 1 inclusive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,

    /// The delay for the next retry, without the random jitter. Store as f64
    /// to avoid rounding errors.
    next_delay_secs: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        let config = DEFAULT_EXPONENTIAL_CONFIG;
        let next_delay_secs = config.base_delay.as_secs_f64();
        ExponentialBackoff {
            config,
            next_delay_secs,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Result<Self, Error> {
        config.validate()?;
        let next_delay_secs = config.base_delay.as_secs_f64();
        Ok(ExponentialBackoff {
            config,
            next_delay_secs,
        })
    }

    pub fn reset(&mut self) {
        self.next_delay_secs = self.config.base_delay.as_secs_f64();
    }

    /// Returns the jittered delay to wait before the next attempt and advances
    /// the un-jittered delay for the attempt after it.
    pub fn backoff_duration(&mut self) -> Duration {
        let next_delay = self.next_delay_secs;
        let cur_delay =
            next_delay * (1.0 + self.config.jitter * rand::rng().random_range(-1.0..1.0));
        self.next_delay_secs = self
            .config
            .max_delay
            .as_secs_f64()
            .min(next_delay * self.config.multiplier);
        Duration::from_secs_f64(cur_delay.max(0.0))
    }
}

#[derive(Default)]
struct TimerShared {
    // Bumped every time the timer is armed or stopped.  An expiry only runs
    // the handler if the generation it was armed with is still current.
    generation: u64,
    running: bool,
}

/// A timer that waits for exponentially growing, jittered delays between
/// attempts and invokes a handler each time an armed delay expires.
///
/// The handler runs on a runtime task; callers that need serialized access to
/// their own state typically have it enqueue work rather than act directly.
pub struct BackoffTimer {
    backoff: ExponentialBackoff,
    runtime: Arc<dyn Runtime>,
    handler: Arc<dyn Fn() + Send + Sync>,
    shared: Arc<Mutex<TimerShared>>,
    task: Option<BoxedTaskHandle>,
}

impl BackoffTimer {
    pub fn new(
        config: BackoffConfig,
        runtime: Arc<dyn Runtime>,
        handler: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        Ok(Self {
            backoff: ExponentialBackoff::new(config)?,
            runtime,
            handler: Arc::new(handler),
            shared: Arc::default(),
            task: None,
        })
    }

    /// Arms the timer for a single expiry using the current delay, then grows
    /// the delay for the next run.  Does nothing if the timer is already
    /// armed.
    pub fn run_once(&mut self) {
        if self.is_running() {
            return;
        }
        let delay = self.backoff.backoff_duration();
        self.arm(delay);
    }

    /// Restores the initial delay.  If the timer is armed, it is re-armed
    /// with the initial delay.
    pub fn reset(&mut self) {
        self.backoff.reset();
        if self.is_running() {
            let delay = self.backoff.backoff_duration();
            self.arm(delay);
        }
    }

    /// Disarms the timer without invoking the handler.
    pub fn stop(&mut self) {
        {
            let mut shared = self.shared.lock();
            shared.generation += 1;
            shared.running = false;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    fn arm(&mut self, delay: Duration) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let generation = {
            let mut shared = self.shared.lock();
            shared.generation += 1;
            shared.running = true;
            shared.generation
        };
        tracing::trace!("backoff timer armed for {:?}", delay);
        let sleep = self.runtime.sleep(delay);
        let shared = self.shared.clone();
        let handler = self.handler.clone();
        self.task = Some(self.runtime.spawn(Box::pin(async move {
            sleep.await;
            {
                let mut shared = shared.lock();
                if shared.generation != generation {
                    return;
                }
                shared.running = false;
            }
            handler();
        })));
    }
}

impl Drop for BackoffTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
